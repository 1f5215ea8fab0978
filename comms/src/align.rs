/// Element types of receive buffers.
///
/// Their alignment is at least the one of `f32`, so a frame body read into them can
/// be viewed as tensor data in place.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for f32 {}
