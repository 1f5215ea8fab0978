mod conv2d;
mod dropout;
mod flatten;
mod layer;
mod linear;
mod max_pool;
mod relu;

pub use conv2d::Conv2d;
pub use dropout::Dropout;
pub use flatten::Flatten;
pub use layer::{Layer, LayerCache};
pub use linear::Linear;
pub use max_pool::MaxPool2d;
pub use relu::Relu;
