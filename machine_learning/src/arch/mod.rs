mod builder;
pub mod layers;
pub mod loss;
mod sequential;

pub use builder::ModuleBuilder;
pub use sequential::{ForwardCache, Sequential};
