pub mod arch;
pub mod batch;
pub mod error;
pub mod initialization;
pub mod optimization;
mod test;
pub mod zoo;

pub use error::{MlErr, Result};
