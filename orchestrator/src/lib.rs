//! The master side of pipeline-parallel training: the pipeline driver, distributed
//! autograd and optimizer, and the training loop.

mod autograd;
pub mod configs;
pub mod error;
mod master;
mod optimizer;
mod pipeline;

pub use autograd::DistAutogradContext;
pub use error::{OrchestratorError, Result};
pub use master::{Trainer, run_master};
pub use optimizer::DistributedOptimizer;
pub use pipeline::{DistNet, OutputPart, PipelineOutput};
