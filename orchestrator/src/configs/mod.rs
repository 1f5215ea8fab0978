mod adapter;
mod run;

pub use adapter::Adapter;
pub use run::{CONFIG_ENV, RunConfig, parse_var};
