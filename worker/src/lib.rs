mod context;
pub mod error;
mod host;

use std::sync::Arc;

use log::info;
use rpc::RpcBackendOptions;

pub use error::{Result, WorkerErr};
pub use host::StageHost;

/// The name a worker process joins the world with.
pub fn worker_name(rank: usize) -> String {
    format!("worker{rank}")
}

/// Hosts stages for the master until it shuts the world down.
///
/// # Arguments
/// * `rank` - The rank of this process, never 0.
/// * `world_size` - The amount of processes.
/// * `options` - The rpc backend options.
pub async fn run_worker(rank: usize, world_size: usize, options: RpcBackendOptions) -> Result<()> {
    let host = Arc::new(StageHost::new());
    let agent = rpc::init_rpc(worker_name(rank), rank, world_size, options, host.clone()).await?;
    info!(rank = rank; "hosting stages");

    agent.shutdown().await?;
    info!(rank = rank, live_contexts = host.live_contexts(); "worker finished");
    Ok(())
}
