//! A small rpc framework over tokio TCP: rank rendezvous, request/response calls
//! between every pair of processes and remote references to tensors.

mod agent;
mod client;
mod error;
mod handler;
mod options;
mod rendezvous;
mod server;
pub mod store;
mod tensor;

use std::sync::Arc;

use comms::msg::{Command, Msg};
use log::info;

pub use agent::{RpcAgent, RpcFuture};
pub use error::{Result, RpcErr};
pub use handler::{NoopHandler, RpcHandler, RpcOutput};
pub use options::RpcBackendOptions;

/// Joins the world and starts serving calls.
///
/// Rank 0 is the master: it listens on the master address until the other
/// `world_size - 1` ranks joined. Every other rank dials it, retrying until the
/// init timeout elapses.
///
/// # Arguments
/// * `name` - The name of this process, unique in the world.
/// * `rank` - The rank of this process.
/// * `world_size` - The amount of processes.
/// * `options` - The backend options.
/// * `handler` - Runs the calls this process receives.
///
/// # Returns
/// The agent of this process.
pub async fn init_rpc(
    name: impl Into<String>,
    rank: usize,
    world_size: usize,
    options: RpcBackendOptions,
    handler: Arc<dyn RpcHandler>,
) -> Result<RpcAgent> {
    if rank >= world_size {
        return Err(RpcErr::InvalidRank { rank, world_size });
    }

    let name = name.into();
    let rendezvous = match rank {
        0 => rendezvous::master(&name, world_size, &options).await?,
        _ => rendezvous::worker(&name, rank, world_size, &options).await?,
    };

    let agent = RpcAgent::new(
        rank,
        name,
        rendezvous.peers,
        options,
        handler,
        rendezvous.control,
    );
    agent.spawn_acceptor(rendezvous.listener);

    info!(rank = rank, world_size = world_size; "rpc agent ready");
    Ok(agent)
}

pub(crate) fn msg_kind(msg: &Msg<'_>) -> &'static str {
    match msg {
        Msg::Control(Command::Join { .. }) => "join",
        Msg::Control(Command::Roster { .. }) => "roster",
        Msg::Control(Command::Hello { .. }) => "hello",
        Msg::Control(Command::Shutdown) => "shutdown",
        Msg::Control(Command::Disconnect) => "disconnect",
        Msg::Request(_) => "request",
        Msg::Response(_) => "response",
        Msg::Err(_) => "err",
    }
}
