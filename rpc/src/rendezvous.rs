//! Rank discovery through the master and the shutdown handshake.

use std::{collections::BTreeMap, io, time::Duration};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg},
    specs::rpc::PeerSpec,
};
use futures::future;
use log::{debug, info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::Instant,
};

use crate::{Result, RpcBackendOptions, RpcErr, msg_kind};

const DIAL_RETRY: Duration = Duration::from_millis(100);

/// The connection between the master and a worker, kept for the shutdown handshake.
pub(crate) type Conn = (WireReceiver<OwnedReadHalf>, WireSender<OwnedWriteHalf>);

pub(crate) enum ControlPlane {
    Master(Vec<(usize, Conn)>),
    Worker(Conn),
}

/// Everything a process learns while joining the world.
pub(crate) struct Rendezvous {
    pub listener: TcpListener,
    pub peers: Vec<PeerSpec>,
    pub control: ControlPlane,
}

/// Listens on the master address until every other rank joined, then sends them the roster.
///
/// # Arguments
/// * `name` - The name of the master process.
/// * `world_size` - The amount of processes, the master included.
/// * `options` - The backend options.
pub(crate) async fn master(
    name: &str,
    world_size: usize,
    options: &RpcBackendOptions,
) -> Result<Rendezvous> {
    let listener = TcpListener::bind(&options.master_addr).await?;
    let addr = listener.local_addr()?;
    info!(world_size = world_size; "master listening at {addr}");

    let joined = tokio::time::timeout(options.init_timeout, collect_joins(&listener, world_size))
        .await
        .map_err(|_| {
            RpcErr::Rendezvous(format!(
                "not every rank joined within {:?}",
                options.init_timeout
            ))
        })??;

    let mut peers = vec![PeerSpec {
        rank: 0,
        name: name.to_string(),
        addr,
    }];
    let mut conns = Vec::with_capacity(joined.len());
    for (peer, conn) in joined {
        conns.push((peer.rank, conn));
        peers.push(peer);
    }

    let roster = Msg::Control(Command::Roster {
        peers: peers.clone(),
    });
    for (_, (_, tx)) in conns.iter_mut() {
        tx.send(&roster).await?;
    }

    info!(world_size = world_size; "every rank joined");
    Ok(Rendezvous {
        listener,
        peers,
        control: ControlPlane::Master(conns),
    })
}

async fn collect_joins(
    listener: &TcpListener,
    world_size: usize,
) -> Result<Vec<(PeerSpec, Conn)>> {
    let mut joined = BTreeMap::new();
    let mut buf: Vec<u32> = Vec::new();

    while joined.len() + 1 < world_size {
        let (stream, from) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = comms::channel(rx, tx);

        match rx.recv_into(&mut buf).await {
            Ok(Msg::Control(Command::Join { rank, name, addr })) => {
                if rank == 0 || rank >= world_size {
                    return Err(RpcErr::InvalidRank { rank, world_size });
                }

                if joined.contains_key(&rank) {
                    return Err(RpcErr::Rendezvous(format!("rank {rank} joined twice")));
                }

                debug!(rank = rank; "{name} joined from {from}");
                joined.insert(rank, (PeerSpec { rank, name, addr }, (rx, tx)));
            }
            Ok(other) => warn!("expected Join from {from}, got {}", msg_kind(&other)),
            Err(e) => warn!("failed to read Join from {from}: {e}"),
        }
    }

    Ok(joined.into_values().collect())
}

/// Binds an ephemeral listener, joins the master and waits for the roster.
///
/// # Arguments
/// * `name` - The name of this process.
/// * `rank` - The rank of this process.
/// * `world_size` - The amount of processes, the master included.
/// * `options` - The backend options.
pub(crate) async fn worker(
    name: &str,
    rank: usize,
    world_size: usize,
    options: &RpcBackendOptions,
) -> Result<Rendezvous> {
    let listener = TcpListener::bind((options.listen_host.as_str(), 0)).await?;
    let addr = listener.local_addr()?;
    let deadline = Instant::now() + options.init_timeout;

    let stream = dial(&options.master_addr, deadline).await?;
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);

    let join = Msg::Control(Command::Join {
        rank,
        name: name.to_string(),
        addr,
    });
    tx.send(&join).await?;
    debug!(rank = rank; "joined the master, waiting for the roster");

    let mut buf: Vec<u32> = Vec::new();
    let roster = tokio::time::timeout_at(deadline, rx.recv_into(&mut buf))
        .await
        .map_err(|_| RpcErr::Rendezvous("the roster never arrived".into()))??;

    let peers = match roster {
        Msg::Control(Command::Roster { peers }) => peers,
        other => {
            return Err(RpcErr::UnexpectedMessage {
                peer: Some(0),
                got: msg_kind(&other),
            });
        }
    };

    let complete =
        peers.len() == world_size && peers.iter().enumerate().all(|(i, p)| p.rank == i);
    if !complete {
        return Err(RpcErr::Rendezvous(format!(
            "received a roster of {} ranks for a world of size {world_size}",
            peers.len()
        )));
    }

    Ok(Rendezvous {
        listener,
        peers,
        control: ControlPlane::Worker((rx, tx)),
    })
}

async fn dial(addr: &str, deadline: Instant) -> Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!("master at {addr} not reachable yet: {e}");
                tokio::time::sleep(DIAL_RETRY).await;
            }
            Err(e) => {
                return Err(RpcErr::Rendezvous(format!(
                    "could not reach the master at {addr}: {e}"
                )));
            }
        }
    }
}

/// Tells every worker to stop and waits until all of them disconnected.
pub(crate) async fn shutdown_workers(workers: Vec<(usize, Conn)>) -> Result<()> {
    let waits = workers.into_iter().map(|(rank, (mut rx, mut tx))| async move {
        tx.send(&Msg::Control(Command::Shutdown)).await?;

        let mut buf: Vec<u32> = Vec::new();
        loop {
            match rx.recv_into(&mut buf).await {
                Ok(Msg::Control(Command::Disconnect)) => break,
                Ok(other) => warn!(rank = rank; "expected Disconnect, got {}", msg_kind(&other)),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(rank = rank; "worker left without disconnecting");
                    break;
                }
                Err(e) => return Err(RpcErr::from(e)),
            }
        }

        debug!(rank = rank; "worker disconnected");
        Ok::<_, RpcErr>(())
    });

    future::try_join_all(waits).await?;
    Ok(())
}

/// Blocks until the master asks to stop, then acknowledges it.
pub(crate) async fn await_shutdown((mut rx, mut tx): Conn) -> Result<()> {
    let mut buf: Vec<u32> = Vec::new();

    loop {
        match rx.recv_into(&mut buf).await? {
            Msg::Control(Command::Shutdown) => break,
            other => warn!("expected Shutdown, got {}", msg_kind(&other)),
        }
    }

    tx.send(&Msg::Control(Command::Disconnect)).await?;
    Ok(())
}
