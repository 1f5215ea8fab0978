//! The calling side of a peer connection.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg, Request, Response, Tensor},
    specs::rpc::{Call, PeerSpec, Reply},
};
use log::{debug, warn};
use ndarray::ArrayD;
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{self, oneshot},
    task::JoinHandle,
};

use crate::{Result, RpcErr, RpcOutput, msg_kind, tensor};

/// The calls waiting for a response, `None` once the connection is gone.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Result<RpcOutput>>>>>>;

/// A connection to a single peer, shared by every call to it.
pub(crate) struct Client {
    peer: usize,
    tx: sync::Mutex<WireSender<OwnedWriteHalf>>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Client {
    /// Opens a connection to `peer` and introduces this process to it.
    ///
    /// # Arguments
    /// * `me` - The rank of this process.
    /// * `peer` - The process to connect to.
    pub async fn connect(me: usize, peer: &PeerSpec) -> Result<Self> {
        let stream = TcpStream::connect(peer.addr).await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (rx, mut tx) = comms::channel(rx, tx);
        tx.send(&Msg::Control(Command::Hello { rank: me })).await?;

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_responses(peer.rank, rx, pending.clone()));
        debug!(peer = peer.rank; "connected to {}", peer.addr);

        Ok(Self {
            peer: peer.rank,
            tx: sync::Mutex::new(tx),
            pending,
            next_id: AtomicU64::new(0),
            reader,
        })
    }

    /// Whether the peer closed the connection.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Sends a request and waits for its response.
    ///
    /// # Arguments
    /// * `call` - The procedure to run on the peer.
    /// * `tensor` - The tensor to send with it.
    /// * `timeout` - The deadline of the response, `None` waits forever.
    pub async fn call(
        &self,
        call: Call,
        tensor: Option<&ArrayD<f32>>,
        timeout: Option<Duration>,
    ) -> Result<RpcOutput> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = call.kind();
        let (done_tx, done_rx) = oneshot::channel();

        match self.pending.lock().as_mut() {
            Some(pending) => pending.insert(id, done_tx),
            None => return Err(RpcErr::ConnectionClosed { peer: self.peer }),
        };

        debug!(peer = self.peer, id = id; "sending {kind}");
        if let Err(e) = self.send(id, call, tensor).await {
            self.forget(id);
            return Err(e);
        }

        let done = match timeout {
            Some(duration) => match tokio::time::timeout(duration, done_rx).await {
                Ok(done) => done,
                Err(_) => {
                    self.forget(id);
                    return Err(RpcErr::Timeout {
                        to: self.peer,
                        call: kind,
                    });
                }
            },
            None => done_rx.await,
        };

        done.map_err(|_| RpcErr::ConnectionClosed { peer: self.peer })?
    }

    async fn send(&self, id: u64, call: Call, tensor: Option<&ArrayD<f32>>) -> Result<()> {
        let layout = tensor.map(tensor::standard);
        let msg = Msg::Request(Request {
            id,
            call,
            tensor: layout.as_ref().and_then(tensor::to_wire),
        });

        self.tx.lock().await.send(&msg).await?;
        Ok(())
    }

    fn forget(&self, id: u64) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&id);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Hands every response to the call waiting for it until the connection closes.
async fn read_responses(peer: usize, mut rx: WireReceiver<OwnedReadHalf>, pending: Pending) {
    let mut buf: Vec<f32> = Vec::new();

    loop {
        let msg = match rx.recv_into(&mut buf).await {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!(peer = peer; "connection failed: {e}");
                break;
            }
        };

        match msg {
            Msg::Response(Response { id, reply, tensor }) => {
                let output = into_output(peer, reply, tensor);
                let waiter = pending.lock().as_mut().and_then(|p| p.remove(&id));

                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(output);
                    }
                    None => debug!(peer = peer, id = id; "nobody waits for this response"),
                }
            }
            other => warn!(peer = peer; "expected a response, got {}", msg_kind(&other)),
        }
    }

    debug!(peer = peer; "connection closed");
    // Dropping the senders fails every call still waiting.
    pending.lock().take();
}

fn into_output(peer: usize, reply: Reply, tensor: Option<Tensor<'_>>) -> Result<RpcOutput> {
    match reply {
        Reply::Err { detail } => Err(RpcErr::Remote { from: peer, detail }),
        reply => Ok(RpcOutput {
            reply,
            tensor: tensor.map(tensor::from_wire).transpose()?,
        }),
    }
}
