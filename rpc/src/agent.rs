use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use comms::specs::rpc::{Call, GlobalId, GradFn, PeerSpec, RRef};
use log::{debug, info, warn};
use ndarray::ArrayD;
use tokio::{
    net::TcpListener,
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Result, RpcBackendOptions, RpcErr, RpcHandler, RpcOutput,
    client::Client,
    rendezvous::{self, ControlPlane},
    server,
    store::{RRefStore, StoredValue},
};

/// The rpc endpoint of a process.
///
/// Cloning it is cheap, every clone refers to the same agent.
#[derive(Clone)]
pub struct RpcAgent {
    inner: Arc<Inner>,
}

struct Inner {
    rank: usize,
    name: String,
    peers: Vec<PeerSpec>,
    options: RpcBackendOptions,
    handler: Arc<dyn RpcHandler>,
    store: RRefStore,
    clients: Mutex<HashMap<usize, Arc<Client>>>,
    counter: AtomicU64,
    permits: Semaphore,
    cancel: CancellationToken,
    control: Mutex<Option<ControlPlane>>,
}

/// A call in flight, resolving to its output.
pub struct RpcFuture {
    handle: JoinHandle<Result<RpcOutput>>,
}

impl Future for RpcFuture {
    type Output = Result<RpcOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(RpcErr::TaskFailed(e.to_string()))))
    }
}

impl RpcAgent {
    pub(crate) fn new(
        rank: usize,
        name: String,
        peers: Vec<PeerSpec>,
        options: RpcBackendOptions,
        handler: Arc<dyn RpcHandler>,
        control: ControlPlane,
    ) -> Self {
        let permits = Semaphore::new(options.num_worker_threads.max(1));

        Self {
            inner: Arc::new(Inner {
                rank,
                name,
                peers,
                options,
                handler,
                store: RRefStore::new(),
                clients: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                permits,
                cancel: CancellationToken::new(),
                control: Mutex::new(Some(control)),
            }),
        }
    }

    /// Accepts peer connections until shutdown.
    pub(crate) fn spawn_acceptor(&self, listener: TcpListener) {
        let agent = self.clone();
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(server::serve(agent.clone(), stream));
                        }
                        Err(e) => warn!("failed to accept a peer connection: {e}"),
                    },
                }
            }
        });
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn world_size(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn options(&self) -> &RpcBackendOptions {
        &self.inner.options
    }

    /// The values owned by this process.
    pub fn store(&self) -> &RRefStore {
        &self.inner.store
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Every process of the world, indexed by rank.
    pub fn peers(&self) -> &[PeerSpec] {
        &self.inner.peers
    }

    /// Looks a process up by name.
    pub fn worker_info(&self, name: &str) -> Result<&PeerSpec> {
        self.inner
            .peers
            .iter()
            .find(|peer| peer.name == name)
            .ok_or_else(|| RpcErr::UnknownWorker(name.to_string()))
    }

    /// Allocates an id no other process will ever allocate.
    pub fn next_id(&self) -> GlobalId {
        GlobalId::new(self.inner.rank, self.inner.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Stores `tensor` in this process and returns a reference to it.
    ///
    /// # Arguments
    /// * `tensor` - The value.
    /// * `ctx` - The autograd context owning the value, it's dropped after its first
    ///   fetch when `None`.
    pub fn local_rref(&self, tensor: ArrayD<f32>, ctx: Option<GlobalId>) -> RRef {
        let id = self.next_id();
        let value = StoredValue {
            tensor: Arc::new(tensor),
            grad_fn: None,
        };

        self.inner.store.fulfill(id, ctx, value);
        RRef {
            owner: self.inner.rank,
            id,
        }
    }

    /// Brings the value behind `rref` to this process.
    ///
    /// # Arguments
    /// * `rref` - The value to bring.
    /// * `ctx` - The autograd context of the caller, fetches of released contexts fail.
    ///
    /// # Returns
    /// The tensor and the forward call that produced it, if any.
    pub async fn to_here(
        &self,
        rref: &RRef,
        ctx: Option<GlobalId>,
    ) -> Result<(ArrayD<f32>, Option<GradFn>)> {
        if rref.owner == self.inner.rank {
            let value = self
                .inner
                .store
                .fetch(rref.id, ctx, self.options().timeout())
                .await?;
            return Ok((into_owned(value.tensor), value.grad_fn));
        }

        let call = Call::FetchRef { rref: rref.id, ctx };
        self.rpc_sync(rref.owner, call, None)
            .await?
            .into_value()
    }

    /// Runs `call` on the process `to` and waits for its output.
    ///
    /// # Arguments
    /// * `to` - The rank of the callee, which may be this process.
    /// * `call` - The procedure to run.
    /// * `tensor` - The tensor sent with the call.
    pub async fn rpc_sync(
        &self,
        to: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput> {
        self.call(to, call, tensor, self.options().rpc_timeout)
            .await
    }

    /// Starts running `call` on the process `to`.
    ///
    /// The request is sent right away, awaiting the returned future is only needed
    /// to get the output.
    pub fn rpc_async(&self, to: usize, call: Call, tensor: Option<ArrayD<f32>>) -> RpcFuture {
        self.rpc_async_with_timeout(to, call, tensor, self.options().rpc_timeout)
    }

    /// Same as `rpc_async` with a deadline of its own, zero means none.
    pub fn rpc_async_with_timeout(
        &self,
        to: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
        timeout: Duration,
    ) -> RpcFuture {
        let agent = self.clone();
        let handle = tokio::spawn(async move { agent.call(to, call, tensor, timeout).await });
        RpcFuture { handle }
    }

    /// Starts a call whose output stays on the callee.
    ///
    /// # Arguments
    /// * `to` - The rank of the callee.
    /// * `tensor` - The tensor sent with the call.
    /// * `make_call` - Builds the call given the id its output will be stored under.
    ///
    /// # Returns
    /// A reference to the future output, usable right away, and the call in flight.
    pub fn remote<F>(
        &self,
        to: usize,
        tensor: Option<ArrayD<f32>>,
        make_call: F,
    ) -> (RRef, RpcFuture)
    where
        F: FnOnce(GlobalId) -> Call,
    {
        self.remote_with_timeout(to, tensor, self.options().rpc_timeout, make_call)
    }

    /// Same as `remote` with a deadline of its own, zero means none.
    pub fn remote_with_timeout<F>(
        &self,
        to: usize,
        tensor: Option<ArrayD<f32>>,
        timeout: Duration,
        make_call: F,
    ) -> (RRef, RpcFuture)
    where
        F: FnOnce(GlobalId) -> Call,
    {
        let id = self.next_id();
        let fut = self.rpc_async_with_timeout(to, make_call(id), tensor, timeout);
        (RRef { owner: to, id }, fut)
    }

    async fn call(
        &self,
        to: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
        timeout: Duration,
    ) -> Result<RpcOutput> {
        if to == self.inner.rank {
            return self.dispatch(to, call, tensor).await;
        }

        let client = self.client(to).await?;
        let timeout = (!timeout.is_zero()).then_some(timeout);
        client.call(call, tensor.as_ref(), timeout).await
    }

    /// Runs a call received from `from`, bounded by the worker thread limit.
    ///
    /// Fetches only wait on the store, so they take no permit and can't hold back
    /// the calls producing what they wait for.
    pub(crate) async fn serve_call(
        &self,
        from: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput> {
        if matches!(call, Call::FetchRef { .. }) {
            return self.dispatch(from, call, tensor).await;
        }

        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|e| RpcErr::TaskFailed(e.to_string()))?;

        self.dispatch(from, call, tensor).await
    }

    async fn dispatch(
        &self,
        from: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput> {
        debug!(from = from; "running {}", call.kind());

        match call {
            Call::FetchRef { rref, ctx } => {
                let value = self
                    .inner
                    .store
                    .fetch(rref, ctx, self.options().timeout())
                    .await?;
                Ok(RpcOutput::value(into_owned(value.tensor), value.grad_fn))
            }
            Call::ReleaseContext { ctx } => {
                self.inner.store.release_context(ctx);
                self.inner.handler.handle(self, from, call, tensor).await
            }
            call => self.inner.handler.handle(self, from, call, tensor).await,
        }
    }

    async fn client(&self, to: usize) -> Result<Arc<Client>> {
        let peer = self.inner.peers.get(to).ok_or(RpcErr::UnknownRank(to))?;
        let mut clients = self.inner.clients.lock().await;

        if let Some(client) = clients.get(&to).filter(|client| !client.is_closed()) {
            return Ok(client.clone());
        }

        let client = Arc::new(Client::connect(self.inner.rank, peer).await?);
        clients.insert(to, client.clone());
        Ok(client)
    }

    /// Leaves the world.
    ///
    /// The master tells every worker to stop and waits for all of them, workers block
    /// until the master does so. Calling it again does nothing.
    pub async fn shutdown(&self) -> Result<()> {
        let control = self.inner.control.lock().await.take();

        match control {
            Some(ControlPlane::Master(workers)) => rendezvous::shutdown_workers(workers).await?,
            Some(ControlPlane::Worker(conn)) => rendezvous::await_shutdown(conn).await?,
            None => return Ok(()),
        }

        self.inner.cancel.cancel();
        self.inner.clients.lock().await.clear();
        info!(rank = self.inner.rank; "rpc agent shut down");
        Ok(())
    }
}

fn into_owned(tensor: Arc<ArrayD<f32>>) -> ArrayD<f32> {
    Arc::try_unwrap(tensor).unwrap_or_else(|shared| (*shared).clone())
}
