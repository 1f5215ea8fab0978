use std::time::Duration;

/// The backend settings of an rpc agent.
#[derive(Debug, Clone)]
pub struct RpcBackendOptions {
    /// `host:port` where rank 0 listens for the rendezvous.
    pub master_addr: String,
    /// Host the non zero ranks bind their listener to.
    pub listen_host: String,
    /// Amount of requests a process serves at the same time.
    pub num_worker_threads: usize,
    /// Deadline of every call, zero means none.
    pub rpc_timeout: Duration,
    /// Deadline of the rendezvous.
    pub init_timeout: Duration,
}

impl RpcBackendOptions {
    pub const DEFAULT_NUM_WORKER_THREADS: usize = 256;
    pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(600);

    /// Creates options with the defaults for everything but the master address.
    pub fn new(master_addr: impl Into<String>) -> Self {
        Self {
            master_addr: master_addr.into(),
            ..Default::default()
        }
    }

    /// The call deadline, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (!self.rpc_timeout.is_zero()).then_some(self.rpc_timeout)
    }
}

impl Default for RpcBackendOptions {
    fn default() -> Self {
        Self {
            master_addr: "localhost:29500".into(),
            listen_host: "127.0.0.1".into(),
            num_worker_threads: Self::DEFAULT_NUM_WORKER_THREADS,
            rpc_timeout: Self::DEFAULT_RPC_TIMEOUT,
            init_timeout: Duration::from_secs(60),
        }
    }
}
