use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};

use super::machine_learning::{ModuleSpec, OptimizerSpec};

/// An identifier that is unique across every process of a run.
///
/// The upper bits hold the rank of the process that allocated it, the lower bits a
/// per process counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u64);

impl GlobalId {
    const RANK_SHIFT: u32 = 48;
    const LOCAL_MASK: u64 = (1 << Self::RANK_SHIFT) - 1;

    /// Creates a new `GlobalId`.
    ///
    /// # Arguments
    /// * `rank` - The rank of the allocating process.
    /// * `local` - A value never repeated by that process.
    pub fn new(rank: usize, local: u64) -> Self {
        Self(((rank as u64) << Self::RANK_SHIFT) | (local & Self::LOCAL_MASK))
    }

    /// Returns the rank of the process that allocated this id.
    pub fn rank(self) -> usize {
        (self.0 >> Self::RANK_SHIFT) as usize
    }

    /// Returns the per process part of this id.
    pub fn local(self) -> u64 {
        self.0 & Self::LOCAL_MASK
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank(), self.local())
    }
}

/// A remote reference: the value `id` lives in the process with rank `owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RRef {
    pub owner: usize,
    pub id: GlobalId,
}

/// Points at the forward call that produced a tensor, so its gradient can be sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GradFn {
    pub owner: usize,
    pub call: GlobalId,
}

/// A reference to a single parameter tensor of a hosted module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamRef {
    pub owner: usize,
    pub module: GlobalId,
    pub index: usize,
    pub len: usize,
}

/// A process as announced by the rendezvous roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub rank: usize,
    pub name: String,
    pub addr: SocketAddr,
}

/// Every procedure a process can be asked to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    /// Waits for the value behind `rref` and returns it with its `GradFn`.
    ///
    /// `ctx` is the autograd context of the fetching call.
    FetchRef {
        rref: GlobalId,
        ctx: Option<GlobalId>,
    },
    /// Builds a module and registers it under `module`.
    Construct { module: GlobalId, spec: ModuleSpec },
    /// Runs `module` over the value behind `input`.
    ///
    /// The output is kept by the callee under `output` when present, otherwise it is
    /// returned in the response. Within a context the call is recorded as `call`.
    Forward {
        module: GlobalId,
        ctx: Option<GlobalId>,
        input: RRef,
        output: Option<GlobalId>,
        call: GlobalId,
    },
    /// Propagates the gradient in the request tensor through the recorded `call`.
    Backward { ctx: GlobalId, call: GlobalId },
    ParameterRefs { module: GlobalId },
    CreateOptimizer {
        optimizer: GlobalId,
        spec: OptimizerSpec,
        params: Vec<ParamRef>,
    },
    OptimizerStep { optimizer: GlobalId, ctx: GlobalId },
    ReleaseContext { ctx: GlobalId },
}

impl Call {
    /// A short name of the call, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Call::FetchRef { .. } => "fetch_ref",
            Call::Construct { .. } => "construct",
            Call::Forward { .. } => "forward",
            Call::Backward { .. } => "backward",
            Call::ParameterRefs { .. } => "parameter_refs",
            Call::CreateOptimizer { .. } => "create_optimizer",
            Call::OptimizerStep { .. } => "optimizer_step",
            Call::ReleaseContext { .. } => "release_context",
        }
    }
}

/// The outcome of a `Call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ack,
    /// The response carries a tensor.
    Value { grad_fn: Option<GradFn> },
    Params { params: Vec<ParamRef> },
    Err { detail: String },
}

impl Reply {
    /// A short name of the reply, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Value { .. } => "value",
            Reply::Params { .. } => "params",
            Reply::Err { .. } => "err",
        }
    }
}
