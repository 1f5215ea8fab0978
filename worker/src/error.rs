use std::{error::Error, fmt, io};

use comms::specs::rpc::GlobalId;
use machine_learning::MlErr;
use rpc::RpcErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Stage host failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Rpc(RpcErr),
    Ml(MlErr),
    UnknownModule(GlobalId),
    UnknownOptimizer(GlobalId),
    UnknownCall {
        ctx: GlobalId,
        call: GlobalId,
    },
    DuplicateId(GlobalId),
    MissingTensor {
        call: &'static str,
    },
    ForeignParam {
        owner: usize,
        rank: usize,
    },
    InvalidParam {
        module: GlobalId,
        index: usize,
    },
    UnexpectedCall(&'static str),
    Task(String),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Rpc(e) => write!(f, "rpc error: {e}"),
            WorkerErr::Ml(e) => write!(f, "stage error: {e}"),
            WorkerErr::UnknownModule(id) => write!(f, "no module {id} is hosted here"),
            WorkerErr::UnknownOptimizer(id) => write!(f, "no optimizer {id} is hosted here"),
            WorkerErr::UnknownCall { ctx, call } => {
                write!(f, "call {call} was never recorded in context {ctx}")
            }
            WorkerErr::DuplicateId(id) => write!(f, "id {id} is already taken"),
            WorkerErr::MissingTensor { call } => write!(f, "{call} needs a tensor"),
            WorkerErr::ForeignParam { owner, rank } => write!(
                f,
                "parameter owned by rank {owner} can't be optimized on rank {rank}"
            ),
            WorkerErr::InvalidParam { module, index } => {
                write!(f, "module {module} has no parameter {index}")
            }
            WorkerErr::UnexpectedCall(call) => write!(f, "unexpected call {call}"),
            WorkerErr::Task(detail) => write!(f, "stage task failed: {detail}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Rpc(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<RpcErr> for WorkerErr {
    fn from(value: RpcErr) -> Self {
        Self::Rpc(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

/// Hands stage failures back to the agent, which sends them to the caller.
impl From<WorkerErr> for RpcErr {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Rpc(e) => e,
            WorkerErr::Io(e) => RpcErr::Io(e),
            other => RpcErr::Handler(other.to_string()),
        }
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            WorkerErr::Rpc(e) => e.into(),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
