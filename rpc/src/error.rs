use std::{error::Error, fmt, io};

use comms::specs::rpc::GlobalId;
use ndarray::ShapeError;

/// The rpc module's result type.
pub type Result<T> = std::result::Result<T, RpcErr>;

/// Rpc agent failures.
#[derive(Debug)]
pub enum RpcErr {
    Io(io::Error),
    Timeout {
        to: usize,
        call: &'static str,
    },
    /// The callee ran the call and answered with an error.
    Remote {
        from: usize,
        detail: String,
    },
    /// A local handler failed.
    Handler(String),
    Unsupported(&'static str),
    UnknownWorker(String),
    UnknownRank(usize),
    InvalidRank {
        rank: usize,
        world_size: usize,
    },
    Rendezvous(String),
    ConnectionClosed {
        peer: usize,
    },
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },
    UnexpectedMessage {
        peer: Option<usize>,
        got: &'static str,
    },
    RRefDropped(GlobalId),
    RRefTimeout(GlobalId),
    RRefFailed {
        id: GlobalId,
        detail: String,
    },
    Tensor(ShapeError),
    TaskFailed(String),
}

impl fmt::Display for RpcErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcErr::Io(e) => write!(f, "io error: {e}"),
            RpcErr::Timeout { to, call } => {
                write!(f, "{call} call to rank {to} timed out")
            }
            RpcErr::Remote { from, detail } => write!(f, "rank {from} failed: {detail}"),
            RpcErr::Handler(detail) => write!(f, "handler failed: {detail}"),
            RpcErr::Unsupported(call) => write!(f, "unsupported call {call}"),
            RpcErr::UnknownWorker(name) => write!(f, "unknown worker {name:?}"),
            RpcErr::UnknownRank(rank) => write!(f, "unknown rank {rank}"),
            RpcErr::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is out of a world of size {world_size}")
            }
            RpcErr::Rendezvous(detail) => write!(f, "rendezvous failed: {detail}"),
            RpcErr::ConnectionClosed { peer } => {
                write!(f, "connection to rank {peer} closed")
            }
            RpcErr::UnexpectedReply { expected, got } => {
                write!(f, "unexpected reply: got {got}, expected {expected}")
            }
            RpcErr::UnexpectedMessage { peer: Some(peer), got } => {
                write!(f, "unexpected message from rank {peer}: got {got}")
            }
            RpcErr::UnexpectedMessage { peer: None, got } => {
                write!(f, "unexpected message: got {got}")
            }
            RpcErr::RRefDropped(id) => write!(f, "rref {id} was dropped before being set"),
            RpcErr::RRefTimeout(id) => write!(f, "timed out waiting for rref {id}"),
            RpcErr::RRefFailed { id, detail } => {
                write!(f, "the producer of rref {id} failed: {detail}")
            }
            RpcErr::Tensor(e) => write!(f, "invalid tensor: {e}"),
            RpcErr::TaskFailed(detail) => write!(f, "rpc task failed: {detail}"),
        }
    }
}

impl Error for RpcErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RpcErr::Io(e) => Some(e),
            RpcErr::Tensor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ShapeError> for RpcErr {
    fn from(value: ShapeError) -> Self {
        Self::Tensor(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<RpcErr> for io::Error {
    fn from(value: RpcErr) -> Self {
        match value {
            RpcErr::Io(e) => e,
            RpcErr::Timeout { .. } | RpcErr::RRefTimeout(_) => {
                io::Error::new(io::ErrorKind::TimedOut, value)
            }
            RpcErr::ConnectionClosed { .. } => {
                io::Error::new(io::ErrorKind::ConnectionAborted, value)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
