use std::{fmt, io};

use machine_learning::MlErr;
use rpc::RpcErr;

/// The orchestrator module's result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors that can occur in the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before any process is contacted.
    InvalidConfig(String),
    /// A call to a stage failed.
    Rpc(RpcErr),
    /// The loss or the micro-batch bookkeeping failed.
    Ml(MlErr),
    /// A micro-batch output has no gradient function, its forward wasn't recorded.
    NotRecorded { part: usize },
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Rpc(e) => write!(f, "rpc error: {e}"),
            Self::Ml(e) => write!(f, "training error: {e}"),
            Self::NotRecorded { part } => write!(
                f,
                "micro-batch {part} was not run within an autograd context"
            ),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "invalid config file: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            Self::Ml(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<RpcErr> for OrchestratorError {
    fn from(e: RpcErr) -> Self {
        Self::Rpc(e)
    }
}

impl From<MlErr> for OrchestratorError {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<OrchestratorError> for io::Error {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Io(e) => e,
            OrchestratorError::Rpc(e) => e.into(),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
