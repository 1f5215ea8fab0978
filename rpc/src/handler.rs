use async_trait::async_trait;
use comms::specs::rpc::{Call, GradFn, ParamRef, Reply};
use ndarray::ArrayD;

use crate::{Result, RpcAgent, RpcErr};

/// The answer of a call, a reply and the tensor travelling with it.
#[derive(Debug)]
pub struct RpcOutput {
    pub reply: Reply,
    pub tensor: Option<ArrayD<f32>>,
}

impl RpcOutput {
    pub fn ack() -> Self {
        Self {
            reply: Reply::Ack,
            tensor: None,
        }
    }

    pub fn value(tensor: ArrayD<f32>, grad_fn: Option<GradFn>) -> Self {
        Self {
            reply: Reply::Value { grad_fn },
            tensor: Some(tensor),
        }
    }

    pub fn params(params: Vec<ParamRef>) -> Self {
        Self {
            reply: Reply::Params { params },
            tensor: None,
        }
    }

    /// Unwraps an `Ack` reply.
    pub fn into_ack(self) -> Result<()> {
        match self.reply {
            Reply::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    /// Unwraps a `Value` reply into its tensor and `GradFn`.
    pub fn into_value(self) -> Result<(ArrayD<f32>, Option<GradFn>)> {
        match (self.reply, self.tensor) {
            (Reply::Value { grad_fn }, Some(tensor)) => Ok((tensor, grad_fn)),
            (Reply::Value { .. }, None) => Err(RpcErr::UnexpectedReply {
                expected: "value",
                got: "value without tensor",
            }),
            (other, _) => Err(unexpected("value", &other)),
        }
    }

    /// Unwraps a `Params` reply.
    pub fn into_params(self) -> Result<Vec<ParamRef>> {
        match self.reply {
            Reply::Params { params } => Ok(params),
            other => Err(unexpected("params", &other)),
        }
    }
}

fn unexpected(expected: &'static str, got: &Reply) -> RpcErr {
    RpcErr::UnexpectedReply {
        expected,
        got: got.kind(),
    }
}

/// Runs the calls a process receives.
///
/// `FetchRef` is answered by the agent itself and never reaches the handler,
/// `ReleaseContext` reaches it after the agent dropped the context values.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Runs a single call.
    ///
    /// # Arguments
    /// * `agent` - The local agent, to issue nested calls.
    /// * `from` - The rank of the caller.
    /// * `call` - The procedure to run.
    /// * `tensor` - The tensor sent with the call.
    ///
    /// # Returns
    /// The output of the call or an error, which is sent back to the caller.
    async fn handle(
        &self,
        agent: &RpcAgent,
        from: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput>;
}

/// A handler for processes that host nothing, like the master.
pub struct NoopHandler;

#[async_trait]
impl RpcHandler for NoopHandler {
    async fn handle(
        &self,
        _agent: &RpcAgent,
        _from: usize,
        call: Call,
        _tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput> {
        match call {
            Call::ReleaseContext { .. } => Ok(RpcOutput::ack()),
            call => Err(RpcErr::Unsupported(call.kind())),
        }
    }
}
