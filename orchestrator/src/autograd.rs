use comms::specs::rpc::{Call, GlobalId};
use futures::future::try_join_all;
use log::debug;
use machine_learning::MlErr;
use ndarray::{ArrayViewD, Axis};
use rpc::RpcAgent;

use crate::{
    error::{OrchestratorError, Result},
    pipeline::PipelineOutput,
};

/// A distributed autograd context.
///
/// Every forward call run within it is recorded by the stage that ran it, until the
/// context is released on every rank.
pub struct DistAutogradContext {
    agent: RpcAgent,
    id: GlobalId,
}

impl DistAutogradContext {
    /// Opens a new context.
    pub fn new(agent: RpcAgent) -> Self {
        let id = agent.next_id();
        debug!("opened autograd context {id}");
        Self { agent, id }
    }

    pub fn id(&self) -> GlobalId {
        self.id
    }

    /// Runs the backward pass of `output` starting from the gradient `d`.
    ///
    /// The gradient is split the same way the batch was, and every micro-batch goes
    /// backward through the stages at the same time.
    ///
    /// # Arguments
    /// * `output` - The output of a forward pass run within this context.
    /// * `d` - The gradient of the loss with respect to `output.value`.
    pub async fn backward(&self, output: &PipelineOutput, d: ArrayViewD<'_, f32>) -> Result<()> {
        let rows: usize = output.parts.iter().map(|part| part.rows).sum();
        if d.shape() != output.value.shape() || d.len_of(Axis(0)) != rows {
            return Err(MlErr::InvalidShape {
                layer: "autograd",
                got: d.shape().to_vec(),
            }
            .into());
        }

        let mut rest = d;
        let mut calls = Vec::with_capacity(output.parts.len());
        for (i, part) in output.parts.iter().enumerate() {
            let grad_fn = part.grad_fn.ok_or(OrchestratorError::NotRecorded { part: i })?;
            let (head, tail) = rest.split_at(Axis(0), part.rows);
            rest = tail;

            let call = Call::Backward {
                ctx: self.id,
                call: grad_fn.call,
            };
            calls.push(self.agent.rpc_async(grad_fn.owner, call, Some(head.to_owned())));
        }

        for output in try_join_all(calls).await? {
            output.into_ack()?;
        }

        Ok(())
    }

    /// Forgets the context on every rank, this one included.
    pub async fn release(self) -> Result<()> {
        let calls = (0..self.agent.world_size()).map(|rank| {
            self.agent
                .rpc_async(rank, Call::ReleaseContext { ctx: self.id }, None)
        });

        for output in try_join_all(calls).await? {
            output.into_ack()?;
        }

        debug!("released autograd context {}", self.id);
        Ok(())
    }
}
