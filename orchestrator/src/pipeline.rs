//! The pipeline driver: four remote stages fed micro-batch by micro-batch.

use std::{num::NonZeroUsize, time::Duration};

use comms::specs::rpc::{Call, GlobalId, GradFn, ParamRef, RRef};
use futures::future::try_join_all;
use log::{debug, info};
use machine_learning::{
    batch,
    zoo::{self, Arch, NUM_STAGES, NetConfig},
};
use ndarray::{ArrayD, ArrayViewD, Axis};
use rpc::{RpcAgent, RpcFuture};

use crate::error::{OrchestratorError, Result};

/// A stage module constructed on a worker.
#[derive(Debug, Clone, Copy)]
struct RemoteStage {
    owner: usize,
    module: GlobalId,
}

/// The slice of a pipeline output computed by one micro-batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputPart {
    pub rows: usize,
    /// The last stage call that produced it, `None` outside an autograd context.
    pub grad_fn: Option<GradFn>,
}

/// The output of a pipelined forward pass.
#[derive(Debug)]
pub struct PipelineOutput {
    /// The micro-batch outputs concatenated in order.
    pub value: ArrayD<f32>,
    pub parts: Vec<OutputPart>,
}

/// A network split in four stages, each one hosted by a different worker.
pub struct DistNet {
    agent: RpcAgent,
    split_size: NonZeroUsize,
    stages: [RemoteStage; NUM_STAGES],
}

impl DistNet {
    /// Constructs the stages of `arch` on their workers, all at once.
    ///
    /// # Arguments
    /// * `agent` - The agent of the master.
    /// * `arch` - The network to partition.
    /// * `cfg` - The network knobs.
    /// * `split_size` - The amount of samples per micro-batch.
    /// * `workers` - The ranks hosting each stage, in order.
    ///
    /// # Returns
    /// The driver once every stage is constructed.
    pub async fn new(
        agent: RpcAgent,
        arch: Arch,
        cfg: &NetConfig,
        split_size: NonZeroUsize,
        workers: &[usize],
    ) -> Result<Self> {
        if workers.len() != NUM_STAGES {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{arch} needs {NUM_STAGES} workers, got {}",
                workers.len()
            )));
        }

        let specs = zoo::stages(arch, cfg)?;
        let stages: [RemoteStage; NUM_STAGES] = std::array::from_fn(|i| RemoteStage {
            owner: workers[i],
            module: agent.next_id(),
        });

        let constructs = stages.iter().zip(specs).map(|(stage, spec)| {
            debug!(owner = stage.owner; "constructing {}", spec.name());
            agent.rpc_async_with_timeout(
                stage.owner,
                Call::Construct {
                    module: stage.module,
                    spec,
                },
                None,
                Duration::ZERO,
            )
        });

        for output in try_join_all(constructs).await? {
            output.into_ack()?;
        }

        info!(split_size = split_size.get(); "{arch} stages constructed");

        Ok(Self {
            agent,
            split_size,
            stages,
        })
    }

    /// The ranks hosting the stages, in order.
    pub fn workers(&self) -> [usize; NUM_STAGES] {
        self.stages.map(|stage| stage.owner)
    }

    /// Runs `xs` through the pipeline.
    ///
    /// Every micro-batch is chained through the first three stages with remote
    /// references and collected from the last one, so a stage works on a
    /// micro-batch while the next stage works on the previous one.
    ///
    /// # Arguments
    /// * `ctx` - The autograd context recording the pass, if any.
    /// * `xs` - The batch.
    pub async fn forward(
        &self,
        ctx: Option<GlobalId>,
        xs: ArrayViewD<'_, f32>,
    ) -> Result<PipelineOutput> {
        let micro_batches = batch::split_batch(xs, self.split_size)?;
        let mut outputs = Vec::with_capacity(micro_batches.len());
        let mut hidden = Vec::with_capacity(micro_batches.len() * (NUM_STAGES - 1));

        for x in micro_batches {
            let (last, pending) = self.forward_micro_batch(ctx, x.to_owned());
            outputs.push(last);
            hidden.extend(pending);
        }

        let (outputs, _) = futures::try_join!(try_join_all(outputs), try_join_all(hidden))?;

        let mut values = Vec::with_capacity(outputs.len());
        let mut parts = Vec::with_capacity(outputs.len());
        for output in outputs {
            let (y, grad_fn) = output.into_value()?;
            parts.push(OutputPart {
                rows: y.len_of(Axis(0)),
                grad_fn,
            });
            values.push(y);
        }

        let views: Vec<_> = values.iter().map(|v| v.view()).collect();
        let value = batch::concat_batches(&views)?;
        Ok(PipelineOutput { value, parts })
    }

    /// Starts a micro-batch through every stage.
    ///
    /// # Returns
    /// The last stage call, which brings the output back, and the calls of the other
    /// stages.
    fn forward_micro_batch(
        &self,
        ctx: Option<GlobalId>,
        x: ArrayD<f32>,
    ) -> (RpcFuture, Vec<RpcFuture>) {
        let forward = |stage: &RemoteStage, input: RRef, output: Option<GlobalId>| Call::Forward {
            module: stage.module,
            ctx,
            input,
            output,
            call: self.agent.next_id(),
        };

        let mut input = self.agent.local_rref(x, ctx);
        let mut pending = Vec::with_capacity(NUM_STAGES - 1);

        for stage in &self.stages[..NUM_STAGES - 1] {
            let (output, fut) =
                self.agent
                    .remote_with_timeout(stage.owner, None, Duration::ZERO, |output| {
                        forward(stage, input, Some(output))
                    });
            pending.push(fut);
            input = output;
        }

        let last = &self.stages[NUM_STAGES - 1];
        let fut = self.agent.rpc_async_with_timeout(
            last.owner,
            forward(last, input, None),
            None,
            Duration::ZERO,
        );

        (fut, pending)
    }

    /// The parameters of every stage, in stage order.
    pub async fn parameter_rrefs(&self) -> Result<Vec<ParamRef>> {
        let calls = self.stages.iter().map(|stage| {
            self.agent.rpc_async(
                stage.owner,
                Call::ParameterRefs {
                    module: stage.module,
                },
                None,
            )
        });

        let mut params = Vec::new();
        for output in try_join_all(calls).await? {
            params.extend(output.into_params()?);
        }

        Ok(params)
    }
}
