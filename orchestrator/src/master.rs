use std::{num::NonZeroUsize, time::Instant};

use comms::specs::machine_learning::OptimizerSpec;
use log::info;
use machine_learning::{
    arch::loss::{LossFn, Mse},
    batch,
    zoo::NUM_STAGES,
};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rpc::RpcAgent;
use worker::worker_name;

use crate::{
    autograd::DistAutogradContext,
    configs::{Adapter, RunConfig},
    error::Result,
    optimizer::DistributedOptimizer,
    pipeline::DistNet,
};

/// Trains the configured network on random data.
///
/// The stages are placed on `worker1` to `worker4`. The labels are drawn once and
/// every batch gets fresh normally distributed inputs.
///
/// # Arguments
/// * `agent` - The agent of the master.
/// * `config` - The run config.
/// * `split_size` - The amount of samples per micro-batch.
///
/// # Returns
/// The loss of every batch.
pub async fn run_master(
    agent: RpcAgent,
    config: &RunConfig,
    split_size: NonZeroUsize,
) -> Result<Vec<f32>> {
    let adapter = Adapter::new();
    let workers = (1..=NUM_STAGES)
        .map(|rank| Ok(agent.worker_info(&worker_name(rank))?.rank))
        .collect::<Result<Vec<_>>>()?;

    let started = Instant::now();
    let net = DistNet::new(
        agent.clone(),
        config.arch,
        &adapter.net_config(config),
        split_size,
        &workers,
    )
    .await?;
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64;
        "{} placed on {workers:?}", config.arch
    );

    let trainer = Trainer::new(agent, &net, adapter.optimizer_spec(config)).await?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let labels: Vec<usize> = (0..config.batch_size)
        .map(|_| rng.random_range(0..config.num_classes))
        .collect();
    let y = batch::one_hot(&labels, config.num_classes)?.into_dyn();

    let (h, w) = config.image_size;
    let mut losses = Vec::with_capacity(config.num_batches);

    for i in 0..config.num_batches {
        info!("processing batch {i}");
        let started = Instant::now();

        let shape = IxDyn(&[config.batch_size, 3, h, w]);
        let xs: ArrayD<f32> = ArrayD::random_using(shape, StandardNormal, &mut rng);
        let loss = trainer.train_batch(xs.view(), y.view()).await?;

        info!(
            batch = i, loss = loss, elapsed_ms = started.elapsed().as_millis() as u64;
            "batch finished"
        );
        losses.push(loss);
    }

    Ok(losses)
}

/// One training step of a `DistNet` per call.
pub struct Trainer<'a> {
    agent: RpcAgent,
    net: &'a DistNet,
    optimizer: DistributedOptimizer,
    loss_fn: Mse,
}

impl<'a> Trainer<'a> {
    /// Creates the remote optimizers over every parameter of `net`.
    pub async fn new(agent: RpcAgent, net: &'a DistNet, spec: OptimizerSpec) -> Result<Self> {
        let params = net.parameter_rrefs().await?;
        let optimizer = DistributedOptimizer::new(agent.clone(), spec, params).await?;

        Ok(Self {
            agent,
            net,
            optimizer,
            loss_fn: Mse::new(),
        })
    }

    /// Runs the forward and backward passes of a batch within a fresh autograd context
    /// and steps the optimizer.
    ///
    /// The context is released on every rank even if the step fails.
    ///
    /// # Returns
    /// The loss of the batch before the step.
    pub async fn train_batch(
        &self,
        xs: ArrayViewD<'_, f32>,
        y: ArrayViewD<'_, f32>,
    ) -> Result<f32> {
        let ctx = DistAutogradContext::new(self.agent.clone());
        let result = self.step(&ctx, xs, y).await;
        let released = ctx.release().await;

        let loss = result?;
        released?;
        Ok(loss)
    }

    async fn step(
        &self,
        ctx: &DistAutogradContext,
        xs: ArrayViewD<'_, f32>,
        y: ArrayViewD<'_, f32>,
    ) -> Result<f32> {
        let output = self.net.forward(Some(ctx.id()), xs).await?;
        let loss = self.loss_fn.loss(output.value.view(), y.view())?;
        let d = self.loss_fn.loss_prime(output.value.view(), y.view())?;

        ctx.backward(&output, d.view()).await?;
        self.optimizer.step(ctx.id()).await?;
        Ok(loss)
    }
}
