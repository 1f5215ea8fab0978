use std::{collections::HashMap, ops::Range, sync::Arc, time::Instant};

use async_trait::async_trait;
use comms::specs::{
    machine_learning::{ModuleSpec, OptimizerSpec},
    rpc::{Call, GlobalId, GradFn, ParamRef, RRef},
};
use log::{debug, info};
use machine_learning::{
    arch::{ModuleBuilder, Sequential},
    optimization::{self, Optimizer},
};
use ndarray::ArrayD;
use parking_lot::{Mutex, RwLock};
use rpc::{RpcAgent, RpcHandler, RpcOutput, store::StoredValue};

use crate::{
    Result, WorkerErr,
    context::{CallRecord, Contexts},
};

/// A stage module living in this process.
struct HostedModule {
    name: String,
    ranges: Vec<Range<usize>>,
    net: Mutex<Sequential>,
}

/// One optimizer per parameter tensor, so their state never mixes.
struct RemoteOptimizer {
    params: Vec<(ParamRef, Box<dyn Optimizer + Send>)>,
}

/// Hosts stage modules and runs the calls the master and the other stages send them.
///
/// Forward calls record their caches in their autograd context, so several
/// micro-batches may go through a stage before any of them goes backward.
#[derive(Default)]
pub struct StageHost {
    modules: RwLock<HashMap<GlobalId, Arc<HostedModule>>>,
    optimizers: Mutex<HashMap<GlobalId, Arc<Mutex<RemoteOptimizer>>>>,
    contexts: Contexts,
}

impl StageHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// The amount of autograd contexts with something recorded.
    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    async fn run(
        &self,
        agent: &RpcAgent,
        call: Call,
        tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput> {
        match call {
            Call::Construct { module, spec } => self.construct(module, spec).await,
            Call::Forward {
                module,
                ctx,
                input,
                output,
                call,
            } => {
                self.forward(agent, module, ctx, input, output, call)
                    .await
            }
            Call::Backward { ctx, call } => {
                let d = tensor.ok_or(WorkerErr::MissingTensor { call: "backward" })?;
                self.backward(agent, ctx, call, d).await
            }
            Call::ParameterRefs { module } => {
                let hosted = self.module(module)?;
                let params = hosted
                    .ranges
                    .iter()
                    .enumerate()
                    .map(|(index, range)| ParamRef {
                        owner: agent.rank(),
                        module,
                        index,
                        len: range.len(),
                    })
                    .collect();

                Ok(RpcOutput::params(params))
            }
            Call::CreateOptimizer {
                optimizer,
                spec,
                params,
            } => self.create_optimizer(agent, optimizer, spec, params),
            Call::OptimizerStep { optimizer, ctx } => self.step(optimizer, ctx).await,
            Call::ReleaseContext { ctx } => {
                self.contexts.release(ctx);
                Ok(RpcOutput::ack())
            }
            call @ Call::FetchRef { .. } => Err(WorkerErr::UnexpectedCall(call.kind())),
        }
    }

    fn module(&self, id: GlobalId) -> Result<Arc<HostedModule>> {
        self.modules
            .read()
            .get(&id)
            .cloned()
            .ok_or(WorkerErr::UnknownModule(id))
    }

    async fn construct(&self, id: GlobalId, spec: ModuleSpec) -> Result<RpcOutput> {
        if self.modules.read().contains_key(&id) {
            return Err(WorkerErr::DuplicateId(id));
        }

        let started = Instant::now();
        let net = blocking(move || Ok(ModuleBuilder::new().build(&spec)?)).await?;

        info!(
            size = net.size(), elapsed_ms = started.elapsed().as_millis() as u64;
            "built {} as module {id}", net.name()
        );

        let hosted = HostedModule {
            name: net.name().to_string(),
            ranges: net.param_ranges(),
            net: Mutex::new(net),
        };
        self.modules.write().insert(id, Arc::new(hosted));

        Ok(RpcOutput::ack())
    }

    /// Runs a forward call, keeping its output under `output` when given one.
    ///
    /// The output slot is reserved before anything else so the next stage can
    /// already wait on it, and it's poisoned if the call fails.
    async fn forward(
        &self,
        agent: &RpcAgent,
        module: GlobalId,
        ctx: Option<GlobalId>,
        input: RRef,
        output: Option<GlobalId>,
        call: GlobalId,
    ) -> Result<RpcOutput> {
        if let Some(output) = output {
            agent.store().reserve(output, ctx);
        }

        let result = self.run_forward(agent, module, ctx, input, call).await;
        let grad_fn = ctx.map(|_| GradFn {
            owner: agent.rank(),
            call,
        });

        match (output, result) {
            (Some(output), Ok(y)) => {
                let value = StoredValue {
                    tensor: Arc::new(y),
                    grad_fn,
                };
                agent.store().fulfill(output, ctx, value);
                Ok(RpcOutput::ack())
            }
            (Some(output), Err(e)) => {
                agent.store().fail(output, e.to_string());
                Err(e)
            }
            (None, Ok(y)) => Ok(RpcOutput::value(y, grad_fn)),
            (None, Err(e)) => Err(e),
        }
    }

    async fn run_forward(
        &self,
        agent: &RpcAgent,
        module: GlobalId,
        ctx: Option<GlobalId>,
        input: RRef,
        call: GlobalId,
    ) -> Result<ArrayD<f32>> {
        let hosted = self.module(module)?;
        let started = Instant::now();
        let (x, input_grad_fn) = agent.to_here(&input, ctx).await?;
        let rows = x.shape().first().copied().unwrap_or_default();

        let (y, cache) = {
            let hosted = hosted.clone();
            blocking(move || {
                let mut net = hosted.net.lock();
                net.set_training(ctx.is_some());
                Ok(net.forward(x)?)
            })
            .await?
        };

        info!(
            rank = agent.rank(), rows = rows, elapsed_ms = started.elapsed().as_millis() as u64;
            "{} forward finished", hosted.name
        );

        if let Some(ctx) = ctx {
            let record = CallRecord {
                module,
                cache,
                input_grad_fn,
            };
            self.contexts.record(ctx, call, record);
        }

        Ok(y)
    }

    /// Goes backward through a recorded call and keeps the chain going towards the
    /// call that produced its input.
    async fn backward(
        &self,
        agent: &RpcAgent,
        ctx: GlobalId,
        call: GlobalId,
        d: ArrayD<f32>,
    ) -> Result<RpcOutput> {
        let CallRecord {
            module,
            cache,
            input_grad_fn,
        } = self.contexts.take(ctx, call)?;
        let hosted = self.module(module)?;

        let need_input_grad = input_grad_fn.is_some();
        let started = Instant::now();
        let (grad, dx) = {
            let hosted = hosted.clone();
            blocking(move || {
                let net = hosted.net.lock();
                let mut grad = vec![0.0; net.size()];
                let dx = net.backward(cache, d, &mut grad, need_input_grad)?;
                Ok((grad, dx))
            })
            .await?
        };

        debug!(
            rank = agent.rank(), elapsed_ms = started.elapsed().as_millis() as u64;
            "{} backward finished", hosted.name
        );
        self.contexts.accumulate(ctx, module, grad);

        if let (Some(GradFn { owner, call }), Some(dx)) = (input_grad_fn, dx) {
            agent
                .rpc_sync(owner, Call::Backward { ctx, call }, Some(dx))
                .await?
                .into_ack()?;
        }

        Ok(RpcOutput::ack())
    }

    fn create_optimizer(
        &self,
        agent: &RpcAgent,
        id: GlobalId,
        spec: OptimizerSpec,
        params: Vec<ParamRef>,
    ) -> Result<RpcOutput> {
        let mut optimizers = self.optimizers.lock();
        if optimizers.contains_key(&id) {
            return Err(WorkerErr::DuplicateId(id));
        }

        for param in &params {
            if param.owner != agent.rank() {
                return Err(WorkerErr::ForeignParam {
                    owner: param.owner,
                    rank: agent.rank(),
                });
            }

            let hosted = self.module(param.module)?;
            if hosted.ranges.get(param.index).map(Range::len) != Some(param.len) {
                return Err(WorkerErr::InvalidParam {
                    module: param.module,
                    index: param.index,
                });
            }
        }

        debug!(params = params.len(); "created optimizer {id}");
        let params = params
            .into_iter()
            .map(|param| (param, optimization::build_optimizer(spec)))
            .collect();
        optimizers.insert(id, Arc::new(Mutex::new(RemoteOptimizer { params })));

        Ok(RpcOutput::ack())
    }

    /// Updates every parameter of the optimizer with the gradients of `ctx`.
    ///
    /// Parameters of modules that received no gradient within `ctx` are left untouched.
    async fn step(&self, id: GlobalId, ctx: GlobalId) -> Result<RpcOutput> {
        let optimizer = self
            .optimizers
            .lock()
            .get(&id)
            .cloned()
            .ok_or(WorkerErr::UnknownOptimizer(id))?;

        let grads = self.contexts.grads(ctx);
        let modules = optimizer
            .lock()
            .params
            .iter()
            .map(|(param, _)| Ok((param.module, self.module(param.module)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        blocking(move || {
            let mut optimizer = optimizer.lock();

            for (param, opt) in optimizer.params.iter_mut() {
                let Some(grad) = grads.get(&param.module) else {
                    continue;
                };

                let hosted = &modules[&param.module];
                let range = hosted.ranges[param.index].clone();
                let mut net = hosted.net.lock();
                opt.update_params(&mut net.params_mut()[range.clone()], &grad[range]);
            }

            Ok(())
        })
        .await?;

        Ok(RpcOutput::ack())
    }
}

#[async_trait]
impl RpcHandler for StageHost {
    async fn handle(
        &self,
        agent: &RpcAgent,
        from: usize,
        call: Call,
        tensor: Option<ArrayD<f32>>,
    ) -> rpc::Result<RpcOutput> {
        debug!(rank = agent.rank(), from = from; "handling {}", call.kind());
        Ok(self.run(agent, call, tensor).await?)
    }
}

/// Runs compute heavy work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WorkerErr::Task(e.to_string()))?
}
