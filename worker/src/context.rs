//! What a stage host remembers about every distributed autograd context.

use std::{collections::HashMap, sync::Arc};

use comms::specs::rpc::{GlobalId, GradFn};
use log::debug;
use machine_learning::arch::ForwardCache;
use parking_lot::Mutex;

use crate::{Result, WorkerErr};

/// A forward call waiting for its gradient.
#[derive(Debug)]
pub(crate) struct CallRecord {
    pub module: GlobalId,
    pub cache: ForwardCache,
    /// The call that produced the input, where the input gradient goes.
    pub input_grad_fn: Option<GradFn>,
}

#[derive(Default)]
struct ContextRecord {
    calls: HashMap<GlobalId, CallRecord>,
    grads: HashMap<GlobalId, Arc<Vec<f32>>>,
}

#[derive(Default)]
pub(crate) struct Contexts {
    inner: Mutex<HashMap<GlobalId, ContextRecord>>,
}

impl Contexts {
    pub fn record(&self, ctx: GlobalId, call: GlobalId, record: CallRecord) {
        self.inner
            .lock()
            .entry(ctx)
            .or_default()
            .calls
            .insert(call, record);
    }

    /// Removes a recorded call, each one goes backward once.
    pub fn take(&self, ctx: GlobalId, call: GlobalId) -> Result<CallRecord> {
        self.inner
            .lock()
            .get_mut(&ctx)
            .and_then(|record| record.calls.remove(&call))
            .ok_or(WorkerErr::UnknownCall { ctx, call })
    }

    /// Adds `grad` to the gradient of `module` within `ctx`.
    pub fn accumulate(&self, ctx: GlobalId, module: GlobalId, grad: Vec<f32>) {
        let mut inner = self.inner.lock();
        let grads = &mut inner.entry(ctx).or_default().grads;

        match grads.get_mut(&module) {
            Some(acc) => {
                for (a, g) in Arc::make_mut(acc).iter_mut().zip(grad) {
                    *a += g;
                }
            }
            None => {
                grads.insert(module, Arc::new(grad));
            }
        }
    }

    /// The accumulated gradient of every module within `ctx`.
    pub fn grads(&self, ctx: GlobalId) -> HashMap<GlobalId, Arc<Vec<f32>>> {
        self.inner
            .lock()
            .get(&ctx)
            .map(|record| record.grads.clone())
            .unwrap_or_default()
    }

    /// Forgets `ctx`, returns whether anything was recorded for it.
    pub fn release(&self, ctx: GlobalId) -> bool {
        let released = self.inner.lock().remove(&ctx);

        if let Some(record) = &released {
            debug!(
                calls = record.calls.len(), grads = record.grads.len();
                "released context {ctx}"
            );
        }

        released.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
