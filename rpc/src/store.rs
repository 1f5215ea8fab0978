//! The values behind the remote references owned by this process.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use comms::specs::rpc::{GlobalId, GradFn};
use log::debug;
use ndarray::ArrayD;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{Result, RpcErr};

/// A produced value and the forward call that produced it.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub tensor: Arc<ArrayD<f32>>,
    pub grad_fn: Option<GradFn>,
}

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Ready(StoredValue),
    Failed(String),
}

struct Slot {
    ctx: Option<GlobalId>,
    state: watch::Sender<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            ctx: None,
            state: watch::Sender::new(SlotState::Pending),
        }
    }
}

/// The amount of released contexts remembered, so late calls of them are turned down.
const RELEASED_CONTEXTS: usize = 64;

#[derive(Default)]
struct Slots {
    live: HashMap<GlobalId, Slot>,
    released: VecDeque<GlobalId>,
}

impl Slots {
    fn is_released(&self, ctx: Option<GlobalId>) -> bool {
        ctx.is_some_and(|ctx| self.released.contains(&ctx))
    }

    fn slot(&mut self, id: GlobalId, ctx: Option<GlobalId>) -> &mut Slot {
        let slot = self.live.entry(id).or_insert_with(Slot::new);
        slot.ctx = slot.ctx.or(ctx);
        slot
    }
}

/// Slots are created on first touch, so a fetch may arrive before the call that
/// produces the value.
#[derive(Default)]
pub struct RRefStore {
    slots: Mutex<Slots>,
}

impl RRefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as owned by the autograd context `ctx`.
    pub fn reserve(&self, id: GlobalId, ctx: Option<GlobalId>) {
        let mut slots = self.slots.lock();
        if !slots.is_released(ctx) {
            slots.slot(id, ctx);
        }
    }

    /// Sets the value of `id` and wakes up every pending fetch.
    ///
    /// Values of an already released context are dropped.
    pub fn fulfill(&self, id: GlobalId, ctx: Option<GlobalId>, value: StoredValue) {
        let mut slots = self.slots.lock();
        if slots.is_released(ctx) {
            debug!("dropped value {id} of a released context");
            return;
        }
        slots.slot(id, ctx).state.send_replace(SlotState::Ready(value));
    }

    /// Poisons `id`, every fetch of it fails with `detail`.
    ///
    /// Only live slots are poisoned, a missing one was already released.
    pub fn fail(&self, id: GlobalId, detail: String) {
        if let Some(slot) = self.slots.lock().live.get(&id) {
            slot.state.send_replace(SlotState::Failed(detail));
        }
    }

    /// Waits for the value of `id`.
    ///
    /// Values outside of any context are removed by their first fetch, failed or
    /// not. A fetch that times out removes the slot it was alone waiting on.
    ///
    /// # Arguments
    /// * `id` - The value to wait for.
    /// * `ctx` - The autograd context of the fetching call.
    /// * `timeout` - How long to wait, `None` waits until the value is set or dropped.
    pub async fn fetch(
        &self,
        id: GlobalId,
        ctx: Option<GlobalId>,
        timeout: Option<Duration>,
    ) -> Result<StoredValue> {
        let mut rx = {
            let mut slots = self.slots.lock();
            if slots.is_released(ctx) {
                return Err(RpcErr::RRefDropped(id));
            }
            slots.slot(id, ctx).state.subscribe()
        };

        let wait = rx.wait_for(|state| !matches!(state, SlotState::Pending));
        let state = match timeout {
            Some(duration) => match tokio::time::timeout(duration, wait).await {
                Ok(state) => state,
                Err(_) => {
                    self.abandon(id);
                    return Err(RpcErr::RRefTimeout(id));
                }
            },
            None => wait.await,
        }
        .map_err(|_| RpcErr::RRefDropped(id))?
        .clone();

        if !matches!(state, SlotState::Pending) {
            let mut slots = self.slots.lock();
            if slots.live.get(&id).is_some_and(|slot| slot.ctx.is_none()) {
                slots.live.remove(&id);
            }
        }

        match state {
            SlotState::Ready(value) => Ok(value),
            SlotState::Failed(detail) => Err(RpcErr::RRefFailed { id, detail }),
            SlotState::Pending => Err(RpcErr::RRefDropped(id)),
        }
    }

    /// Removes `id` if it is still pending and the caller is its only waiter.
    fn abandon(&self, id: GlobalId) {
        let mut slots = self.slots.lock();
        let unwanted = slots.live.get(&id).is_some_and(|slot| {
            matches!(*slot.state.borrow(), SlotState::Pending) && slot.state.receiver_count() <= 1
        });

        if unwanted {
            slots.live.remove(&id);
            debug!("gave up on value {id}");
        }
    }

    /// Drops every value of the context `ctx`, pending fetches of them fail.
    ///
    /// Later calls within `ctx` no longer create values.
    ///
    /// # Returns
    /// The amount of dropped values.
    pub fn release_context(&self, ctx: GlobalId) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.live.len();
        slots.live.retain(|_, slot| slot.ctx != Some(ctx));

        if !slots.released.contains(&ctx) {
            if slots.released.len() == RELEASED_CONTEXTS {
                slots.released.pop_front();
            }
            slots.released.push_back(ctx);
        }

        let dropped = before - slots.live.len();
        debug!(dropped = dropped; "released the values of context {ctx}");
        dropped
    }

    /// The amount of live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn value(v: f32) -> StoredValue {
        StoredValue {
            tensor: Arc::new(ArrayD::from_elem(IxDyn(&[2]), v)),
            grad_fn: None,
        }
    }

    #[tokio::test]
    async fn fetch_before_fulfill_waits_for_the_value() {
        let store = Arc::new(RRefStore::new());
        let id = GlobalId::new(1, 1);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch(id, None, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.fulfill(id, None, value(3.0));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.tensor.as_slice().unwrap(), &[3.0, 3.0]);
    }

    #[tokio::test]
    async fn context_less_values_are_single_use() {
        let store = RRefStore::new();
        let id = GlobalId::new(0, 9);

        store.fulfill(id, None, value(1.0));
        store.fetch(id, None, None).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn context_values_live_until_released() {
        let store = RRefStore::new();
        let ctx = GlobalId::new(0, 1);
        let a = GlobalId::new(2, 1);
        let b = GlobalId::new(2, 2);

        store.reserve(a, Some(ctx));
        store.fulfill(a, None, value(1.0));
        store.fulfill(b, Some(ctx), value(2.0));

        store.fetch(a, None, None).await.unwrap();
        store.fetch(a, None, None).await.unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.release_context(ctx), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn releasing_the_context_fails_pending_fetches() {
        let store = Arc::new(RRefStore::new());
        let ctx = GlobalId::new(0, 1);
        let id = GlobalId::new(3, 4);
        store.reserve(id, Some(ctx));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch(id, None, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.release_context(ctx);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcErr::RRefDropped(got) if got == id));
    }

    #[tokio::test]
    async fn failed_producers_poison_the_slot() {
        let store = RRefStore::new();
        let id = GlobalId::new(1, 5);
        store.reserve(id, Some(GlobalId::new(0, 4)));

        store.fail(id, "boom".into());
        let err = store.fetch(id, None, None).await.unwrap_err();
        assert!(matches!(err, RpcErr::RRefFailed { detail, .. } if detail == "boom"));
    }

    #[tokio::test]
    async fn fetch_times_out() {
        let store = RRefStore::new();
        let id = GlobalId::new(1, 6);

        let err = store
            .fetch(id, None, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcErr::RRefTimeout(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn timed_out_fetch_keeps_slots_others_wait_on() {
        let store = Arc::new(RRefStore::new());
        let id = GlobalId::new(1, 7);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch(id, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = store
            .fetch(id, None, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcErr::RRefTimeout(_)));
        assert_eq!(store.len(), 1);

        store.fulfill(id, None, value(5.0));
        waiter.await.unwrap().unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_context_less_slots_are_removed_by_their_fetch() {
        let store = RRefStore::new();
        let id = GlobalId::new(1, 8);
        store.reserve(id, None);

        store.fail(id, "boom".into());
        assert!(store.fetch(id, None, None).await.is_err());
        assert!(store.is_empty());

        // A second fetch waits on a fresh slot, which goes away once it gives up.
        let err = store
            .fetch(id, None, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcErr::RRefTimeout(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn released_contexts_create_no_slots() {
        let store = RRefStore::new();
        let ctx = GlobalId::new(0, 2);
        let id = GlobalId::new(2, 3);

        store.fulfill(id, Some(ctx), value(1.0));
        assert_eq!(store.release_context(ctx), 1);

        let err = store.fetch(id, Some(ctx), None).await.unwrap_err();
        assert!(matches!(err, RpcErr::RRefDropped(got) if got == id));

        store.reserve(id, Some(ctx));
        store.fulfill(id, Some(ctx), value(2.0));
        store.fail(id, "late".into());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn fetches_within_a_context_are_released_with_it() {
        let store = Arc::new(RRefStore::new());
        let ctx = GlobalId::new(0, 3);
        let id = GlobalId::new(4, 1);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch(id, Some(ctx), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.release_context(ctx), 1);
        assert!(waiter.await.unwrap().is_err());
        assert!(store.is_empty());
    }
}
