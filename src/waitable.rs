//! Generic I/O-readiness registration: converts a poller backend's
//! readiness notifications into scheduled fiber resumptions.
//!
//! This module only knows about opaque `(ResourceId, Interest)` keys; it
//! has no notion of file descriptors, sockets, or any concrete I/O
//! object. A concrete backend (see [`crate::backend`]) owns the mapping
//! from its own resources to these keys and calls [`Waitable::step`]
//! once per turn with whatever became ready.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::op::{BoxedValue, Op, TryFn};
use crate::waitset::{Token, Waitset};

/// Opaque identifier for a registered resource (e.g. a backend's own fd
/// index). Meaningful only to the backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

type Key = (ResourceId, Interest);

/// Shared registry of tasks parked on resource readiness.
pub struct Waitable {
    waiters: Mutex<Waitset<Key, Box<dyn FnOnce() + Send>>>,
}

impl Waitable {
    pub fn new() -> Arc<Self> {
        Arc::new(Waitable {
            waiters: Mutex::new(Waitset::new()),
        })
    }

    /// Registers `cb` to run once `resource` becomes ready for `interest`.
    pub fn register(
        &self,
        resource: ResourceId,
        interest: Interest,
        cb: Box<dyn FnOnce() + Send>,
    ) -> Token {
        self.waiters.lock().add((resource, interest), cb)
    }

    pub fn unlink(&self, resource: ResourceId, interest: Interest, token: Token) {
        self.waiters.lock().unlink(&(resource, interest), token);
    }

    /// Called by a poller backend with the set of keys that became
    /// ready this poll; wakes every task parked on each of them.
    pub fn step(&self, ready: &[(ResourceId, Interest)]) {
        let mut waiters = self.waiters.lock();
        for key in ready {
            waiters.notify_all(key, |waiter| waiter());
        }
    }

    pub fn has_waiters(&self, resource: ResourceId, interest: Interest) -> bool {
        !self.waiters.lock().is_empty_key(&(resource, interest))
    }
}

/// Builds an Op that commits once `resource` is ready for `interest`.
/// `probe` is the fast-path check (e.g. a non-blocking syscall attempt);
/// `on_ready` produces the committed value once readiness is confirmed.
pub fn readiness_op(
    waitable: Arc<Waitable>,
    resource: ResourceId,
    interest: Interest,
    probe: impl Fn() -> Option<BoxedValue> + Send + Sync + 'static,
) -> Op {
    let try_fn: TryFn = Box::new(probe);

    let token_slot: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));
    let waitable_block = waitable.clone();
    let token_block = token_slot.clone();
    let block_fn: crate::op::BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
        let susp = susp.clone();
        let sched = crate::scheduler::handle(sched);
        let token = waitable_block.register(
            resource,
            interest,
            Box::new(move || {
                susp.complete(&sched, leaf_index, Box::new(()));
            }),
        );
        *token_block.lock() = Some(token);
    });

    Op::primitive(try_fn, block_fn).abort(move || {
        if let Some(token) = token_slot.lock().take() {
            waitable.unlink(resource, interest, token);
        }
    })
}
