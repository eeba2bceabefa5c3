//! Task-source glue between a [`crate::backend::PollerBackend`] and the
//! scheduler: each turn, polls for readiness and feeds it to a
//! [`crate::waitable::Waitable`] registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::PollerBackend;
use crate::scheduler::{Scheduler, TaskSource};
use crate::waitable::Waitable;

/// Adapts a concrete [`PollerBackend`] into a [`TaskSource`]. Installed
/// via [`Scheduler::register_source`] or [`Scheduler::set_event_waiter`]
/// (the latter if this is the runtime's only source of blocking waits).
pub struct Poller {
    backend: Arc<dyn PollerBackend>,
    waitable: Arc<Waitable>,
}

impl Poller {
    pub fn new(backend: Arc<dyn PollerBackend>, waitable: Arc<Waitable>) -> Arc<Self> {
        Arc::new(Poller { backend, waitable })
    }
}

impl TaskSource for Poller {
    fn schedule_tasks(&self, _sched: &Scheduler, _now: Instant, timeout: Duration) {
        let ready = self.backend.poll(timeout);
        if !ready.is_empty() {
            self.waitable.step(&ready);
        }
    }
}
