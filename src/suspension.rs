//! One-shot rendezvous between an Op's commit and a fiber's resumption.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Synchronized,
}

/// The committed payload: which compiled leaf won (by index into the
/// leaves list the performer built), plus whatever values its `try_fn`
/// or `block_fn` produced. Using an index rather than comparing closure
/// identity (as the dynamic-language source does by comparing stored
/// wrap functions) is the idiomatic Rust substitute: leaves are flattened
/// into a `Vec` at compile time, so "which leaf won" is just "which slot".
pub type Winner = (usize, Box<dyn Any + Send>);

struct Inner {
    state: State,
    winner: Option<Winner>,
    fiber: Option<Arc<Fiber>>,
}

/// A one-shot rendezvous with states `{waiting, synchronized}`.
#[derive(Clone)]
pub struct Suspension {
    inner: Arc<Mutex<Inner>>,
}

impl Suspension {
    /// Creates a suspension owned by `fiber`. A synchronized suspension
    /// schedules `fiber` for resumption on `fiber`'s home scheduler.
    pub fn new(fiber: Arc<Fiber>) -> Self {
        Suspension {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Waiting,
                winner: None,
                fiber: Some(fiber),
            })),
        }
    }

    pub fn waiting(&self) -> bool {
        matches!(self.inner.lock().state, State::Waiting)
    }

    /// Transitions waiting -> synchronized and schedules the owning
    /// fiber's resumption via a fresh `CompleteTask`. No-op (returns
    /// `false`) if already synchronized.
    pub fn complete(&self, sched: &Scheduler, leaf_index: usize, value: Box<dyn Any + Send>) -> bool {
        if !self.try_synchronize(leaf_index, value) {
            return false;
        }
        sched.schedule(Box::new(CompleteTask {
            suspension: self.clone(),
        }));
        true
    }

    /// Transitions and resumes the owning fiber in the current turn,
    /// bypassing an extra queue hop. Used by `CompleteTask::run` when
    /// waking within a source callback.
    pub fn complete_and_run(&self, sched: &Scheduler, leaf_index: usize, value: Box<dyn Any + Send>) -> bool {
        if !self.try_synchronize(leaf_index, value) {
            return false;
        }
        self.resume_owner(sched);
        true
    }

    /// Returns a [`CompleteTask`] that, when scheduled and run, invokes
    /// `complete_and_run` if this suspension is still waiting.
    pub fn complete_task(&self) -> CompleteTask {
        CompleteTask {
            suspension: self.clone(),
        }
    }

    /// Synchronizes without scheduling or resuming anything. Used by a
    /// leaf's `block_fn` when it discovers, during its own installation,
    /// that it can commit immediately (e.g. a channel handoff that was
    /// already possible). The performing fiber's own `suspend` call
    /// notices the suspension is no longer waiting and skips blocking
    /// entirely, so no cross-thread resumption is ever needed here.
    pub fn complete_locally(&self, leaf_index: usize, value: Box<dyn Any + Send>) -> bool {
        self.try_synchronize(leaf_index, value)
    }

    fn try_synchronize(&self, leaf_index: usize, value: Box<dyn Any + Send>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Synchronized {
            return false;
        }
        inner.state = State::Synchronized;
        inner.winner = Some((leaf_index, value));
        true
    }

    fn resume_owner(&self, sched: &Scheduler) {
        let fiber = self.inner.lock().fiber.take();
        if let Some(fiber) = fiber {
            fiber.resume(sched);
        }
    }

    /// Extracts the winning `(leaf_index, value)` after the owning fiber
    /// has been resumed. Only meaningful from inside the fiber itself,
    /// after `suspend` returns.
    pub fn take_winner(&self) -> Option<Winner> {
        self.inner.lock().winner.take()
    }
}

/// A [`Task`] adapter that, when run, transitions its [`Suspension`] from
/// waiting to synchronized-and-run.
pub struct CompleteTask {
    suspension: Suspension,
}

impl CompleteTask {
    pub fn new(suspension: Suspension) -> Self {
        CompleteTask { suspension }
    }

    /// Completes the suspension with the cancellation sentinel so the
    /// owning fiber observes cancellation rather than a committed value.
    pub fn cancel_suspension(suspension: &Suspension, sched: &Scheduler, leaf_index: usize, reason: &str) {
        suspension.complete_and_run(
            sched,
            leaf_index,
            Box::new(crate::error::TaskError::Cancelled(reason.to_string())),
        );
    }
}

impl Task for CompleteTask {
    fn run(self: Box<Self>, sched: &Scheduler) {
        self.suspension.resume_owner(sched);
    }

    fn cancel(self: Box<Self>, _reason: &str) {
        // Completing with no value simply leaves the suspension waiting
        // forever for this path; the scope's not_ok race (C8) is what
        // actually wakes a cancelled fiber, not the timer/channel path
        // being cancelled out from under it.
    }
}
