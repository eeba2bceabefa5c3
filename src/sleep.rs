//! Sleeping as an Op, built on the scheduler's timer wheel.

use std::time::{Duration, Instant};

use crate::op::{BoxedValue, Op};
use crate::scheduler::Scheduler;
use crate::task::Task;

/// Runs a closure on the scheduler's driving thread during some future
/// turn. Used by combinators (e.g. `or_else`) that need "ready, but not
/// before the next turn" rather than an immediate fast-path commit.
pub struct NextTurnTask {
    f: Box<dyn FnOnce(&Scheduler) + Send>,
}

impl NextTurnTask {
    pub fn new(f: impl FnOnce(&Scheduler) + Send + 'static) -> Self {
        NextTurnTask { f: Box::new(f) }
    }
}

impl Task for NextTurnTask {
    fn run(self: Box<Self>, sched: &Scheduler) {
        (self.f)(sched);
    }
}

/// An Op that becomes ready after `dt` has elapsed.
pub fn sleep_op(dt: Duration) -> Op {
    let try_fn: crate::op::TryFn = Box::new(move || {
        if dt.is_zero() {
            Some(Box::new(()) as BoxedValue)
        } else {
            None
        }
    });
    let block_fn: crate::op::BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
        let deadline = sched.now() + dt;
        sched.timer_wheel().add_absolute(
            deadline,
            Box::new(CompleteAtDeadline {
                susp: susp.clone(),
                leaf_index,
            }),
        );
    });
    Op::primitive(try_fn, block_fn)
}

/// An Op that becomes ready once the scheduler's clock reaches `deadline`.
pub fn sleep_until_op(deadline: Instant) -> Op {
    let try_fn: crate::op::TryFn = Box::new(move || None);
    let block_fn: crate::op::BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
        sched.timer_wheel().add_absolute(
            deadline,
            Box::new(CompleteAtDeadline {
                susp: susp.clone(),
                leaf_index,
            }),
        );
    });
    Op::primitive(try_fn, block_fn)
}

struct CompleteAtDeadline {
    susp: crate::suspension::Suspension,
    leaf_index: usize,
}

impl Task for CompleteAtDeadline {
    fn run(self: Box<Self>, sched: &Scheduler) {
        self.susp.complete_and_run(sched, self.leaf_index, Box::new(()));
    }

    fn cancel(self: Box<Self>, _reason: &str) {
        // A lost race's timer entry is simply dropped by the wheel; the
        // suspension itself is woken via the performance's nack path,
        // not by this completion firing with a cancellation value.
    }
}
