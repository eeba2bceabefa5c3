//! Top-level entry points: start a runtime, run a scoped block of fibers,
//! and perform events against the ambient scope.

use std::any::Any;
use std::sync::Arc;

use crate::error::TaskError;
use crate::fiber::{current_scope, with_root_scope, FiberId};
use crate::op::Op;
use crate::scheduler::Scheduler;
use crate::scope::{Report, Scope};

/// Starts a fresh runtime, runs `main` as the root scope's sole
/// top-level fiber, drives the scheduler until the whole supervision
/// tree drains, and returns the root's [`Report`].
pub fn run<F>(main: F) -> Report
where
    F: FnOnce(Arc<Scope>) -> Result<(), TaskError> + Send + 'static,
{
    let sched = Scheduler::new();
    let root = Scope::new_root(&sched);
    let body_scope = root.clone();
    root.clone()
        .spawn(move || main(body_scope))
        .expect("a freshly-created root scope always admits its first fiber");

    while root.live_fiber_count() > 0 {
        sched.step();
    }
    root.join()
}

/// Spawns `body` as a new fiber in `scope`. Shorthand for
/// `scope.spawn(body)`.
pub fn spawn(
    scope: Arc<Scope>,
    body: impl FnOnce() -> Result<(), TaskError> + Send + 'static,
) -> Option<FiberId> {
    scope.spawn(body)
}

/// The ambient scope: the current fiber's scope, or the installed
/// process root if called outside any fiber. See [`with_root_scope`].
pub fn current() -> Option<Arc<Scope>> {
    current_scope()
}

pub use with_root_scope as with_process_root;

/// Performs `op` against the ambient scope, propagating cancellation as
/// [`TaskError::Cancelled`] if the scope goes unhealthy first.
pub fn perform(op: Op) -> Result<Box<dyn Any + Send>, TaskError> {
    let scope = current_scope().expect("perform called with no ambient scope installed");
    scope.perform(op)
}

/// Same as [`perform`], against an explicit scope rather than the
/// ambient one.
pub fn perform_in(scope: &Arc<Scope>, op: Op) -> Result<Box<dyn Any + Send>, TaskError> {
    scope.perform(op)
}

/// Creates a child scope under the ambient ("or explicit") parent, runs
/// `body` as its sole top-level fiber, joins it, and returns the
/// `Report`. Safe to call both outside any fiber (a plain condvar wait)
/// and from inside one (the calling fiber suspends instead of blocking
/// its OS thread) — `Scope::join` detects which applies. `run_scope_op`
/// remains available for composing the join itself into a larger Op.
pub fn run_scope<F>(parent: &Arc<Scope>, body: F) -> Report
where
    F: FnOnce(Arc<Scope>) -> Result<(), TaskError> + Send + 'static,
{
    let child = parent
        .new_child()
        .expect("run_scope called on a scope that has already closed admission");
    let body_scope = child.clone();
    child
        .clone()
        .spawn(move || body(body_scope))
        .expect("a freshly-created child scope always admits its first fiber");
    child.join()
}

/// An Op-returning variant of [`run_scope`]: suspends the performing
/// fiber until the child scope's fibers drain, without a second OS
/// thread doing the waiting.
pub fn run_scope_op<F>(parent: &Arc<Scope>, body: F) -> Op
where
    F: FnOnce(Arc<Scope>) -> Result<(), TaskError> + Send + 'static,
{
    let child = parent
        .new_child()
        .expect("run_scope_op called on a scope that has already closed admission");
    let body_scope = child.clone();
    child
        .clone()
        .spawn(move || body(body_scope))
        .expect("a freshly-created child scope always admits its first fiber");
    child.join_op()
}
