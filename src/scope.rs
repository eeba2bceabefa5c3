//! Structured concurrency scopes: a supervision tree with fail-fast
//! propagation, deterministic join, and scope-aware event performance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cond::Cond;
use crate::error::TaskError;
use crate::fiber::{Fiber, FiberId};
use crate::op::{self, wait_op, Op};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ScopeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scope({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Failed,
    Cancelled,
    Ok,
}

/// The decided terminal status handed to a scope's finalizers. `Running`
/// never appears here: finalizers only run once the wait-group has
/// drained and the scope's fate (absent the finalizers themselves) is
/// already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Ok,
    Failed,
    Cancelled,
}

impl Status {
    fn finalized(self) -> FinalStatus {
        match self {
            Status::Failed => FinalStatus::Failed,
            Status::Cancelled => FinalStatus::Cancelled,
            Status::Running | Status::Ok => FinalStatus::Ok,
        }
    }
}

/// A scope finalizer: runs LIFO during join, after the wait-group has
/// drained and children have joined. Receives whether the scope is
/// aborting, its decided status, and the primary fault when failed. A
/// finalizer that raises while the scope would otherwise have been ok
/// becomes the new primary failure; one that raises on an already
/// not-ok scope appends to `extra_errors`.
type Finalizer = Box<dyn FnOnce(bool, FinalStatus, Option<TaskError>) -> Result<(), TaskError> + Send>;

/// A snapshot of a scope's outcome, taken after it has finished joining.
#[derive(Debug, Clone)]
pub struct Report {
    pub id: ScopeId,
    pub primary: Option<TaskError>,
    pub extra_errors: Vec<TaskError>,
    pub children: Vec<Report>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.primary.is_none() && self.extra_errors.is_empty() && self.children.iter().all(Report::is_ok)
    }
}

struct State {
    status: Status,
    primary: Option<TaskError>,
    extra_errors: Vec<TaskError>,
    children: Vec<Arc<Scope>>,
    live_fibers: usize,
    admission_closed: bool,
    cancel_reason: Option<String>,
    finalizers: Vec<Finalizer>,
    report: Option<Report>,
    /// Run exactly once, when `live_fibers` reaches zero. Unlike `not_ok`
    /// this has no single natural one-shot `Cond`: a scope's wait-group
    /// can pass through zero only once admission is closed, but fibers
    /// keep finishing one at a time before that point.
    drain_waiters: Vec<Box<dyn FnOnce() + Send>>,
}

/// A node in the supervision tree. Every fiber spawned in a scope is
/// tracked by its wait-group; the first fault or cancellation closes
/// admission and cancels the rest of the subtree; joining is
/// deterministic: close admission, drain the wait-group, join children
/// in attachment order, then run finalizers LIFO.
pub struct Scope {
    id: ScopeId,
    parent: Option<Arc<Scope>>,
    sched: Arc<Scheduler>,
    state: Mutex<State>,
    not_ok: Cond,
    stack_name_prefix: String,
    stack_size: Option<usize>,
}

impl Scope {
    /// A scope with no parent, used as the top of a run's supervision
    /// tree or as the ambient "process root" outside any fiber.
    pub fn new_root(sched: &Arc<Scheduler>) -> Arc<Scope> {
        Self::new(sched.clone(), None, "weft-fiber".to_string(), None)
    }

    fn new(
        sched: Arc<Scheduler>,
        parent: Option<Arc<Scope>>,
        stack_name_prefix: String,
        stack_size: Option<usize>,
    ) -> Arc<Scope> {
        Arc::new(Scope {
            id: ScopeId::new(),
            parent,
            sched,
            state: Mutex::new(State {
                status: Status::Running,
                primary: None,
                extra_errors: Vec::new(),
                children: Vec::new(),
                live_fibers: 0,
                admission_closed: false,
                cancel_reason: None,
                finalizers: Vec::new(),
                report: None,
                drain_waiters: Vec::new(),
            }),
            not_ok: Cond::new(),
            stack_name_prefix,
            stack_size,
        })
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn stack_name_prefix(&self) -> String {
        self.stack_name_prefix.clone()
    }

    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.clone()
    }

    /// Creates a child scope attached to `self` in attachment order.
    /// Returns `None` if `self` has already closed admission (a fault,
    /// cancellation, or join already in progress).
    pub fn new_child(self: &Arc<Self>) -> Option<Arc<Scope>> {
        let mut state = self.state.lock();
        if state.admission_closed {
            return None;
        }
        let child = Scope::new(
            self.sched.clone(),
            Some(self.clone()),
            self.stack_name_prefix.clone(),
            self.stack_size,
        );
        state.children.push(child.clone());
        Some(child)
    }

    /// An Op that becomes ready the instant this scope is no longer
    /// healthy (failed or cancelled). Used to race against user work so
    /// a performance can be interrupted by an ancestor's fault.
    pub fn not_ok_op(self: &Arc<Self>) -> Op {
        wait_op(self.not_ok.clone())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.state.lock().status, Status::Running | Status::Ok)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.state.lock().cancel_reason.clone()
    }

    /// Number of fibers currently admitted and not yet finished.
    pub fn live_fiber_count(&self) -> usize {
        self.state.lock().live_fibers
    }

    /// Spawns `body` as a new fiber admitted into this scope. Returns
    /// the fiber id, or `None` if admission is closed (the caller should
    /// treat that as "the scope is already winding down").
    pub fn spawn(
        self: Arc<Self>,
        body: impl FnOnce() -> Result<(), TaskError> + Send + 'static,
    ) -> Option<FiberId> {
        {
            let mut state = self.state.lock();
            if state.admission_closed {
                return None;
            }
            state.live_fibers += 1;
        }
        let sched = self.sched.clone();
        let fiber = Fiber::spawn(self, sched, body);
        Some(fiber.id())
    }

    /// Called by a fiber's backing thread exactly once, on completion.
    /// Accounts for the wait-group, records faults, and on the first
    /// fault or cancellation, cancels the rest of the subtree.
    pub fn fiber_finished(self: &Arc<Self>, fiber_id: FiberId, outcome: Result<(), TaskError>) {
        let (should_cancel, drained, waiters) = {
            let mut state = self.state.lock();
            state.live_fibers = state.live_fibers.saturating_sub(1);
            let mut should_cancel = false;
            match outcome {
                Ok(()) => {}
                Err(TaskError::Cancelled(_)) => {
                    debug!(scope = %self.id, fiber = %fiber_id, "fiber observed cancellation");
                }
                Err(err) => {
                    warn!(scope = %self.id, fiber = %fiber_id, error = %err, "fiber faulted");
                    // First fault cancels the subtree immediately: siblings
                    // racing `not_ok_op()` must not wait for the whole
                    // wait-group to drain before they hear about it.
                    should_cancel = state.primary.is_none();
                    if state.primary.is_none() {
                        state.primary = Some(err);
                    } else {
                        state.extra_errors.push(err);
                    }
                    state.status = Status::Failed;
                }
            }
            let drained = state.live_fibers == 0;
            let waiters = if drained {
                std::mem::take(&mut state.drain_waiters)
            } else {
                Vec::new()
            };
            (should_cancel, drained, waiters)
        };
        if should_cancel {
            self.cancel_subtree("sibling fault");
        }
        if drained {
            for waiter in waiters {
                waiter();
            }
        }
    }

    /// Cancels this scope and its entire subtree. Idempotent: a scope
    /// already failed or cancelled keeps its original status and reason.
    pub fn cancel(self: &Arc<Self>, reason: impl Into<String>) {
        self.cancel_subtree(&reason.into());
    }

    fn cancel_subtree(self: &Arc<Self>, reason: &str) {
        let children = {
            let mut state = self.state.lock();
            if state.status == Status::Running {
                state.status = Status::Cancelled;
            }
            if state.cancel_reason.is_none() {
                state.cancel_reason = Some(reason.to_string());
            }
            state.admission_closed = true;
            state.children.clone()
        };
        self.not_ok.signal();
        for child in &children {
            child.cancel_subtree(reason);
        }
    }

    /// Registers a finalizer to run, LIFO, during this scope's join.
    /// See [`Finalizer`] for the argument contract.
    pub fn finally(
        &self,
        f: impl FnOnce(bool, FinalStatus, Option<TaskError>) -> Result<(), TaskError> + Send + 'static,
    ) {
        self.state.lock().finalizers.push(Box::new(f));
    }

    /// The scope's current fault, if it is not ok: the real primary on a
    /// failed scope, or the cancellation sentinel (carrying the recorded
    /// reason) on a cancelled one. `None` while running or ok.
    fn not_ok_error(&self) -> Option<TaskError> {
        let state = self.state.lock();
        match state.status {
            Status::Failed => Some(
                state
                    .primary
                    .clone()
                    .expect("a failed scope always records a primary fault"),
            ),
            Status::Cancelled => Some(TaskError::Cancelled(
                state.cancel_reason.clone().unwrap_or_default(),
            )),
            Status::Running | Status::Ok => None,
        }
    }

    /// Races `op` against this scope's not-ok condition. On not-ok,
    /// returns the scope's real fault: the primary failure if the scope
    /// failed, or the cancellation sentinel (with reason) if it was
    /// merely cancelled — never collapsing one into the other.
    pub fn try_op(self: &Arc<Self>, op: Op) -> Result<Box<dyn std::any::Any + Send>, TaskError> {
        if let Some(err) = self.not_ok_error() {
            return Err(err);
        }
        let guarded = op::boolean_choice(op, self.not_ok_op());
        let (is_primary, value) = *op::perform(guarded)
            .downcast::<(bool, Box<dyn std::any::Any + Send>)>()
            .expect("boolean_choice always yields (bool, value)");
        if is_primary {
            Ok(value)
        } else {
            Err(self
                .not_ok_error()
                .unwrap_or_else(|| TaskError::Cancelled(String::new())))
        }
    }

    /// Performs `op`, propagating scope cancellation or failure as the
    /// real `TaskError` rather than a generic cancellation.
    pub fn perform(self: &Arc<Self>, op: Op) -> Result<Box<dyn std::any::Any + Send>, TaskError> {
        self.try_op(op)
    }

    /// Admission-closing, deterministic join: stop accepting new fibers,
    /// wait for the wait-group to drain, join children in attachment
    /// order, then run finalizers LIFO. Returns the scope's `Report`.
    pub fn join(self: &Arc<Self>) -> Report {
        {
            let mut state = self.state.lock();
            state.admission_closed = true;
            if let Some(report) = &state.report {
                return report.clone();
            }
        }
        self.wait_for_drain();

        let children: Vec<Arc<Scope>> = self.state.lock().children.clone();
        let child_reports: Vec<Report> = children.iter().map(|c| c.join()).collect();

        let finalizers = std::mem::take(&mut self.state.lock().finalizers);
        for finalizer in finalizers.into_iter().rev() {
            let (status, primary) = {
                let state = self.state.lock();
                let status = state.status.finalized();
                let primary = if status == FinalStatus::Failed {
                    state.primary.clone()
                } else {
                    None
                };
                (status, primary)
            };
            let aborted = status != FinalStatus::Ok;
            if let Err(err) = finalizer(aborted, status, primary) {
                let mut state = self.state.lock();
                if state.primary.is_none() {
                    state.primary = Some(err);
                    state.status = Status::Failed;
                } else {
                    state.extra_errors.push(err);
                }
            }
        }

        let mut state = self.state.lock();
        if state.status == Status::Running {
            state.status = Status::Ok;
        }
        let report = Report {
            id: self.id,
            primary: state.primary.clone(),
            extra_errors: state.extra_errors.clone(),
            children: child_reports,
        };
        state.report = Some(report.clone());
        report
    }

    /// Registers `f` to run, once, the moment `live_fibers` reaches
    /// zero (immediately, inline, if it already has).
    fn on_drained(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.live_fibers == 0 {
            drop(state);
            f();
        } else {
            state.drain_waiters.push(Box::new(f));
        }
    }

    /// Waits for this scope's wait-group to drain to zero. `join` can run
    /// either outside any fiber (the top-level `run` entry point, after
    /// its own pump loop) or from inside one (`run_scope` called from a
    /// running fiber's body, including nested scopes). Blocking the
    /// calling OS thread on a plain condvar is only safe in the former
    /// case: a fiber's thread holds the baton, and only the scheduler's
    /// driving thread can ever run the `StartFiberTask`s that would let
    /// the wait-group drain, so blocking from inside a fiber would
    /// starve the very thing being waited for. From inside a fiber this
    /// suspends the fiber instead, handing the baton back so the
    /// scheduler can keep making progress.
    fn wait_for_drain(self: &Arc<Self>) {
        if crate::fiber::current_fiber().is_some() {
            self.wait_for_drain_suspended();
        } else {
            self.wait_for_drain_blocking();
        }
    }

    fn wait_for_drain_blocking(&self) {
        let waiter = Arc::new((Mutex::new(false), parking_lot::Condvar::new()));
        let w = waiter.clone();
        self.on_drained(move || {
            *w.0.lock() = true;
            w.1.notify_all();
        });
        let mut guard = waiter.0.lock();
        while !*guard {
            waiter.1.wait(&mut guard);
        }
    }

    fn wait_for_drain_suspended(self: &Arc<Self>) {
        let self2 = self.clone();
        Fiber::suspend(move |sched, _fiber, susp| {
            let susp = susp.clone();
            let sched = crate::scheduler::handle(sched);
            self2.on_drained(move || {
                susp.complete(&sched, 0, Box::new(()));
            });
        });
    }

    /// A join-as-Op for use from inside a fiber: suspends the performing
    /// fiber until the wait-group drains, without a second OS thread.
    pub fn join_op(self: &Arc<Self>) -> Op {
        self.state.lock().admission_closed = true;
        let self2 = self.clone();
        let try_fn: crate::op::TryFn = Box::new(move || {
            if self2.state.lock().live_fibers == 0 {
                Some(Box::new(()) as crate::op::BoxedValue)
            } else {
                None
            }
        });
        let self3 = self.clone();
        let block_fn: crate::op::BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
            let susp = susp.clone();
            let sched = crate::scheduler::handle(sched);
            self3.on_drained(move || {
                susp.complete(&sched, leaf_index, Box::new(()));
            });
        });
        Op::primitive(try_fn, block_fn)
    }
}
