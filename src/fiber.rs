//! A cooperatively-resumable execution context carrying an ambient scope.
//!
//! Only one fiber is ever *logically* executing at a time, per the data
//! model's invariant. This implementation realizes that invariant with a
//! dedicated OS thread per fiber gated by a single-permit baton (a
//! `parking_lot` `Mutex` + `Condvar` pair): the fiber's thread blocks
//! except while it holds the baton, and `resume`/`suspend` hand it off
//! exactly once per transition. Exactly one thread runs user code at any
//! instant; the rest are parked. This is a direct generalization of the
//! condvar-rendezvous idiom already used throughout this codebase for
//! one-shot completions, rather than a hand-rolled stackful coroutine or
//! an external coroutine dependency (none exists in this codebase's
//! dependency stack).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;
use crate::scheduler::Scheduler;
use crate::scope::Scope;
use crate::suspension::Suspension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FiberId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Owner {
    Scheduler,
    FiberThread,
}

struct Baton {
    owner: Mutex<Owner>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Baton {
            owner: Mutex::new(Owner::Scheduler),
            cv: Condvar::new(),
        }
    }

    fn hand_to_fiber(&self) {
        let mut owner = self.owner.lock();
        *owner = Owner::FiberThread;
        self.cv.notify_all();
    }

    fn wait_until_scheduler(&self) {
        let mut owner = self.owner.lock();
        while *owner == Owner::FiberThread {
            self.cv.wait(&mut owner);
        }
    }

    fn hand_to_scheduler(&self) {
        let mut owner = self.owner.lock();
        *owner = Owner::Scheduler;
        self.cv.notify_all();
    }

    fn wait_until_fiber(&self) {
        let mut owner = self.owner.lock();
        while *owner == Owner::Scheduler {
            self.cv.wait(&mut owner);
        }
    }
}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static CURRENT_ROOT_SCOPE: RefCell<Option<Arc<Scope>>> = RefCell::new(None);
}

/// Installs `scope` as this thread's fallback "process root" for
/// `current_scope` when no fiber is active. Used by the top-level `run`
/// entry point for the duration of the run.
pub fn with_root_scope<R>(scope: Arc<Scope>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_ROOT_SCOPE.with(|c| c.borrow_mut().replace(scope));
    let result = f();
    CURRENT_ROOT_SCOPE.with(|c| *c.borrow_mut() = previous);
    result
}

pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

/// The fiber's ambient scope, or the process root if no fiber is active.
pub fn current_scope() -> Option<Arc<Scope>> {
    if let Some(fiber) = current_fiber() {
        return Some(fiber.scope());
    }
    CURRENT_ROOT_SCOPE.with(|c| c.borrow().clone())
}

/// A suspendable computation with an ambient scope reference and a
/// resumable continuation (realized here as a parked OS thread).
pub struct Fiber {
    id: FiberId,
    scope: Arc<Scope>,
    sched: Arc<Scheduler>,
    baton: Arc<Baton>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Fiber {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn scope(&self) -> Arc<Scope> {
        self.scope.clone()
    }

    /// Spawns `body` as a new fiber under `scope`, registering it with
    /// the scope's wait-group. The fiber does not begin running until
    /// the scheduler runs its start task (so admission and the actual
    /// first turn are distinct, matching the scheduler's turn discipline).
    pub fn spawn(
        scope: Arc<Scope>,
        sched: Arc<Scheduler>,
        body: impl FnOnce() -> Result<(), TaskError> + Send + 'static,
    ) -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: FiberId::new(),
            scope: scope.clone(),
            sched: sched.clone(),
            baton: Arc::new(Baton::new()),
            thread: Mutex::new(None),
        });

        let thread_fiber = fiber.clone();
        let baton = fiber.baton.clone();
        let thread_scope = scope.clone();
        let name = format!("{}-{}", scope.stack_name_prefix(), fiber.id);

        let mut builder = std::thread::Builder::new().name(name);
        if let Some(size) = scope.stack_size() {
            builder = builder.stack_size(size);
        }

        let handle = builder
            .spawn(move || {
                baton.wait_until_fiber();
                CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(thread_fiber.clone()));

                let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
                    Ok(result) => result,
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
                };

                CURRENT_FIBER.with(|c| *c.borrow_mut() = None);
                thread_scope.fiber_finished(thread_fiber.id, outcome);
                baton.hand_to_scheduler();
            })
            .expect("failed to spawn fiber thread");
        *fiber.thread.lock() = Some(handle);

        sched.schedule(Box::new(StartFiberTask { fiber: fiber.clone() }));
        fiber
    }

    /// Hands the baton to this fiber's thread and blocks the calling
    /// thread until the fiber either suspends again or finishes. Called
    /// only from the scheduler's driving thread (main loop or a
    /// `CompleteTask`), never reentrantly from the fiber's own thread.
    pub fn resume(&self, _sched: &Scheduler) {
        self.baton.hand_to_fiber();
        self.baton.wait_until_scheduler();
    }

    /// Called from inside the running fiber's own thread. Invokes
    /// `block_fn` to arrange a future resumption against `suspension`;
    /// if that didn't resolve synchronously, yields the baton and blocks
    /// until resumed, then returns the winning leaf's payload.
    pub fn suspend(
        block_fn: impl FnOnce(&Scheduler, &Arc<Fiber>, &Suspension),
    ) -> crate::suspension::Winner {
        let fiber = current_fiber().expect("suspend called outside a fiber");
        let susp = Suspension::new(fiber.clone());
        block_fn(&fiber.sched, &fiber, &susp);

        if susp.waiting() {
            fiber.baton.hand_to_scheduler();
            fiber.baton.wait_until_fiber();
        }

        susp.take_winner()
            .expect("fiber resumed without a committed winner")
    }
}

struct StartFiberTask {
    fiber: Arc<Fiber>,
}

impl crate::task::Task for StartFiberTask {
    fn run(self: Box<Self>, sched: &Scheduler) {
        self.fiber.resume(sched);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked with a non-string payload".to_string()
    }
}
