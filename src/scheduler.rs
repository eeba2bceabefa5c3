//! Ready queue, time, task sources, and the main loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::RuntimeConfig;
use crate::task::Task;
use crate::timer::TimerWheel;

/// A scheduler-registered object that contributes ready tasks per turn.
///
/// `schedule_tasks` may push tasks onto `sched`'s next-turn queue via
/// [`Scheduler::schedule`]; it must not run them directly. `timeout` is
/// the amount of time the caller is willing for this source to spend
/// waiting for external events, and is only meaningful for a source
/// installed as the scheduler's event-waiter (`0` otherwise).
pub trait TaskSource: Send + Sync {
    fn schedule_tasks(&self, sched: &Scheduler, now: Instant, timeout: Duration);

    /// Cancels every task this source still holds. Used by `shutdown`.
    fn cancel_all_tasks(&self, _sched: &Scheduler) {}
}

struct Queues {
    current: VecDeque<Box<dyn Task>>,
    next: VecDeque<Box<dyn Task>>,
}

/// Owns the ready queue, monotonic time, and the set of task sources.
pub struct Scheduler {
    queues: Mutex<Queues>,
    now: Mutex<Instant>,
    sources: Mutex<Vec<Arc<dyn TaskSource>>>,
    event_waiter: Mutex<Option<Arc<dyn TaskSource>>>,
    timer_wheel: Arc<TimerWheel>,
    done: Mutex<bool>,
    max_sleep: Duration,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Self::with_config(&RuntimeConfig::default())
    }

    pub fn with_config(config: &RuntimeConfig) -> Arc<Self> {
        let timer_wheel = TimerWheel::new();
        let sched = Arc::new(Scheduler {
            queues: Mutex::new(Queues {
                current: VecDeque::new(),
                next: VecDeque::new(),
            }),
            now: Mutex::new(Instant::now()),
            sources: Mutex::new(Vec::new()),
            event_waiter: Mutex::new(None),
            timer_wheel: timer_wheel.clone(),
            done: Mutex::new(false),
            max_sleep: config.max_sleep,
        });
        sched.sources.lock().push(timer_wheel);
        sched
    }

    pub fn timer_wheel(&self) -> &Arc<TimerWheel> {
        &self.timer_wheel
    }

    pub fn now(&self) -> Instant {
        *self.now.lock()
    }

    /// Pushes `task` onto the next-turn queue.
    pub fn schedule(&self, task: Box<dyn Task>) {
        self.queues.lock().next.push_back(task);
    }

    /// Registers an additional task source (e.g. a poller).
    pub fn register_source(&self, source: Arc<dyn TaskSource>) {
        self.sources.lock().push(source);
    }

    /// Installs the scheduler's designated event-waiter: the source that
    /// `wait_for_events` delegates blocking to, if any is set.
    pub fn set_event_waiter(&self, source: Arc<dyn TaskSource>) {
        *self.event_waiter.lock() = Some(source);
    }

    /// Runs exactly one turn: consult sources, swap queues, run `current`.
    pub fn run(&self, now: Instant) {
        {
            let mut n = self.now.lock();
            if now > *n {
                *n = now;
            }
        }
        let now = self.now();

        let sources = self.sources.lock().clone();
        for source in &sources {
            source.schedule_tasks(self, now, Duration::ZERO);
        }

        let current: VecDeque<Box<dyn Task>> = {
            let mut q = self.queues.lock();
            std::mem::swap(&mut q.current, &mut q.next);
            std::mem::take(&mut q.current)
        };

        trace!(ready = current.len(), "scheduler turn");
        for task in current {
            task.run(self);
        }
    }

    fn wait_for_events(&self) {
        // Tasks already queued for the next turn (spawns, channel
        // handoffs, completions) mean this turn has work regardless of
        // outside events; don't block waiting for something that won't
        // be consulted anyway.
        if !self.queues.lock().next.is_empty() {
            return;
        }

        let now = self.now();
        let next_wake = self.timer_wheel.next_entry_time();
        let timeout = match next_wake {
            Some(t) if t > now => (t - now).min(self.max_sleep),
            Some(_) => Duration::ZERO,
            None => self.max_sleep,
        };

        let waiter = self.event_waiter.lock().clone();
        if let Some(waiter) = waiter {
            waiter.schedule_tasks(self, now, timeout);
        } else if timeout > Duration::ZERO {
            std::thread::sleep(timeout);
        }
    }

    /// One `{wait_for_events; run(monotime())}` pass.
    pub fn step(&self) {
        self.wait_for_events();
        self.run(Instant::now());
    }

    /// Repeats [`Scheduler::step`] until `stop` is called.
    pub fn main(&self) {
        while !*self.done.lock() {
            self.step();
        }
    }

    pub fn stop(&self) {
        *self.done.lock() = true;
    }

    pub fn is_empty(&self) -> bool {
        let q = self.queues.lock();
        q.current.is_empty() && q.next.is_empty()
    }

    /// Attempts up to `max_passes` passes, asking every source to cancel
    /// its held tasks and running whatever that produces, returning
    /// success once the queues are empty.
    pub fn shutdown(&self) -> bool {
        const MAX_PASSES: usize = 100;
        for _ in 0..MAX_PASSES {
            let sources = self.sources.lock().clone();
            for source in &sources {
                source.cancel_all_tasks(self);
            }
            self.run(Instant::now());
            if self.is_empty() {
                return true;
            }
        }
        self.is_empty()
    }

    /// Test-only helper: runs turns until the ready queues are drained,
    /// without touching wall-clock time. Useful for deterministic unit
    /// tests that don't want to depend on `main`'s sleep behavior.
    #[doc(hidden)]
    pub fn drain_ready_for_test(&self) {
        for _ in 0..1000 {
            if self.is_empty() {
                return;
            }
            self.run(Instant::now());
        }
    }
}

/// A raw-pointer handle to a scheduler, for passing `&Scheduler` through
/// callback boundaries (e.g. a `Cond::on_signal` closure) that must be
/// `Send` but run on an arbitrary thread. Sound because every
/// `Scheduler` this crate hands out is owned by an `Arc` kept alive for
/// the whole run (see `crate::run`), and all calls into it happen on
/// whichever thread currently holds the baton.
pub(crate) struct SchedulerHandle(*const Scheduler);
unsafe impl Send for SchedulerHandle {}
impl std::ops::Deref for SchedulerHandle {
    type Target = Scheduler;
    fn deref(&self) -> &Scheduler {
        unsafe { &*self.0 }
    }
}

pub(crate) fn handle(sched: &Scheduler) -> SchedulerHandle {
    SchedulerHandle(sched as *const Scheduler)
}
