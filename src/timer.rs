//! Ordered expiry of time-based tasks.
//!
//! The original design is a bucketed ring ("wheel"); this implementation
//! keeps the same public shape (`add_absolute`/`add_delta`/`advance`/
//! `next_entry_time`/`pop`) over a `BTreeMap` keyed by `(deadline, seq)`,
//! which gives the same ordered-expiry and stable tie-break guarantees
//! with a far smaller surface to get wrong. `advance` only ever
//! schedules; it never runs a task itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::scheduler::{Scheduler, TaskSource};
use crate::task::Task;

/// A handle to a scheduled timer entry, usable to cancel it before it fires.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Entry {
    task: Box<dyn Task>,
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    entries: BTreeMap<(Instant, u64), Entry>,
    next_seq: u64,
}

/// Hierarchical expiry structure keyed by absolute monotonic time.
pub struct TimerWheel {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl TimerWheel {
    pub fn new() -> Arc<Self> {
        Arc::new(TimerWheel {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_seq: 0,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Schedules `task` to run at absolute monotonic time `t`. Tie-breaks
    /// among entries with equal `t` follow insertion order.
    pub fn add_absolute(&self, t: Instant, task: Box<dyn Task>) -> TimerHandle {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        inner.entries.insert(
            (t, seq),
            Entry {
                task,
                cancelled: cancelled.clone(),
            },
        );
        TimerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cancelled,
        }
    }

    /// Schedules `task` to run `dt` from now.
    pub fn add_delta(&self, dt: Duration, task: Box<dyn Task>) -> TimerHandle {
        self.add_absolute(Instant::now() + dt, task)
    }

    /// Schedules every entry whose deadline is `<= now` onto `sched`.
    /// Does not run any task itself.
    pub fn advance(&self, now: Instant, sched: &Scheduler) {
        let due: Vec<(Instant, u64)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .range(..=(now, u64::MAX))
                .map(|(k, _)| *k)
                .collect()
        };
        for key in due {
            let entry = {
                let mut inner = self.inner.lock();
                inner.entries.remove(&key)
            };
            if let Some(entry) = entry {
                if !entry.cancelled.load(Ordering::SeqCst) {
                    sched.schedule(entry.task);
                }
            }
        }
    }

    /// The earliest deadline still pending, or `None` if the wheel is empty.
    pub fn next_entry_time(&self) -> Option<Instant> {
        self.inner.lock().entries.keys().next().map(|(t, _)| *t)
    }

    /// Unconditionally removes and returns the earliest-deadline task,
    /// regardless of whether its deadline has passed. Used by shutdown
    /// draining and by tests that want deterministic single-step control.
    pub fn pop(&self) -> Option<Box<dyn Task>> {
        let mut inner = self.inner.lock();
        let key = *inner.entries.keys().next()?;
        inner.entries.remove(&key).map(|e| e.task)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl TaskSource for TimerWheel {
    fn schedule_tasks(&self, sched: &Scheduler, now: Instant, _timeout: Duration) {
        self.advance(now, sched);
    }

    fn cancel_all_tasks(&self, _sched: &Scheduler) {
        while let Some(task) = self.pop() {
            task.cancel("shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordTask(Arc<AtomicUsize>, usize);
    impl Task for RecordTask {
        fn run(self: Box<Self>, _sched: &Scheduler) {
            self.0.store(self.1, Ordering::SeqCst);
        }
    }

    #[test]
    fn next_entry_time_is_none_when_empty() {
        let wheel = TimerWheel::new();
        assert!(wheel.next_entry_time().is_none());
    }

    struct OrderTask(Arc<Mutex<Vec<usize>>>, usize);
    impl Task for OrderTask {
        fn run(self: Box<Self>, _sched: &Scheduler) {
            self.0.lock().push(self.1);
        }
    }

    #[test]
    fn equal_deadlines_tie_break_by_insertion_order() {
        let wheel = TimerWheel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let sched = crate::scheduler::Scheduler::new();
        let t = Instant::now();
        wheel.add_absolute(t, Box::new(OrderTask(order.clone(), 1)));
        wheel.add_absolute(t, Box::new(OrderTask(order.clone(), 2)));
        wheel.add_absolute(t, Box::new(OrderTask(order.clone(), 3)));
        wheel.advance(t, &sched);
        sched.drain_ready_for_test();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn advance_delivers_every_due_entry() {
        let wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sched = crate::scheduler::Scheduler::new();
        let base = Instant::now();
        for i in 0..5 {
            wheel.add_absolute(base, Box::new(RecordTask(count.clone(), i)));
        }
        wheel.advance(base, &sched);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancelled_handle_is_skipped_on_advance() {
        let wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sched = crate::scheduler::Scheduler::new();
        let t = Instant::now();
        let handle = wheel.add_absolute(t, Box::new(RecordTask(count.clone(), 42)));
        handle.cancel();
        wheel.advance(t, &sched);
        sched.drain_ready_for_test();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pop_is_unconditional() {
        let wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let far_future = Instant::now() + Duration::from_secs(3600);
        wheel.add_absolute(far_future, Box::new(RecordTask(count, 7)));
        assert!(wheel.pop().is_some());
        assert!(wheel.is_empty());
    }
}
