//! The smallest schedulable unit the scheduler runs.
//!
//! A `Task` is not a fiber: it has a `run` operation and optionally a
//! `cancel` operation, and it runs at most once. A task typically
//! *resumes* a fiber by completing a [`crate::suspension::Suspension`]
//! (see [`crate::suspension::CompleteTask`]), but the scheduler itself
//! only ever knows about the `Task` interface.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::scheduler::Scheduler;

/// Unique identifier for a task, used only for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        TaskId::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// One-shot schedulable work. Implementors are pushed onto the
/// scheduler's ready queue by a task source and run exactly once.
pub trait Task: Send {
    /// Runs the task. May enqueue further tasks onto `sched`'s next-turn
    /// queue (never onto the queue currently being drained).
    fn run(self: Box<Self>, sched: &Scheduler);

    /// Cancels the task before it has run, if the source supports it.
    /// Default is a no-op; sources that need cancellation (e.g. the
    /// timer wheel during shutdown) override it.
    fn cancel(self: Box<Self>, _reason: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_monotonic() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn task_id_display() {
        let id = TaskId::new();
        assert!(id.to_string().starts_with("Task("));
    }
}
