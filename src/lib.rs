//! A cooperative, single-process concurrency runtime.
//!
//! Everything here runs on one logical thread of control at a time: a
//! scheduler turn loop drives a hierarchical timer wheel and pluggable
//! task sources, structured concurrency scopes form a supervision tree
//! with fail-fast propagation and deterministic join, and a small event
//! algebra ("Ops": primitives, choice, guard, with-nack, wrap, abort)
//! lets unrelated subsystems (channels, sleeps, readiness waits) compose
//! into a single atomic commit. An I/O readiness layer converts a
//! pluggable poller backend's kernel readiness notifications into
//! scheduled resumptions.
//!
//! Pre-emption, parallel execution across OS threads, cross-process
//! coordination, and work-stealing are explicitly out of scope: exactly
//! one fiber is ever logically running, by construction.
//!
//! # Modules
//!
//! - [`scheduler`]: ready queue, monotonic time, task sources, main loop.
//! - [`timer`]: ordered expiry of time-based tasks.
//! - [`task`]: the smallest schedulable unit.
//! - [`fiber`]: a suspendable execution context with an ambient scope.
//! - [`suspension`]: the one-shot rendezvous between a commit and a resume.
//! - [`cond`]: a one-shot signal-all condition (nacks, aborts).
//! - [`waitset`]: O(1) keyed multimap of waiting tasks.
//! - [`op`]: the event algebra and its compile-and-commit discipline.
//! - [`scope`]: structured concurrency, supervision, deterministic join.
//! - [`channel`]: a CSP-style channel expressed as a pair of Ops.
//! - [`sleep`]: sleeping as an Op, built on the timer wheel.
//! - [`waitable`]: generic I/O-readiness registration.
//! - [`backend`]: interfaces this crate consumes but does not implement.
//! - [`poller`]: task-source glue for a concrete `PollerBackend`.
//! - [`run`]: top-level entry points.
//! - [`config`]: construction-time configuration.
//! - [`error`]: the runtime's error taxonomy.

pub mod backend;
pub mod channel;
pub mod cond;
pub mod config;
pub mod error;
pub mod fiber;
pub mod op;
pub mod poller;
pub mod run;
pub mod scheduler;
pub mod scope;
pub mod sleep;
pub mod suspension;
pub mod task;
pub mod timer;
pub mod waitable;
pub mod waitset;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, TaskError};
pub use fiber::{current_fiber, current_scope, with_root_scope, Fiber, FiberId};
pub use op::{
    always, bracket, boolean_choice, choice, first_ready, named_choice, never, or_else, perform,
    race, try_perform, Op,
};
pub use run::{current, perform as perform_ambient, run, run_scope, run_scope_op, spawn};
pub use scheduler::Scheduler;
pub use scope::{FinalStatus, Report, Scope, ScopeId};
pub use task::{Task, TaskId};
