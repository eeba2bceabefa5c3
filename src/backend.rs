//! Interfaces this crate consumes but does not implement: byte-stream
//! I/O, kernel polling, and external process execution are all
//! explicitly out of scope here. These traits document the seams a
//! concrete backend crate plugs into; no implementation lives in this
//! crate.

use std::time::Duration;

use crate::waitable::{Interest, ResourceId};

/// A source of kernel readiness events. A concrete implementation (not
/// provided here) wraps epoll/kqueue/IOCP or similar and is driven by
/// [`crate::poller::Poller`] as a [`crate::scheduler::TaskSource`].
pub trait PollerBackend: Send + Sync {
    /// Blocks up to `timeout` for any registered resource to become
    /// ready, returning the ones that did.
    fn poll(&self, timeout: Duration) -> Vec<(ResourceId, Interest)>;

    /// Registers interest in a resource; returns an opaque id the
    /// backend assigns for its own bookkeeping.
    fn watch(&self, interest: Interest) -> ResourceId;

    fn unwatch(&self, resource: ResourceId, interest: Interest);
}

/// A byte-oriented, buffered stream. Left undefined here: this crate's
/// scope is the concurrency core, not stream buffering or framing.
pub trait StreamBackend: Send + Sync {
    fn resource_id(&self) -> ResourceId;
}

/// External process execution. Left undefined here for the same reason.
pub trait ExecBackend: Send + Sync {
    fn spawn_process(&self, command: &str, args: &[&str]) -> Result<u32, String>;
}
