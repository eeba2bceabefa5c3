//! One-shot, signal-all condition used to carry nack and abort notifications.

use parking_lot::Mutex;
use std::sync::Arc;

type AbortFn = Box<dyn FnOnce() + Send>;

struct Inner {
    triggered: bool,
    waiters: Vec<Box<dyn FnOnce() + Send>>,
    abort_fn: Option<AbortFn>,
}

/// A one-shot, signal-all rendezvous.
///
/// `signal` is idempotent: only the first call runs waiters and the
/// abort function; every later call is a no-op. Waiters registered after
/// the cond has already triggered run immediately, inline, in `on_signal`.
#[derive(Clone)]
pub struct Cond {
    inner: Arc<Mutex<Inner>>,
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            inner: Arc::new(Mutex::new(Inner {
                triggered: false,
                waiters: Vec::new(),
                abort_fn: None,
            })),
        }
    }

    /// A cond whose `signal` additionally runs `abort_fn` exactly once.
    pub fn with_abort(abort_fn: impl FnOnce() + Send + 'static) -> Self {
        Cond {
            inner: Arc::new(Mutex::new(Inner {
                triggered: false,
                waiters: Vec::new(),
                abort_fn: Some(Box::new(abort_fn)),
            })),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.lock().triggered
    }

    /// Identity for this cond's underlying allocation, used only to
    /// de-duplicate nack signalling across leaves that share a cond.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Registers `f` to run once, at or after the moment this cond
    /// triggers. If the cond has already triggered, `f` runs immediately.
    pub fn on_signal(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.triggered {
            drop(inner);
            f();
        } else {
            inner.waiters.push(Box::new(f));
        }
    }

    /// Triggers the cond. Idempotent: only the first call has any effect.
    pub fn signal(&self) {
        let (waiters, abort_fn) = {
            let mut inner = self.inner.lock();
            if inner.triggered {
                return;
            }
            inner.triggered = true;
            (std::mem::take(&mut inner.waiters), inner.abort_fn.take())
        };
        if let Some(abort_fn) = abort_fn {
            abort_fn();
        }
        for waiter in waiters {
            waiter();
        }
    }
}

impl Default for Cond {
    fn default() -> Self {
        Cond::new()
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn signal_is_idempotent() {
        let cond = Cond::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cond.on_signal(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        cond.signal();
        cond.signal();
        cond.signal();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiter_registered_after_signal_runs_immediately() {
        let cond = Cond::new();
        cond.signal();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        cond.on_signal(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_fn_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cond = Cond::with_abort(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        cond.signal();
        cond.signal();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multiple_waiters_all_wake() {
        let cond = Cond::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = count.clone();
            cond.on_signal(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        cond.signal();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
