//! A CSP-style channel expressed as a pair of Ops (`put_op`/`get_op`)
//! rather than blocking methods, so it composes with `choice`/`wrap`/
//! `with_nack` like any other event.
//!
//! Fast path: a direct sender-to-receiver handoff, or (if buffered) a
//! buffer push/pop, committed without ever touching the wait queues.
//! Slow path: install a tombstonable wait-queue node (via `Waitset`) on
//! whichever side can't proceed; the other side's fast or slow path
//! pairs with it and transfers the value exactly once. A lost race's
//! `abort` handler unlinks the node in O(1).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::op::{BoxedValue, Op};
use crate::waitset::{Token, Waitset};

/// Outcome of a `put_op`: whether the value was actually delivered, or
/// the channel was already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Sent,
    Closed,
}

struct PendingSend<T> {
    value: Option<T>,
    ack: Box<dyn FnOnce(PutOutcome) + Send>,
}

struct Inner<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    closed: bool,
    receivers: Waitset<(), Box<dyn FnOnce(Option<T>) + Send>>,
    senders: Waitset<(), PendingSend<T>>,
}

/// A bounded (or, with capacity `0`, rendezvous) FIFO channel.
pub struct Channel<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Send + 'static> Channel<T> {
    /// `capacity == 0` means unbuffered: a put only ever completes by
    /// direct handoff to a waiting get.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Channel {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                capacity,
                closed: false,
                receivers: Waitset::new(),
                senders: Waitset::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes the channel. Idempotent. Senders and receivers currently
    /// parked wake with `PutOutcome::Closed` / `None` respectively.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.receivers.notify_all(&(), |recv| recv(None));
        inner.senders.notify_all(&(), |send| (send.ack)(PutOutcome::Closed));
    }

    fn try_put(&self, value: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(value);
        }
        if let Some(recv) = inner.receivers.take_one(&()) {
            drop(inner);
            recv(Some(value));
            return Ok(());
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(());
        }
        Err(value)
    }

    /// `Ok(Some(v))`: committed with a value. `Ok(None)`: committed,
    /// channel closed and drained. `Err(())`: not ready, must block.
    fn try_get(&self) -> Result<Option<T>, ()> {
        let mut inner = self.inner.lock();
        if let Some(v) = inner.buffer.pop_front() {
            if let Some(send) = inner.senders.take_one(&()) {
                let value = send.value.expect("pending send always carries a value");
                inner.buffer.push_back(value);
                drop(inner);
                (send.ack)(PutOutcome::Sent);
            }
            return Ok(Some(v));
        }
        if let Some(send) = inner.senders.take_one(&()) {
            let value = send.value.expect("pending send always carries a value");
            drop(inner);
            (send.ack)(PutOutcome::Sent);
            return Ok(Some(value));
        }
        if inner.closed {
            return Ok(None);
        }
        Err(())
    }

    fn register_receiver(&self, cb: Box<dyn FnOnce(Option<T>) + Send>) -> Token {
        self.inner.lock().receivers.add((), cb)
    }

    fn register_sender(&self, value: T, ack: Box<dyn FnOnce(PutOutcome) + Send>) -> Token {
        self.inner.lock().senders.add(
            (),
            PendingSend {
                value: Some(value),
                ack,
            },
        )
    }

    fn unlink_receiver(&self, token: Token) {
        self.inner.lock().receivers.unlink(&(), token);
    }

    fn unlink_sender(&self, token: Token) {
        self.inner.lock().senders.unlink(&(), token);
    }
}

/// An Op that commits `PutOutcome::Sent` once `value` has been
/// delivered (by direct handoff or buffer push), or `PutOutcome::Closed`
/// if the channel closes while the put is parked.
pub fn put_op<T: Send + 'static>(chan: Arc<Channel<T>>, value: T) -> Op {
    let value_slot = Arc::new(Mutex::new(Some(value)));
    let token_slot: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));

    let chan_try = chan.clone();
    let value_try = value_slot.clone();
    let try_fn: crate::op::TryFn = Box::new(move || {
        let v = value_try.lock().take()?;
        match chan_try.try_put(v) {
            Ok(()) => Some(Box::new(PutOutcome::Sent) as BoxedValue),
            Err(v) => {
                *value_try.lock() = Some(v);
                None
            }
        }
    });

    let chan_block = chan.clone();
    let token_block = token_slot.clone();
    let block_fn: crate::op::BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
        let value = value_slot
            .lock()
            .take()
            .expect("block_fn called without a pending value");
        let susp = susp.clone();
        let sched = crate::scheduler::handle(sched);
        let token = chan_block.register_sender(
            value,
            Box::new(move |outcome| {
                susp.complete(&sched, leaf_index, Box::new(outcome));
            }),
        );
        *token_block.lock() = Some(token);
    });

    Op::primitive(try_fn, block_fn).abort(move || {
        if let Some(token) = token_slot.lock().take() {
            chan.unlink_sender(token);
        }
    })
}

/// An Op that commits `Some(value)` on a received value, or `None` once
/// the channel is closed and drained.
pub fn get_op<T: Send + 'static>(chan: Arc<Channel<T>>) -> Op {
    let token_slot: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));

    let chan_try = chan.clone();
    let try_fn: crate::op::TryFn = Box::new(move || match chan_try.try_get() {
        Ok(v) => Some(Box::new(v) as BoxedValue),
        Err(()) => None,
    });

    let chan_block = chan.clone();
    let token_block = token_slot.clone();
    let block_fn: crate::op::BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
        let susp = susp.clone();
        let sched = crate::scheduler::handle(sched);
        let token = chan_block.register_receiver(Box::new(move |value| {
            susp.complete(&sched, leaf_index, Box::new(value));
        }));
        *token_block.lock() = Some(token);
    });

    Op::primitive(try_fn, block_fn).abort(move || {
        if let Some(token) = token_slot.lock().take() {
            chan.unlink_receiver(token);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{perform, try_perform};
    use crate::scheduler::Scheduler;
    use crate::scope::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn downcast_put(v: BoxedValue) -> PutOutcome {
        *v.downcast::<PutOutcome>().unwrap()
    }

    fn downcast_get(v: BoxedValue) -> Option<i32> {
        *v.downcast::<Option<i32>>().unwrap()
    }

    #[test]
    fn buffered_put_then_get_fast_path() {
        let chan = Channel::<i32>::new(2);
        let outcome = downcast_put(try_perform(put_op(chan.clone(), 10)).unwrap());
        assert_eq!(outcome, PutOutcome::Sent);
        let got = downcast_get(try_perform(get_op(chan)).unwrap());
        assert_eq!(got, Some(10));
    }

    #[test]
    fn buffer_capacity_bounds_fast_path_puts() {
        let chan = Channel::<i32>::new(1);
        assert!(try_perform(put_op(chan.clone(), 1)).is_some());
        assert!(try_perform(put_op(chan.clone(), 2)).is_none());
        assert_eq!(chan.len(), 1);
    }

    #[test]
    fn rendezvous_put_blocks_until_a_receiver_arrives() {
        let sched = Scheduler::new();
        let root = Scope::new_root(&sched);
        let chan = Channel::<i32>::new(0);
        let received = Arc::new(AtomicUsize::new(0));
        let r = received.clone();

        let c1 = chan.clone();
        root.clone().spawn(move || {
            let outcome = downcast_put(perform(put_op(c1, 99)));
            assert_eq!(outcome, PutOutcome::Sent);
            Ok(())
        });

        sched.run(Instant::now());
        assert_eq!(received.load(Ordering::SeqCst), 0);

        let c2 = chan;
        root.clone().spawn(move || {
            let got = downcast_get(perform(get_op(c2)));
            assert_eq!(got, Some(99));
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        sched.drain_ready_for_test();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closing_wakes_a_parked_receiver_with_none() {
        let sched = Scheduler::new();
        let root = Scope::new_root(&sched);
        let chan = Channel::<i32>::new(0);
        let saw_close = Arc::new(AtomicUsize::new(0));
        let s = saw_close.clone();

        let c1 = chan.clone();
        root.clone().spawn(move || {
            let got = downcast_get(perform(get_op(c1)));
            assert_eq!(got, None);
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        sched.run(Instant::now());
        chan.close();
        sched.drain_ready_for_test();
        assert_eq!(saw_close.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn losing_a_choice_unlinks_the_waiter() {
        let sched = Scheduler::new();
        let root = Scope::new_root(&sched);
        let chan = Channel::<i32>::new(0);
        let picked_always = Arc::new(AtomicUsize::new(0));
        let p = picked_always.clone();

        let c1 = chan.clone();
        root.clone().spawn(move || {
            let v = crate::op::choice(vec![
                get_op(c1).wrap(|v| v),
                crate::op::always(Box::new(7i32)),
            ]);
            let _ = perform(v);
            p.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        sched.run(Instant::now());
        sched.drain_ready_for_test();
        assert_eq!(picked_always.load(Ordering::SeqCst), 1);
        assert!(chan.is_empty());
    }
}
