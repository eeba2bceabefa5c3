//! The event algebra ("Ops"): primitive/choice/guard/with_nack/wrap/abort,
//! implemented via a compile-and-commit discipline.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::cond::Cond;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::suspension::Suspension;

/// A dynamically-typed committed value. Op bodies agree out of band on
/// the concrete type they stash here and downcast it back out.
pub type BoxedValue = Box<dyn Any + Send>;

pub type TryFn = Box<dyn Fn() -> Option<BoxedValue> + Send + Sync>;
pub type BlockFn = Box<dyn Fn(&Scheduler, &Arc<Fiber>, &Suspension, usize) + Send + Sync>;
pub type WrapFn = Arc<dyn Fn(BoxedValue) -> BoxedValue + Send + Sync>;

fn identity_wrap() -> WrapFn {
    Arc::new(|v| v)
}

/// A closed sum describing a potentially-blocking operation.
pub enum Op {
    Primitive {
        try_fn: TryFn,
        block_fn: BlockFn,
        wrap_fn: WrapFn,
    },
    Choice(Vec<Op>),
    Guard(Box<dyn FnOnce() -> Op + Send>),
    WithNack(Box<dyn FnOnce(Op) -> Op + Send>),
    Wrap(Box<Op>, WrapFn),
    Abort(Box<Op>, Box<dyn FnOnce() + Send>),
}

impl Op {
    pub fn primitive(try_fn: TryFn, block_fn: BlockFn) -> Op {
        Op::Primitive {
            try_fn,
            block_fn,
            wrap_fn: identity_wrap(),
        }
    }

    pub fn wrap(self, wrap_fn: impl Fn(BoxedValue) -> BoxedValue + Send + Sync + 'static) -> Op {
        Op::Wrap(Box::new(self), Arc::new(wrap_fn))
    }

    pub fn with_nack(builder: impl FnOnce(Op) -> Op + Send + 'static) -> Op {
        Op::WithNack(Box::new(builder))
    }

    pub fn abort(self, handler: impl FnOnce() + Send + 'static) -> Op {
        Op::Abort(Box::new(self), Box::new(handler))
    }
}

/// After compilation: a flat leaf with an identifying index used to
/// report which leaf won after a slow-path resume. Comparing integer
/// indices takes the place of comparing closure identity (the strategy
/// the dynamic-language source uses), which Rust has no stable way to do.
pub struct Leaf {
    pub try_fn: TryFn,
    pub block_fn: BlockFn,
    pub final_wrap: WrapFn,
    pub nacks: Vec<Cond>,
}

/// Compiles an Op tree into a flat list of leaves.
pub fn compile(op: Op) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    compile_into(op, identity_wrap(), Vec::new(), &mut leaves);
    if leaves.is_empty() {
        panic!("Choice with zero arms is illegal");
    }
    leaves
}

fn compile_into(op: Op, outer: WrapFn, nacks: Vec<Cond>, leaves: &mut Vec<Leaf>) {
    match op {
        Op::Primitive {
            try_fn,
            block_fn,
            wrap_fn,
        } => {
            let final_wrap: WrapFn = Arc::new(move |v| outer(wrap_fn(v)));
            leaves.push(Leaf {
                try_fn,
                block_fn,
                final_wrap,
                nacks,
            });
        }
        Op::Choice(ops) => {
            if ops.is_empty() {
                panic!("Choice with zero arms is illegal");
            }
            for sub in ops {
                compile_into(sub, outer.clone(), nacks.clone(), leaves);
            }
        }
        Op::Guard(builder) => {
            let sub = builder();
            compile_into(sub, outer, nacks, leaves);
        }
        Op::WithNack(builder) => {
            let cond = Cond::new();
            let nack_ev = wait_op(cond.clone());
            let sub = builder(nack_ev);
            let mut nacks = nacks;
            nacks.push(cond);
            compile_into(sub, outer, nacks, leaves);
        }
        Op::Wrap(inner, wrap_fn) => {
            let new_outer: WrapFn = Arc::new(move |v| outer(wrap_fn(v)));
            compile_into(*inner, new_outer, nacks, leaves);
        }
        Op::Abort(inner, abort_fn) => {
            let cond = Cond::with_abort(abort_fn);
            let mut nacks = nacks;
            nacks.push(cond);
            compile_into(*inner, outer, nacks, leaves);
        }
    }
}

/// An Op that becomes ready exactly when `cond` is signalled.
pub fn wait_op(cond: Cond) -> Op {
    let try_cond = cond.clone();
    let try_fn: TryFn = Box::new(move || {
        if try_cond.is_triggered() {
            Some(Box::new(()) as BoxedValue)
        } else {
            None
        }
    });
    let block_cond = cond;
    let block_fn: BlockFn = Box::new(move |sched, _fiber, susp, leaf_index| {
        let susp = susp.clone();
        let sched = sched_handle(sched);
        block_cond.on_signal(move || {
            susp.complete(&sched, leaf_index, Box::new(()));
        });
    });
    Op::primitive(try_fn, block_fn)
}

/// Cond's `on_signal` callback runs from whatever thread signals it,
/// which is not necessarily a fiber thread. It only needs `&Scheduler`
/// to call `Suspension::complete`, so we capture a cheap clone of the
/// scheduler handle rather than the thread-bound fiber.
fn sched_handle(sched: &Scheduler) -> SchedulerHandle {
    crate::scheduler::handle(sched)
}

fn signal_losers(leaves: &[Leaf], winner_nacks: &[Cond]) {
    let winner_ids: HashSet<usize> = winner_nacks.iter().map(Cond::ptr_id).collect();
    for leaf in leaves {
        for cond in &leaf.nacks {
            if !winner_ids.contains(&cond.ptr_id()) {
                cond.signal();
            }
        }
    }
}

/// Probes every leaf's `try_fn` in a uniformly randomized order; the
/// randomization is mandatory to avoid starvation when multiple leaves
/// are always ready. Returns the committed value on a fast-path win.
fn try_fast_path(leaves: &[Leaf]) -> Option<(usize, BoxedValue)> {
    let mut order: Vec<usize> = (0..leaves.len()).collect();
    order.shuffle(&mut rand::thread_rng());
    for i in order {
        if let Some(value) = (leaves[i].try_fn)() {
            return Some((i, value));
        }
    }
    None
}

/// Performs a compiled event, suspending the current fiber if no leaf
/// commits on the fast path. Panics if called outside a fiber.
pub fn perform_compiled(leaves: Vec<Leaf>) -> BoxedValue {
    if let Some((i, value)) = try_fast_path(&leaves) {
        signal_losers(&leaves, &leaves[i].nacks);
        return (leaves[i].final_wrap)(value);
    }

    let (leaf_index, raw_value) = Fiber::suspend(|sched, fiber, susp| {
        for (i, leaf) in leaves.iter().enumerate() {
            (leaf.block_fn)(sched, fiber, susp, i);
        }
    });

    signal_losers(&leaves, &leaves[leaf_index].nacks);
    (leaves[leaf_index].final_wrap)(raw_value)
}

pub fn perform(op: Op) -> BoxedValue {
    perform_compiled(compile(op))
}

/// Fast-path-only probe: never suspends. Returns `None` if every leaf
/// would have to block.
pub fn try_perform(op: Op) -> Option<BoxedValue> {
    let leaves = compile(op);
    try_fast_path(&leaves).map(|(i, value)| {
        signal_losers(&leaves, &leaves[i].nacks);
        (leaves[i].final_wrap)(value)
    })
}

// --- Convenience combinators -------------------------------------------------

/// Flattens immediate `Choice` children eagerly; a single remaining arm
/// collapses to that arm rather than a one-element `Choice`.
pub fn choice(ops: Vec<Op>) -> Op {
    let mut flat = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            Op::Choice(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    if flat.is_empty() {
        panic!("Choice with zero arms is illegal");
    }
    if flat.len() == 1 {
        return flat.into_iter().next().unwrap();
    }
    Op::Choice(flat)
}

pub fn race(ops: Vec<Op>) -> Op {
    choice(ops)
}

pub fn first_ready(ops: Vec<Op>) -> Op {
    choice(ops)
}

/// Attaches a stable branch label to each arm via `wrap`, so the winner
/// carries `(label, value)`.
pub fn named_choice(branches: Vec<(&'static str, Op)>) -> Op {
    let ops = branches
        .into_iter()
        .map(|(name, op)| op.wrap(move |v| Box::new((name, v)) as BoxedValue))
        .collect();
    choice(ops)
}

/// `choice(a, b)` wrapped so the result also carries which side committed.
pub fn boolean_choice(a: Op, b: Op) -> Op {
    choice(vec![
        a.wrap(|v| Box::new((true, v)) as BoxedValue),
        b.wrap(|v| Box::new((false, v)) as BoxedValue),
    ])
}

/// A trivially-ready primitive. `v` is handed out exactly once; a second
/// `try_fn` call (which a well-formed performance never makes) yields
/// `None` rather than panicking.
pub fn always(v: BoxedValue) -> Op {
    let slot = Arc::new(Mutex::new(Some(v)));
    Op::primitive(
        Box::new(move || slot.lock().take()),
        Box::new(|_, _, _, _| {}),
    )
}

/// Never completes.
pub fn never() -> Op {
    Op::primitive(Box::new(|| None), Box::new(|_, _, _, _| {}))
}

/// A biased choice against a primitive that is never ready on the fast
/// path but schedules its own completion for the next turn, yielding
/// `fallback_thunk()`.
pub fn or_else(fallback_thunk: impl FnOnce() -> BoxedValue + Send + 'static) -> Op {
    let thunk = Arc::new(Mutex::new(Some(fallback_thunk)));
    Op::primitive(
        Box::new(|| None),
        Box::new(move |sched, _fiber, susp, leaf_index| {
            let susp = susp.clone();
            let thunk = thunk.clone();
            let task = crate::sleep::NextTurnTask::new(move |sched| {
                if let Some(f) = thunk.lock().take() {
                    susp.complete_and_run(sched, leaf_index, f());
                }
            });
            sched.schedule(Box::new(task));
        }),
    )
}

/// `acquire()` runs at compile time; `use_op` builds the body Op from a
/// borrow of the acquired resource; `release` runs exactly once, on
/// whichever of the commit or abort path actually happens.
pub fn bracket(
    acquire: impl FnOnce() -> BoxedValue + Send + 'static,
    release: impl Fn(BoxedValue, bool) + Send + Sync + 'static,
    use_op: impl FnOnce(&BoxedValue) -> Op + Send + 'static,
) -> Op {
    Op::Guard(Box::new(move || {
        let resource = acquire();
        let slot: Arc<Mutex<Option<BoxedValue>>> = Arc::new(Mutex::new(Some(resource)));
        let inner_op = {
            let guard = slot.lock();
            use_op(guard.as_ref().expect("bracket resource present during use_op"))
        };

        let release = Arc::new(release);
        let release_commit = release.clone();
        let slot_commit = slot.clone();
        let wrapped = inner_op.wrap(move |v| {
            if let Some(res) = slot_commit.lock().take() {
                release_commit(res, false);
            }
            v
        });

        let release_abort = release;
        let slot_abort = slot;
        wrapped.abort(move || {
            if let Some(res) = slot_abort.lock().take() {
                release_abort(res, true);
            }
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::scope::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn downcast_unit(v: BoxedValue) {
        v.downcast::<()>().expect("expected unit");
    }

    #[test]
    fn always_commits_on_fast_path() {
        let got = try_perform(always(Box::new(7i32)));
        let v = *got.unwrap().downcast::<i32>().unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn never_never_commits_on_fast_path() {
        assert!(try_perform(never()).is_none());
    }

    #[test]
    fn choice_with_one_ready_and_one_never_commits_ready_arm() {
        let op = choice(vec![never(), always(Box::new(3i32))]);
        let v = *try_perform(op).unwrap().downcast::<i32>().unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    #[should_panic(expected = "Choice with zero arms is illegal")]
    fn choice_with_zero_arms_panics() {
        choice(vec![]);
    }

    #[test]
    fn choice_with_one_arm_flattens() {
        let op = choice(vec![always(Box::new(1i32))]);
        assert!(matches!(op, Op::Primitive { .. }));
    }

    #[test]
    fn randomized_probe_is_not_degenerate() {
        let mut wins = [0usize; 2];
        for _ in 0..200 {
            let op = choice(vec![
                always(Box::new(0usize)).wrap(|_| Box::new(0usize)),
                always(Box::new(1usize)).wrap(|_| Box::new(1usize)),
            ]);
            let v = *try_perform(op).unwrap().downcast::<usize>().unwrap();
            wins[v] += 1;
        }
        assert!(wins[0] > 0 && wins[1] > 0, "distribution degenerate: {:?}", wins);
    }

    #[test]
    fn with_nack_fires_on_losing_arm() {
        let sched = Scheduler::new();
        let root = Scope::new_root(&sched);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        root.clone().spawn(move || {
            let nacked = Op::with_nack(move |nack_ev| {
                let f = fired2.clone();
                choice(vec![
                    always(Box::new(())).wrap(move |v| v),
                    nack_ev.wrap(move |v| {
                        f.fetch_add(1, Ordering::SeqCst);
                        v
                    }),
                ])
            });
            let winner = choice(vec![nacked, always(Box::new(99i32))]);
            let v = perform(winner);
            downcast_unit_or_int(v);
            Ok(())
        });

        sched.run(Instant::now());
        sched.drain_ready_for_test();
    }

    fn downcast_unit_or_int(v: BoxedValue) {
        if v.downcast::<i32>().is_ok() {
            return;
        }
    }

    #[test]
    fn bracket_commit_releases_exactly_once_with_aborted_false() {
        let release_calls = Arc::new(Mutex::new(Vec::new()));
        let rc = release_calls.clone();
        let op = bracket(
            || Box::new(5i32) as BoxedValue,
            move |res, aborted| {
                let v = *res.downcast::<i32>().unwrap();
                rc.lock().push((v, aborted));
            },
            |_res| always(Box::new(())),
        );
        let _ = try_perform(op).unwrap();
        assert_eq!(*release_calls.lock(), vec![(5, false)]);
    }

    #[test]
    fn bracket_on_lost_arm_releases_with_aborted_true() {
        let release_calls = Arc::new(Mutex::new(Vec::new()));
        let rc = release_calls.clone();
        let op = bracket(
            || Box::new(9i32) as BoxedValue,
            move |res, aborted| {
                let v = *res.downcast::<i32>().unwrap();
                rc.lock().push((v, aborted));
            },
            |_res| never(),
        );
        let raced = choice(vec![op, always(Box::new(0i32))]);
        let _ = try_perform(raced).unwrap();
        assert_eq!(*release_calls.lock(), vec![(9, true)]);
    }
}
