//! Keyed multimap of waiting tasks with O(1) unlink via stable tokens.
//!
//! Implemented as a hash map from key to a doubly-linked list of nodes
//! living in a single arena (`Vec<Option<Node<T>>>`); each node carries a
//! back-pointer so removal never has to walk the bucket. Tokens carry the
//! arena slot and a generation counter, so an unlink against a slot that
//! has since been reused for an unrelated entry is detected and ignored
//! rather than corrupting that entry.

use std::collections::HashMap;
use std::hash::Hash;

/// A stable handle to an entry added to a [`Waitset`]. Usable from abort
/// paths; `unlink` on a token is safe to call more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    slot: usize,
    generation: u64,
}

struct Node<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u64,
    removed: bool,
}

struct Bucket {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Mapping {key -> ordered list of tasks} with O(1) add/unlink.
pub struct Waitset<K, T> {
    arena: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    buckets: HashMap<K, Bucket>,
    next_generation: u64,
}

impl<K: Eq + Hash + Clone, T> Waitset<K, T> {
    pub fn new() -> Self {
        Waitset {
            arena: Vec::new(),
            free: Vec::new(),
            buckets: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Adds `value` under `key`, returning a stable token for O(1) unlink.
    pub fn add(&mut self, key: K, value: T) -> Token {
        let generation = self.next_generation;
        self.next_generation += 1;

        let bucket = self.buckets.entry(key).or_insert(Bucket {
            head: None,
            tail: None,
            len: 0,
        });
        let prev = bucket.tail;

        let node = Node {
            value: Some(value),
            prev,
            next: None,
            generation,
            removed: false,
        };

        let slot = if let Some(free_slot) = self.free.pop() {
            self.arena[free_slot] = Some(node);
            free_slot
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        };

        if let Some(prev_slot) = prev {
            self.arena[prev_slot].as_mut().unwrap().next = Some(slot);
        } else {
            bucket.head = Some(slot);
        }
        bucket.tail = Some(slot);
        bucket.len += 1;

        Token { slot, generation }
    }

    /// Removes the entry named by `token` in O(1). Returns whether this
    /// call caused the bucket to become empty (never true if the token
    /// was already unlinked or stale).
    pub fn unlink(&mut self, key: &K, token: Token) -> bool {
        let slot = token.slot;
        let matches = matches!(
            self.arena.get(slot),
            Some(Some(node)) if node.generation == token.generation && !node.removed
        );
        if !matches {
            return false;
        }

        let (prev, next) = {
            let node = self.arena[slot].as_mut().unwrap();
            node.removed = true;
            node.value = None;
            (node.prev, node.next)
        };

        if let Some(prev_slot) = prev {
            self.arena[prev_slot].as_mut().unwrap().next = next;
        }
        if let Some(next_slot) = next {
            self.arena[next_slot].as_mut().unwrap().prev = prev;
        }

        self.free.push(slot);

        let mut emptied = false;
        if let Some(bucket) = self.buckets.get_mut(key) {
            if bucket.head == Some(slot) {
                bucket.head = next;
            }
            if bucket.tail == Some(slot) {
                bucket.tail = prev;
            }
            bucket.len -= 1;
            if bucket.len == 0 {
                self.buckets.remove(key);
                emptied = true;
            }
        }
        emptied
    }

    /// Removes and returns the first entry under `key`, in insertion order.
    pub fn take_one(&mut self, key: &K) -> Option<T> {
        let head = self.buckets.get(key)?.head?;
        let value = self.arena[head].as_mut().unwrap().value.take();
        self.unlink(key, Token {
            slot: head,
            generation: self.arena[head].as_ref().unwrap().generation,
        });
        value
    }

    /// Removes and returns every entry under `key`, in insertion order.
    pub fn take_all(&mut self, key: &K) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(v) = self.take_one(key) {
            out.push(v);
        }
        out
    }

    /// Removes the first entry under `key`, if any, and invokes `f` with
    /// it. The named counterpart to `take_one` for callers that want to
    /// wake a single waiter (e.g. a channel handoff) without holding onto
    /// the value themselves.
    pub fn notify_one(&mut self, key: &K, f: impl FnOnce(T)) -> bool {
        match self.take_one(key) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Removes every entry under `key`, in insertion order, invoking `f`
    /// with each. Used by a poller to wake every task parked on a
    /// resource once it becomes ready (`notify_all(fd, ...)`).
    pub fn notify_all(&mut self, key: &K, mut f: impl FnMut(T)) -> usize {
        let values = self.take_all(key);
        let n = values.len();
        for v in values {
            f(v);
        }
        n
    }

    pub fn is_empty_key(&self, key: &K) -> bool {
        !self.buckets.contains_key(key)
    }

    pub fn size(&self, key: &K) -> usize {
        self.buckets.get(key).map(|b| b.len).unwrap_or(0)
    }

    pub fn clear_key(&mut self, key: &K) -> Vec<T> {
        self.take_all(key)
    }

    pub fn clear_all(&mut self) -> Vec<T> {
        let keys: Vec<K> = self.buckets.keys().cloned().collect();
        let mut out = Vec::new();
        for key in keys {
            out.extend(self.take_all(&key));
        }
        out
    }
}

impl<K: Eq + Hash + Clone, T> Default for Waitset<K, T> {
    fn default() -> Self {
        Waitset::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_take_order() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        ws.add("k", 1);
        ws.add("k", 2);
        ws.add("k", 3);
        assert_eq!(ws.take_one(&"k"), Some(1));
        assert_eq!(ws.take_one(&"k"), Some(2));
        assert_eq!(ws.take_one(&"k"), Some(3));
        assert_eq!(ws.take_one(&"k"), None);
    }

    #[test]
    fn unlink_is_o1_and_idempotent() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        let t1 = ws.add("k", 1);
        let t2 = ws.add("k", 2);
        ws.add("k", 3);

        let emptied = ws.unlink(&"k", t2);
        assert!(!emptied);
        assert_eq!(ws.size(&"k"), 2);
        assert_eq!(ws.take_all(&"k"), vec![1, 3]);

        // second unlink of an already-removed token is a no-op
        let emptied_again = ws.unlink(&"k", t1);
        assert!(!emptied_again);
    }

    #[test]
    fn unlink_reports_bucket_emptied() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        let t1 = ws.add("k", 1);
        assert!(ws.unlink(&"k", t1));
        assert!(ws.is_empty_key(&"k"));
    }

    #[test]
    fn stale_token_after_slot_reuse_is_ignored() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        let t1 = ws.add("k", 1);
        ws.unlink(&"k", t1);
        // reuses the freed slot
        ws.add("k", 2);
        // t1's generation no longer matches the slot's occupant
        assert!(!ws.unlink(&"k", t1));
        assert_eq!(ws.size(&"k"), 1);
    }

    #[test]
    fn notify_one_invokes_and_removes_only_the_first_waiter() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        ws.add("k", 1);
        ws.add("k", 2);
        let mut seen = Vec::new();
        assert!(ws.notify_one(&"k", |v| seen.push(v)));
        assert_eq!(seen, vec![1]);
        assert_eq!(ws.size(&"k"), 1);
        assert!(!ws.notify_one(&"missing", |v| seen.push(v)));
    }

    #[test]
    fn notify_all_invokes_every_waiter_and_drains_the_bucket() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        ws.add("k", 1);
        ws.add("k", 2);
        ws.add("k", 3);
        let mut seen = Vec::new();
        let n = ws.notify_all(&"k", |v| seen.push(v));
        assert_eq!(n, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(ws.is_empty_key(&"k"));
    }

    #[test]
    fn clear_all_drains_every_bucket() {
        let mut ws: Waitset<&str, i32> = Waitset::new();
        ws.add("a", 1);
        ws.add("b", 2);
        let mut drained = ws.clear_all();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(ws.is_empty_key(&"a"));
        assert!(ws.is_empty_key(&"b"));
    }
}
