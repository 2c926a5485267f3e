//! Recency queue used by the instance cache.
//!
//! Keys are ordered by a monotonically assigned sequence number. Appending takes a
//! number above the current tail and re-queuing at the head takes one below the
//! current head, so both ends are O(log n) while removal by key stays O(log n)
//! through the position map.
//!
//! ```text
//!   head (oldest)                                   tail (newest)
//!     │                                                   │
//!     ▼                                                   ▼
//!   [-2:k7] [-1:k3] [1:k1] [2:k4] [3:k9] ... [n:kx]
//!     ▲                                         ▲
//!   push_front                               push_back
//! ```

use crate::HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

/// Ordered set of keys, oldest first.
pub(crate) struct LruQueue<K> {
    order: BTreeMap<i64, K>,
    positions: HashMap<K, i64>,
    head: i64,
    tail: i64,
}

impl<K: Hash + Eq + Clone> LruQueue<K> {
    pub(crate) fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            positions: HashMap::new(),
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[inline]
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Appends `key` as the newest element, moving it if already queued.
    pub(crate) fn push_back(&mut self, key: K) {
        self.remove(&key);
        self.tail += 1;
        self.order.insert(self.tail, key.clone());
        self.positions.insert(key, self.tail);
    }

    /// Inserts `key` as the oldest element, moving it if already queued.
    pub(crate) fn push_front(&mut self, key: K) {
        self.remove(&key);
        self.head -= 1;
        self.order.insert(self.head, key.clone());
        self.positions.insert(key, self.head);
    }

    /// Removes `key`; returns whether it was queued.
    pub(crate) fn remove(&mut self, key: &K) -> bool {
        match self.positions.remove(key) {
            Some(position) => {
                self.order.remove(&position);
                true
            }
            None => false,
        }
    }

    /// Oldest key.
    pub(crate) fn front(&self) -> Option<&K> {
        self.order.values().next()
    }

    /// Removes and returns the oldest key.
    pub(crate) fn pop_front(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.positions.remove(&key);
        Some(key)
    }
}

impl<K: fmt::Debug> fmt::Debug for LruQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.values()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut LruQueue<&'static str>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Some(key) = queue.pop_front() {
            out.push(key);
        }
        out
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = LruQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_back("c");
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front(), Some(&"a"));
        assert_eq!(drain(&mut queue), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_back_moves_existing_key() {
        let mut queue = LruQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_back("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(drain(&mut queue), vec!["b", "a"]);
    }

    #[test]
    fn test_push_front_requeues_as_oldest() {
        let mut queue = LruQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_front("c");
        queue.push_front("b");
        assert_eq!(drain(&mut queue), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_remove() {
        let mut queue = LruQueue::new();
        queue.push_back("a");
        queue.push_back("b");
        assert!(queue.remove(&"a"));
        assert!(!queue.remove(&"a"));
        assert!(!queue.contains(&"a"));
        assert!(queue.contains(&"b"));
        assert_eq!(drain(&mut queue), vec!["b"]);
    }
}
