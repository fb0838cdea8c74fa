//! Retrieval prioritization.
//!
//! The heap keeps each key's position so a queued retrieval can be found
//! and re-ordered in place when a later caller asks for it more urgently.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Priority of a retrieval. Larger values are serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Priority used for blocks a caller is actively waiting on.
    pub const ON_DEMAND: Self = Self(100);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::ON_DEMAND
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct HeapSlot<K> {
    key: K,
    priority: Priority,
    order: u64,
}

impl<K> HeapSlot<K> {
    /// Higher priority first, then lower insertion order.
    fn outranks(&self, other: &Self) -> bool {
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => self.order < other.order,
            ord => ord.is_gt(),
        }
    }
}

/// Indexed binary max-heap keyed by `K`.
///
/// Not synchronized; the owner serializes access.
#[derive(Debug)]
pub struct RetrievalHeap<K> {
    slots: Vec<HeapSlot<K>>,
    positions: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> RetrievalHeap<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Insert `key`. Returns false, leaving the heap unchanged, if `key` is
    /// already present.
    pub fn push(&mut self, key: K, priority: Priority, order: u64) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        let idx = self.slots.len();
        self.slots.push(HeapSlot { key, priority, order });
        self.positions.insert(key, idx);
        self.sift_up(idx);
        true
    }

    /// Remove and return the highest ranked key.
    pub fn pop(&mut self) -> Option<K> {
        if self.slots.is_empty() {
            return None;
        }
        let last = self.slots.len() - 1;
        self.swap(0, last);
        let slot = self.slots.pop()?;
        self.positions.remove(&slot.key);
        if !self.slots.is_empty() {
            self.sift_down(0);
        }
        Some(slot.key)
    }

    /// Change the priority of a queued key and restore heap order.
    /// Returns false if `key` is not in the heap.
    pub fn set_priority(&mut self, key: K, priority: Priority) -> bool {
        let Some(&idx) = self.positions.get(&key) else {
            return false;
        };
        let old = self.slots[idx].priority;
        self.slots[idx].priority = priority;
        if priority > old {
            self.sift_up(idx);
        } else if priority < old {
            self.sift_down(idx);
        }
        true
    }

    /// Current index of `key`, or `None` when it is not queued.
    pub fn position(&self, key: &K) -> Option<usize> {
        self.positions.get(key).copied()
    }

    pub fn priority(&self, key: &K) -> Option<Priority> {
        self.position(key).map(|idx| self.slots[idx].priority)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn peek(&self) -> Option<&K> {
        self.slots.first().map(|s| &s.key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.slots[idx].outranks(&self.slots[parent]) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;
            if left < len && self.slots[left].outranks(&self.slots[best]) {
                best = left;
            }
            if right < len && self.slots[right].outranks(&self.slots[best]) {
                best = right;
            }
            if best == idx {
                break;
            }
            self.swap(idx, best);
            idx = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.slots.swap(a, b);
        self.positions.insert(self.slots[a].key, a);
        self.positions.insert(self.slots[b].key, b);
    }
}

impl<K: Copy + Eq + Hash> Default for RetrievalHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}
