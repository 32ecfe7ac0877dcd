// src/engine/queue.rs

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::data::DataId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    id: DataId,
    resource_class: String,
}

/// Data objects in `Waiting`, in dispatch order.
///
/// Higher priority goes first; within a priority, first in first out. There
/// is no preemption: an entry leaves the queue only when dispatched or
/// removed.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    /// Keyed by `(Reverse(priority), sequence)` so iteration order is
    /// dispatch order.
    entries: BTreeMap<(Reverse<i32>, u64), QueueEntry>,
    next_seq: u64,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: DataId, priority: i32, resource_class: impl Into<String>) {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(
            key,
            QueueEntry {
                id,
                resource_class: resource_class.into(),
            },
        );
    }

    /// Drop `id` from the queue. Returns whether it was queued.
    pub fn remove(&mut self, id: DataId) -> bool {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(k, _)| *k);
        match key {
            Some(k) => self.entries.remove(&k).is_some(),
            None => false,
        }
    }

    /// Take the first entry whose resource class `can_run` accepts.
    ///
    /// Entries blocked on their class are skipped, not reordered, so they
    /// keep their place for later.
    pub fn pop_next<F>(&mut self, mut can_run: F) -> Option<(DataId, String)>
    where
        F: FnMut(&str) -> bool,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| can_run(&e.resource_class))
            .map(|(k, _)| *k)?;
        self.entries.remove(&key).map(|e| (e.id, e.resource_class))
    }

    pub fn contains(&self, id: DataId) -> bool {
        self.entries.values().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
