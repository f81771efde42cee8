//! Bounded local delivery queue.
//!
//! FIFO with drop-oldest backpressure: pushing onto a full queue evicts the
//! head first, so the length never exceeds the capacity.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tabsync_types::{ContextId, ItemId, UserId};

/// A local write awaiting delivery to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem<T> {
    pub id: ItemId,
    pub key: String,
    pub value: T,
    pub timestamp: u64,
    /// Local version this write was made at.
    pub version: u64,
    /// Failed delivery attempts so far.
    pub retries: u32,
    pub origin_id: ContextId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Earliest time (ms) the item may be attempted again, when backoff is on.
    #[serde(default)]
    pub not_before: Option<u64>,
}

impl<T> SyncQueueItem<T> {
    /// Creates a fresh item with no retries.
    pub fn new(
        key: impl Into<String>,
        value: T,
        timestamp: u64,
        version: u64,
        origin_id: ContextId,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            id: ItemId::new(),
            key: key.into(),
            value,
            timestamp,
            version,
            retries: 0,
            origin_id,
            user_id,
            not_before: None,
        }
    }

    /// Returns true if the item may be attempted at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        self.not_before.is_none_or(|t| now >= t)
    }
}

/// Bounded FIFO of pending writes.
#[derive(Debug, Clone)]
pub struct SyncQueue<T> {
    items: VecDeque<SyncQueueItem<T>>,
    capacity: usize,
}

impl<T> SyncQueue<T> {
    /// Creates an empty queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends an item, evicting the oldest if full. Returns the evicted item.
    pub fn push(&mut self, item: SyncQueueItem<T>) -> Option<SyncQueueItem<T>> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Removes the head item.
    pub fn pop(&mut self) -> Option<SyncQueueItem<T>> {
        self.items.pop_front()
    }

    /// Returns the head item.
    pub fn peek(&self) -> Option<&SyncQueueItem<T>> {
        self.items.front()
    }

    /// Keeps only items matching `f`. Returns how many were removed.
    pub fn retain(&mut self, f: impl FnMut(&SyncQueueItem<T>) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(f);
        before - self.items.len()
    }

    /// Removes and returns every item.
    pub fn drain_all(&mut self) -> Vec<SyncQueueItem<T>> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueItem<T>> {
        self.items.iter()
    }
}
