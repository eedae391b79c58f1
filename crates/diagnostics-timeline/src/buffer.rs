//! Bounded Ring Buffer
//!
//! Fixed-capacity ring that overwrites its oldest entry when full. The
//! session keeps its timeline (64 events) and state-change history (32)
//! in one of these.

use crate::event::TimelineEvent;

/// Default timeline capacity
pub const DEFAULT_CAPACITY: usize = 64;

/// Fixed-capacity ring, oldest entry evicted first
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// Pre-allocated slots
    storage: Vec<Option<T>>,
    /// Next write position
    head: usize,
    /// Occupied slots
    len: usize,
    /// Entries ever pushed (for statistics)
    total_written: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a ring holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            storage: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Push an entry, returning the evicted one when full
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.capacity();
        let evicted = self.storage[self.head].replace(item);
        self.head = (self.head + 1) % capacity;
        self.total_written += 1;
        if self.len < capacity {
            self.len += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.len as f64 / self.capacity() as f64
    }

    pub fn total_written(&self) -> usize {
        self.total_written
    }

    /// Entries oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        let capacity = self.capacity();
        let start = (self.head + capacity - self.len) % capacity;
        (0..self.len).filter_map(move |i| self.storage[(start + i) % capacity].as_ref())
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&T> {
        self.iter().next_back()
    }

    /// Read the last N entries (most recent first)
    pub fn read_last(&self, count: usize) -> Vec<T> {
        self.iter().rev().take(count).cloned().collect()
    }

    /// Snapshot oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.storage.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }
}

impl RingBuffer<TimelineEvent> {
    /// Events newer than `anchor`, oldest first, at most `limit` (capped at
    /// the ring capacity). A zero `limit` yields nothing.
    ///
    /// An absent anchor yields the last `limit` events. So does an anchor
    /// that is no longer in the ring, either evicted or never recorded; the
    /// caller cannot tell this apart from a fresh read.
    pub fn events_after(&self, anchor: Option<&str>, limit: usize) -> Vec<TimelineEvent> {
        if limit == 0 {
            return Vec::new();
        }
        let limit = limit.min(self.capacity());
        let events = self.to_vec();
        let start = anchor
            .and_then(|id| events.iter().position(|event| event.id == id))
            .map(|index| index + 1)
            .unwrap_or(0);
        let newer = &events[start..];
        newer[newer.len().saturating_sub(limit)..].to_vec()
    }
}
