//! Orders pending loads by priority.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use thiserror::Error;

use crate::types::Priority;

/// Signals that the [`PriorityScheduler`] has no more loads queued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Error)]
#[error("no loads queued")]
pub struct Empty;

/// A key waiting in the [`PriorityScheduler`].
#[derive(Clone, Debug)]
pub struct QueuedLoad {
    pub key: String,
    pub priority: Priority,
    /// Enqueue order, breaks ties between equal priorities.
    sequence: u64,
}

impl QueuedLoad {
    fn sort_key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }
}

impl PartialEq for QueuedLoad {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueuedLoad {}

impl PartialOrd for QueuedLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A min-priority queue of keys to load.
///
/// The lowest [`Priority`] is dequeued first, equal priorities in the order they were enqueued.
/// The scheduler only orders keys, it does not own or start any loads.
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    heap: BinaryHeap<Reverse<QueuedLoad>>,
    next_sequence: u64,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, key: impl Into<String>, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.heap.push(Reverse(QueuedLoad {
            key: key.into(),
            priority,
            sequence,
        }));
    }

    /// Removes and returns the queued load with the lowest priority.
    pub fn dequeue(&mut self) -> Result<QueuedLoad, Empty> {
        self.heap.pop().map(|Reverse(load)| load).ok_or(Empty)
    }

    /// The load [`dequeue`](Self::dequeue) would return next.
    pub fn peek(&self) -> Option<&QueuedLoad> {
        self.heap.peek().map(|Reverse(load)| load)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
