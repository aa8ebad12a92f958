//! Bounded buffer of frames awaiting acknowledgment.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::wire::Frame;

/// One unacknowledged frame with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    /// Frame id, `"<unix-seconds>:<sequence>"`.
    pub id: String,
    /// The buffered frame, resent verbatim on retry.
    pub frame: Frame,
    /// Time of the most recent transmission attempt.
    pub last_attempt: Instant,
    /// Number of retransmissions so far.
    pub retries: u32,
}

/// Bounded map of unacknowledged frames.
///
/// Insertion order is tracked explicitly so that eviction under capacity
/// pressure always removes the oldest-inserted entry. The buffer is owned
/// by one [`ReliableChannel`](super::ReliableChannel): its send path
/// inserts, its single retransmit task sweeps. `due_for_retry` returns
/// each overdue entry exactly once per call; concurrent sweeps of the same
/// buffer are not supported.
#[derive(Debug)]
pub struct PendingBuffer {
    capacity: usize,
    ack_timeout: Duration,
    entries: HashMap<String, BufferEntry>,
    /// Insertion order; ids of acknowledged entries are dropped lazily,
    /// either skipped during eviction or swept by compaction.
    order: VecDeque<String>,
}

impl PendingBuffer {
    /// Create a buffer with the given capacity and ack timeout.
    pub fn new(capacity: usize, ack_timeout: Duration) -> Self {
        Self {
            capacity,
            ack_timeout,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert a frame, evicting the oldest-inserted entry first when at
    /// capacity.
    pub fn add(&mut self, id: impl Into<String>, frame: Frame) {
        let id = id.into();
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            id.clone(),
            BufferEntry {
                id: id.clone(),
                frame,
                last_attempt: Instant::now(),
                retries: 0,
            },
        );
        self.order.push_back(id);
    }

    fn evict_oldest(&mut self) {
        while let Some(oldest) = self.order.pop_front() {
            if self.entries.remove(&oldest).is_some() {
                log::warn!("pending buffer full, evicting oldest entry {oldest}");
                return;
            }
            // Stale id of an already-acknowledged entry; keep scanning.
        }
    }

    /// Remove an acknowledged entry. No-op when the id is absent.
    pub fn acknowledge(&mut self, id: &str) {
        self.entries.remove(id);
        self.compact();
    }

    /// Drop stale ids once they reach twice the capacity, keeping the
    /// order queue proportional to the live entry count. Amortized O(1)
    /// per acknowledgment.
    fn compact(&mut self) {
        if self.order.len() >= self.capacity.saturating_mul(2).max(8) {
            self.order.retain(|id| self.entries.contains_key(id));
        }
    }

    /// Collect entries overdue at `now`, resetting their attempt time and
    /// incrementing their retry count.
    ///
    /// Each due entry is returned exactly once per call.
    pub fn due_for_retry(&mut self, now: Instant) -> Vec<BufferEntry> {
        let mut due = Vec::new();
        for entry in self.entries.values_mut() {
            if now.saturating_duration_since(entry.last_attempt) > self.ack_timeout {
                entry.last_attempt = now;
                entry.retries += 1;
                due.push(entry.clone());
            }
        }
        due
    }

    /// Whether an entry with this id is still buffered.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of unacknowledged entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything. Used on shutdown; no drain guarantee is given.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
