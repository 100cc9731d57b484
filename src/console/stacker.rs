//! Bounded console log with independent reader cursors.
//!
//! The stacker keeps the most recent `capacity` lines in a ring. Each joined
//! reader registers a tracker that counts lines it has not seen yet. Readers
//! that fall more than `capacity` lines behind lose the overwritten lines;
//! memory stays bounded regardless of how slow a reader is.

use std::collections::HashMap;

/// Stable identifier of a reader registered with a [`LogStacker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerId(u64);

/// Fixed-capacity ring of log lines with per-reader unseen counters.
#[derive(Debug)]
pub struct LogStacker {
    slots: Vec<String>,
    capacity: usize,
    /// Lines ever written; the next write goes to `written % capacity`
    written: u64,
    trackers: HashMap<TrackerId, u64>,
    next_tracker: u64,
}

impl LogStacker {
    /// Create a stacker holding at most `capacity` lines (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            written: 0,
            trackers: HashMap::new(),
            next_tracker: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total lines written since creation, including overwritten ones.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Number of lines currently retained.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a line, overwriting the oldest one once full.
    pub fn add(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.slots.len() < self.capacity {
            self.slots.push(line);
        } else {
            let slot = (self.written % self.capacity as u64) as usize;
            self.slots[slot] = line;
        }
        self.written += 1;

        for unseen in self.trackers.values_mut() {
            *unseen += 1;
        }
    }

    /// The last `min(n, total_written, capacity)` lines, oldest first.
    pub fn get(&self, n: usize) -> Vec<String> {
        let count = n.min(self.slots.len());
        let cap = self.capacity as u64;
        (self.written - count as u64..self.written)
            .map(|seq| self.slots[(seq % cap) as usize].clone())
            .collect()
    }

    /// Register a new reader positioned at the current write head.
    pub fn add_tracker(&mut self) -> TrackerId {
        let id = TrackerId(self.next_tracker);
        self.next_tracker += 1;
        self.trackers.insert(id, 0);
        id
    }

    /// Unregister a reader. Returns whether it was registered.
    pub fn remove_tracker(&mut self, id: TrackerId) -> bool {
        self.trackers.remove(&id).is_some()
    }

    /// Lines the reader has not consumed yet, or `None` if it is unknown.
    pub fn unseen(&self, id: TrackerId) -> Option<u64> {
        self.trackers.get(&id).copied()
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    /// Return every line the reader has not seen (bounded by capacity),
    /// oldest first, and mark them as seen.
    ///
    /// An unknown tracker reads nothing.
    pub fn read_all_changes(&mut self, id: TrackerId) -> Vec<String> {
        let Some(unseen) = self.trackers.get_mut(&id) else {
            return Vec::new();
        };
        let pending = std::mem::take(unseen);
        let n = usize::try_from(pending).unwrap_or(usize::MAX);
        self.get(n)
    }
}
