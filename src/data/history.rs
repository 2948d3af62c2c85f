//! Bounded reading history.
//!
//! Keeps the most recent telemetry records, newest first.

use std::collections::VecDeque;

use super::reading::TelemetryRecord;

/// Default number of records kept.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Newest-first buffer of recent telemetry records.
///
/// Once full, inserting a record evicts the oldest one.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingHistory {
    records: VecDeque<TelemetryRecord>,
    capacity: usize,
}

impl Default for ReadingHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ReadingHistory {
    /// Create an empty history with the default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty history holding at most `capacity` records.
    ///
    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a record at the front, evicting the oldest when full.
    ///
    /// Returns the evicted record, if any.
    pub fn push(&mut self, record: TelemetryRecord) -> Option<TelemetryRecord> {
        self.records.push_front(record);
        if self.records.len() > self.capacity {
            self.records.pop_back()
        } else {
            None
        }
    }

    /// The most recent record.
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.records.front()
    }

    /// Iterate newest first.
    pub fn iter(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.iter()
    }

    /// Copy the history into a vector, newest first.
    pub fn to_vec(&self) -> Vec<TelemetryRecord> {
        self.records.iter().cloned().collect()
    }

    /// Remove every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the history is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of records held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
