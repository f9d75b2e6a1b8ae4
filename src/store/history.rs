//! Per-machine metric history
//!
//! Each machine gets a bounded ring buffer. Entries are kept in the order
//! their registry updates were applied (by revision), not by the agent's
//! own timestamp. Once the buffer is full, the oldest entry is evicted.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::machine::MetricSnapshot;

/// One retained snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Revision of the registry update that produced this entry
    pub revision: u64,

    /// When the store accepted the snapshot
    pub recorded_at: DateTime<Utc>,

    pub snapshot: Arc<MetricSnapshot>,
}

/// Ring buffer of history entries with a fixed capacity
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Insert an entry in revision order, evicting the oldest once over capacity
    ///
    /// Writers release the registry lock before taking the history lock, so
    /// two updates of one machine may reach the buffer swapped. The late
    /// arrival is slotted back into place instead of being appended.
    pub fn push(&mut self, entry: HistoryEntry) {
        let position = self
            .entries
            .iter()
            .rposition(|existing| existing.revision < entry.revision)
            .map_or(0, |index| index + 1);
        self.entries.insert(position, entry);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `limit` most recent entries, oldest first
    pub fn latest(&self, limit: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries recorded within `[start, end]`, oldest first
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.recorded_at >= start && entry.recorded_at <= end)
            .cloned()
            .collect()
    }

    /// Drop entries recorded before `before`; returns how many were dropped
    pub fn remove_before(&mut self, before: DateTime<Utc>) -> usize {
        let len = self.entries.len();
        self.entries.retain(|entry| entry.recorded_at >= before);
        len - self.entries.len()
    }
}
