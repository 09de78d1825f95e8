use crate::types::{DltId, MessageTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Location of one record in the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Offset of the storage header
    pub offset: u64,
    /// Record length including the storage header
    pub length: u32,
    pub time: MessageTime,
}

impl IndexEntry {
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}

/// Absolute message numbers that passed a filter set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilteredIndex {
    /// Arrival order, strictly increasing
    entries: Vec<u64>,
    /// Time ordered view, when sorting is enabled
    sorted: Option<Vec<u64>>,
    markers: BTreeMap<u64, String>,
}

impl FilteredIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: u64, marker: Option<String>) {
        self.entries.push(message);
        if let Some(color) = marker {
            self.markers.insert(message, color);
        }
    }

    /// Record a marker for a message that was not included
    pub fn mark(&mut self, message: u64, color: String) {
        self.markers.insert(message, color);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages in arrival order, regardless of sorting
    pub fn arrival_order(&self) -> &[u64] {
        &self.entries
    }

    /// Messages in display order
    pub fn order(&self) -> &[u64] {
        self.sorted.as_deref().unwrap_or(&self.entries)
    }

    pub fn is_sorted_by_time(&self) -> bool {
        self.sorted.is_some()
    }

    /// Absolute message number shown at `row`
    pub fn get(&self, row: usize) -> Option<u64> {
        self.order().get(row).copied()
    }

    pub fn marker(&self, message: u64) -> Option<&str> {
        self.markers.get(&message).map(String::as_str)
    }

    /// Stable sort by storage time; ties keep arrival order
    pub fn sort_by_time(&mut self, entries: &[IndexEntry]) {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|msg| entries.get(*msg as usize).map(|e| e.time).unwrap_or_default());
        self.sorted = Some(sorted);
    }

    pub fn clear_sort(&mut self) {
        self.sorted = None;
    }
}

/// Everything one indexing run publishes
#[derive(Debug, Clone, Default)]
pub struct IndexState {
    pub entries: Arc<Vec<IndexEntry>>,
    /// Result of the active filter set (or all messages when filtering is off)
    pub filtered: FilteredIndex,
    /// Results of the named default filter sets
    pub default_filters: HashMap<String, FilteredIndex>,
    /// Message numbers of GetLogInfo responses
    pub log_info_messages: Vec<u64>,
    /// Versions reported through GetSoftwareVersion responses
    pub versions: Vec<(DltId, String)>,
}

impl IndexState {
    pub fn message_count(&self) -> usize {
        self.entries.len()
    }

    /// File offset right after the last indexed record
    pub fn indexed_end(&self) -> u64 {
        self.entries.last().map(IndexEntry::end).unwrap_or(0)
    }

    pub fn entry(&self, message: u64) -> Option<&IndexEntry> {
        self.entries.get(message as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64, seconds: u32) -> IndexEntry {
        IndexEntry { offset, length: 10, time: MessageTime::new(seconds, 0) }
    }

    #[test]
    fn test_sort_is_stable_and_reversible() {
        let entries = vec![entry(0, 5), entry(10, 3), entry(20, 5), entry(30, 1)];
        let mut filtered = FilteredIndex::new();
        for msg in 0..4 {
            filtered.push(msg, None);
        }

        filtered.sort_by_time(&entries);
        assert_eq!(filtered.order(), &[3, 1, 0, 2]);
        assert_eq!(filtered.arrival_order(), &[0, 1, 2, 3]);

        filtered.clear_sort();
        assert_eq!(filtered.order(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_indexed_end() {
        let state = IndexState {
            entries: Arc::new(vec![entry(0, 1), entry(10, 2)]),
            ..Default::default()
        };
        assert_eq!(state.indexed_end(), 20);
        assert_eq!(IndexState::default().indexed_end(), 0);
    }
}
