use std::cmp::Ordering;

use thiserror::Error;

use crate::{
    entry::{EntryOrder, OrderedEntry, PendingEventEntry, TimelineEntry},
    fragment::{ComparerError, FragmentIdComparer},
    types::TimelineDiff,
};

/// Errors that can occur while merging entries into a timeline buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// The entry cannot be placed relative to the entries already present.
    #[error("timeline entry cannot be ordered: {0}")]
    Unordered(#[from] ComparerError),
    /// A pending entry was offered as a persisted one or the reverse.
    #[error("entry kind does not belong in the {0} section")]
    WrongSection(&'static str),
}

/// Sorted in-memory view over one room's timeline.
///
/// Persisted entries (events and fragment boundaries) come first, ordered
/// through a [`FragmentIdComparer`]; pending entries follow by queue index.
/// Every mutation returns the [`TimelineDiff`] describing it, with indices into
/// that concatenated view.
#[derive(Debug, Clone, Default)]
pub struct TimelineBuffer {
    remote: Vec<TimelineEntry>,
    pending: Vec<PendingEventEntry>,
}

impl TimelineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.remote.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<TimelineEntry> {
        if index < self.remote.len() {
            return self.remote.get(index).cloned();
        }
        self.pending
            .get(index - self.remote.len())
            .cloned()
            .map(TimelineEntry::Pending)
    }

    /// Oldest persisted entry, the anchor for loading further history.
    pub fn first_remote(&self) -> Option<&TimelineEntry> {
        self.remote.first()
    }

    pub fn pending(&self) -> &[PendingEventEntry] {
        &self.pending
    }

    /// Snapshot of the concatenated view.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.remote
            .iter()
            .cloned()
            .chain(self.pending.iter().cloned().map(TimelineEntry::Pending))
            .collect()
    }

    /// Replace everything and report it as a reset.
    pub fn reset(
        &mut self,
        remote: Vec<TimelineEntry>,
        pending: Vec<PendingEventEntry>,
        comparer: &FragmentIdComparer,
    ) -> Result<TimelineDiff, TimelineMergeError> {
        let mut sorted_remote: Vec<TimelineEntry> = Vec::with_capacity(remote.len());
        for entry in remote {
            if matches!(entry, TimelineEntry::Pending(_)) {
                return Err(TimelineMergeError::WrongSection("persisted"));
            }
            match search(&sorted_remote, &entry.order(), comparer)? {
                Ok(index) => sorted_remote[index] = entry,
                Err(index) => sorted_remote.insert(index, entry),
            }
        }

        let mut pending = pending;
        pending.sort_by_key(PendingEventEntry::queue_index);
        pending.dedup_by_key(|entry| entry.queue_index());

        self.remote = sorted_remote;
        self.pending = pending;
        Ok(TimelineDiff::Reset {
            entries: self.entries(),
        })
    }

    /// Insert a persisted entry, or update the one with the same key.
    pub fn upsert_remote(
        &mut self,
        entry: TimelineEntry,
        comparer: &FragmentIdComparer,
    ) -> Result<TimelineDiff, TimelineMergeError> {
        if matches!(entry, TimelineEntry::Pending(_)) {
            return Err(TimelineMergeError::WrongSection("persisted"));
        }
        match search(&self.remote, &entry.order(), comparer)? {
            Ok(index) => {
                self.remote[index] = entry.clone();
                Ok(TimelineDiff::Update { index, entry })
            }
            Err(index) => {
                self.remote.insert(index, entry.clone());
                Ok(TimelineDiff::Insert { index, entry })
            }
        }
    }

    /// Update a persisted entry in place if it is present.
    ///
    /// Unlike [`upsert_remote`](Self::upsert_remote) this never grows the
    /// window; used for boundary refreshes of fragments that may not be loaded.
    pub fn update_remote_if_present(&mut self, entry: TimelineEntry) -> Option<TimelineDiff> {
        let order = entry.order();
        let index = self
            .remote
            .iter()
            .position(|existing| existing.order() == order)?;
        self.remote[index] = entry.clone();
        Some(TimelineDiff::Update { index, entry })
    }

    /// Insert or update a pending entry.
    pub fn upsert_pending(&mut self, entry: PendingEventEntry) -> TimelineDiff {
        let offset = self.remote.len();
        match self
            .pending
            .binary_search_by_key(&entry.queue_index(), PendingEventEntry::queue_index)
        {
            Ok(pos) => {
                self.pending[pos] = entry.clone();
                TimelineDiff::Update {
                    index: offset + pos,
                    entry: TimelineEntry::Pending(entry),
                }
            }
            Err(pos) => {
                self.pending.insert(pos, entry.clone());
                TimelineDiff::Insert {
                    index: offset + pos,
                    entry: TimelineEntry::Pending(entry),
                }
            }
        }
    }

    pub fn remove_pending(&mut self, queue_index: u64) -> Option<TimelineDiff> {
        let pos = self
            .pending
            .binary_search_by_key(&queue_index, PendingEventEntry::queue_index)
            .ok()?;
        self.pending.remove(pos);
        Some(TimelineDiff::Remove {
            index: self.remote.len() + pos,
        })
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }
}

/// Binary search over sorted persisted entries with a fallible comparison.
fn search(
    entries: &[TimelineEntry],
    order: &EntryOrder,
    comparer: &FragmentIdComparer,
) -> Result<Result<usize, usize>, ComparerError> {
    let mut low = 0;
    let mut high = entries.len();
    while low < high {
        let mid = low + (high - low) / 2;
        match entries[mid].order().compare(order, comparer)? {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(low))
}
