use std::sync::{Arc, Mutex};

use roomsync_core::{
    Direction, EngineError, ErrorCategory, FragmentIdComparer, OrderedEntry, PendingEventEntry,
    TimelineBuffer, TimelineDiff, TimelineEntry,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Room,
    send_queue::PendingObserver,
    sync_writer::TimelineWriteResult,
    timeline_reader::{self, READ_STORES},
};
use crate::{lock, storage::read_txn};

const DIFF_BUFFER: usize = 256;

struct TimelineState {
    buffer: TimelineBuffer,
    comparer: FragmentIdComparer,
}

/// Observable, ordered view of one room: persisted entries followed by the
/// room's pending events.
///
/// Obtained from [`Room::open_timeline`]. Every change is published as a
/// [`TimelineDiff`] on [`subscribe`](Self::subscribe).
pub struct Timeline {
    room: Arc<Room>,
    state: Mutex<TimelineState>,
    diffs: broadcast::Sender<TimelineDiff>,
    closed: CancellationToken,
    /// Serializes `load_at_top` calls.
    paginating: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("room_id", &self.room.room_id())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Timeline {
    pub(crate) fn new(
        room: Arc<Room>,
        remote: Vec<TimelineEntry>,
        comparer: FragmentIdComparer,
    ) -> Result<Self, EngineError> {
        let mut buffer = TimelineBuffer::new();
        buffer
            .reset(remote, Vec::new(), &comparer)
            .map_err(|err| EngineError::consistency("timeline_unordered", err.to_string()))?;
        let (diffs, _) = broadcast::channel(DIFF_BUFFER);
        Ok(Self {
            room,
            state: Mutex::new(TimelineState { buffer, comparer }),
            diffs,
            closed: CancellationToken::new(),
            paginating: tokio::sync::Mutex::new(()),
        })
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineDiff> {
        self.diffs.subscribe()
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        lock(&self.state).buffer.entries()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Load older history above the first loaded entry.
    ///
    /// Fills the gap when the top is a gap boundary, otherwise reads stored
    /// history. Returns `true` once the top of the timeline is the start of
    /// the room.
    pub async fn load_at_top(&self, amount: u16) -> Result<bool, EngineError> {
        let _paginating = self.paginating.lock().await;
        if self.is_closed() {
            return Err(timeline_closed(self.room.room_id()));
        }

        let top = lock(&self.state).buffer.first_remote().cloned();
        let Some(top) = top else {
            return Ok(false);
        };
        match &top {
            TimelineEntry::Boundary(boundary) if boundary.is_start && boundary.has_gap() => {
                let result = self.room.fill_gap(boundary, amount, &self.closed).await?;
                self.apply_write(&result);
            }
            TimelineEntry::Boundary(boundary) if boundary.is_start && boundary.edge_reached() => {
                return Ok(true);
            }
            _ => {
                let room_id = self.room.room_id();
                let from = top.order().as_event_key();
                let amount = usize::from(amount.max(1));
                let entries = read_txn(
                    self.room.storage(),
                    &READ_STORES,
                    "load_at_top",
                    |txn| timeline_reader::read_from(txn, room_id, from, Direction::Backward, amount),
                )
                .await?;
                debug!(room_id, from = %from, loaded = entries.len(), "loaded stored history");
                self.insert_entries(entries);
            }
        }
        Ok(self.at_room_start())
    }

    /// Stop observing the room and cancel an outstanding gap fill.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.room.detach_timeline(self).await;
        debug!(room_id = self.room.room_id(), "timeline closed");
    }

    /// Merge a committed write.
    pub(crate) fn apply_write(&self, result: &TimelineWriteResult) {
        let mut state = lock(&self.state);
        let TimelineState { buffer, comparer } = &mut *state;
        if let Err(err) = comparer.add_all(&result.fragments) {
            warn!(room_id = self.room.room_id(), error = %err, "fragment links rejected by timeline");
            return;
        }
        for entry in &result.entries {
            match buffer.upsert_remote(entry.clone(), comparer) {
                Ok(diff) => self.publish(diff),
                Err(err) => warn!(
                    room_id = self.room.room_id(),
                    error = %err,
                    "dropping entry that cannot be ordered"
                ),
            }
        }
        for entry in &result.updated {
            if let Some(diff) = buffer.update_remote_if_present(entry.clone()) {
                self.publish(diff);
            }
        }
    }

    fn insert_entries(&self, entries: Vec<TimelineEntry>) {
        let mut state = lock(&self.state);
        let TimelineState { buffer, comparer } = &mut *state;
        for entry in entries {
            match buffer.upsert_remote(entry, comparer) {
                Ok(diff) => self.publish(diff),
                Err(err) => warn!(
                    room_id = self.room.room_id(),
                    error = %err,
                    "dropping entry that cannot be ordered"
                ),
            }
        }
    }

    fn at_room_start(&self) -> bool {
        matches!(
            lock(&self.state).buffer.first_remote(),
            Some(TimelineEntry::Boundary(boundary)) if boundary.is_start && boundary.edge_reached()
        )
    }

    fn publish(&self, diff: TimelineDiff) {
        let _ = self.diffs.send(diff);
    }
}

impl PendingObserver for Timeline {
    fn pending_attached(&self, entries: Vec<PendingEventEntry>) {
        let mut state = lock(&self.state);
        for entry in entries {
            let diff = state.buffer.upsert_pending(entry);
            self.publish(diff);
        }
    }

    fn pending_updated(&self, entry: PendingEventEntry) {
        let diff = lock(&self.state).buffer.upsert_pending(entry);
        self.publish(diff);
    }

    fn pending_removed(&self, queue_index: u64) {
        if let Some(diff) = lock(&self.state).buffer.remove_pending(queue_index) {
            self.publish(diff);
        }
    }
}

pub(crate) fn timeline_closed(room_id: &str) -> EngineError {
    EngineError::new(
        ErrorCategory::Config,
        "timeline_closed",
        format!("timeline of {room_id} was closed"),
    )
}
