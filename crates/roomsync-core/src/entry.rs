//! Timeline entries: persisted events, fragment boundaries and pending events.
//!
//! All three share one ordering, expressed by [`EntryOrder`]. Pending entries
//! always sort after persisted ones; persisted entries order by fragment
//! (through a [`FragmentIdComparer`]) and then by event index.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::EngineError,
    event_key::{Direction, EventKey, PENDING_FRAGMENT_ID},
    fragment::{ComparerError, Fragment, FragmentIdComparer},
    types::RawEvent,
};

/// Result of handing an encrypted event to the encryption collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DecryptionOutcome {
    Decrypted { event_type: String, content: Value },
    Failed { code: String, message: String },
}

/// A persisted room event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEntry {
    pub room_id: String,
    pub key: EventKey,
    pub event: RawEvent,
    /// Sender display name at write time.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Sender avatar at write time.
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub decryption: Option<DecryptionOutcome>,
}

impl EventEntry {
    pub fn new(room_id: impl Into<String>, key: EventKey, event: RawEvent) -> Self {
        Self {
            room_id: room_id.into(),
            key,
            event,
            display_name: None,
            avatar_url: None,
            decryption: None,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    pub fn sender(&self) -> &str {
        &self.event.sender
    }

    /// Event type after decryption, when it succeeded.
    pub fn event_type(&self) -> &str {
        match &self.decryption {
            Some(DecryptionOutcome::Decrypted { event_type, .. }) => event_type,
            _ => &self.event.event_type,
        }
    }

    /// Content after decryption, when it succeeded.
    pub fn content(&self) -> &Value {
        match &self.decryption {
            Some(DecryptionOutcome::Decrypted { content, .. }) => content,
            _ => &self.event.content,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.event.event_type == crate::types::event_types::ENCRYPTED
    }

    pub fn decryption_error(&self) -> Option<&str> {
        match &self.decryption {
            Some(DecryptionOutcome::Failed { code, .. }) => Some(code),
            _ => None,
        }
    }
}

/// Start or end edge of a fragment, shown in the timeline to mark gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentBoundaryEntry {
    pub fragment: Fragment,
    pub is_start: bool,
}

impl FragmentBoundaryEntry {
    pub fn start(fragment: Fragment) -> Self {
        Self {
            fragment,
            is_start: true,
        }
    }

    pub fn end(fragment: Fragment) -> Self {
        Self {
            fragment,
            is_start: false,
        }
    }

    pub fn fragment_id(&self) -> u32 {
        self.fragment.id
    }

    pub fn key(&self) -> EventKey {
        if self.is_start {
            EventKey::fragment_start(self.fragment.id)
        } else {
            EventKey::fragment_end(self.fragment.id)
        }
    }

    /// Pagination direction away from this edge.
    pub fn direction(&self) -> Direction {
        if self.is_start {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.fragment.token(self.direction())
    }

    pub fn has_gap(&self) -> bool {
        self.fragment.has_gap(self.direction())
    }

    pub fn edge_reached(&self) -> bool {
        self.fragment.edge_reached(self.direction())
    }

    pub fn linked_fragment_id(&self) -> Option<u32> {
        self.fragment.linked_id(self.direction())
    }

    /// Boundary of `neighbour` facing this one.
    pub fn neighbour_entry(&self, neighbour: Fragment) -> Self {
        Self {
            fragment: neighbour,
            is_start: !self.is_start,
        }
    }
}

/// Progress of a pending event through the send queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendStatus {
    Waiting,
    EncryptingAttachments,
    UploadingAttachments,
    Encrypting,
    Sending,
    Sent,
    Error,
    Aborted,
}

impl SendStatus {
    /// No further transitions happen from these states.
    pub fn is_final(self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::Aborted)
    }
}

/// Durable part of a pending event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEventData {
    pub room_id: String,
    pub queue_index: u64,
    pub event_type: String,
    pub content: Value,
    pub txn_id: String,
    pub needs_encryption: bool,
    pub needs_upload: bool,
    #[serde(default)]
    pub encrypted_type: Option<String>,
    #[serde(default)]
    pub encrypted_content: Option<Value>,
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// A local event that the server has not echoed back yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEventEntry {
    pub data: PendingEventData,
    pub status: SendStatus,
    pub error: Option<EngineError>,
}

impl PendingEventEntry {
    pub fn queue_index(&self) -> u64 {
        self.data.queue_index
    }

    pub fn txn_id(&self) -> &str {
        &self.data.txn_id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.data.remote_id.as_deref()
    }
}

/// Position of an entry in a room's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryOrder {
    Persisted(EventKey),
    Pending(u64),
}

impl EntryOrder {
    pub fn compare(
        &self,
        other: &EntryOrder,
        comparer: &FragmentIdComparer,
    ) -> Result<Ordering, ComparerError> {
        match (self, other) {
            (EntryOrder::Pending(a), EntryOrder::Pending(b)) => Ok(a.cmp(b)),
            (EntryOrder::Pending(_), EntryOrder::Persisted(_)) => Ok(Ordering::Greater),
            (EntryOrder::Persisted(_), EntryOrder::Pending(_)) => Ok(Ordering::Less),
            (EntryOrder::Persisted(a), EntryOrder::Persisted(b)) => {
                match comparer.compare(a.fragment_id, b.fragment_id)? {
                    Ordering::Equal => Ok(a.event_index.cmp(&b.event_index)),
                    other => Ok(other),
                }
            }
        }
    }

    /// Key view; pending entries map into the reserved fragment.
    pub fn as_event_key(&self) -> EventKey {
        match self {
            EntryOrder::Persisted(key) => *key,
            EntryOrder::Pending(queue_index) => EventKey::new(
                PENDING_FRAGMENT_ID,
                u32::try_from(*queue_index).unwrap_or(u32::MAX),
            ),
        }
    }
}

/// Shared ordering interface of every timeline entry kind.
pub trait OrderedEntry {
    fn order(&self) -> EntryOrder;

    fn compare(
        &self,
        other: &dyn OrderedEntry,
        comparer: &FragmentIdComparer,
    ) -> Result<Ordering, ComparerError> {
        self.order().compare(&other.order(), comparer)
    }
}

impl OrderedEntry for EventEntry {
    fn order(&self) -> EntryOrder {
        EntryOrder::Persisted(self.key)
    }
}

impl OrderedEntry for FragmentBoundaryEntry {
    fn order(&self) -> EntryOrder {
        EntryOrder::Persisted(self.key())
    }
}

impl OrderedEntry for PendingEventEntry {
    fn order(&self) -> EntryOrder {
        EntryOrder::Pending(self.data.queue_index)
    }
}

/// Any entry of a room timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TimelineEntry {
    Event(EventEntry),
    Boundary(FragmentBoundaryEntry),
    Pending(PendingEventEntry),
}

impl TimelineEntry {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            TimelineEntry::Event(entry) => Some(entry.event_id()),
            TimelineEntry::Pending(entry) => entry.remote_id(),
            TimelineEntry::Boundary(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventEntry> {
        match self {
            TimelineEntry::Event(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn as_boundary(&self) -> Option<&FragmentBoundaryEntry> {
        match self {
            TimelineEntry::Boundary(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingEventEntry> {
        match self {
            TimelineEntry::Pending(entry) => Some(entry),
            _ => None,
        }
    }

    /// A boundary that can still be backfilled.
    pub fn is_gap(&self) -> bool {
        self.as_boundary().is_some_and(FragmentBoundaryEntry::has_gap)
    }
}

impl OrderedEntry for TimelineEntry {
    fn order(&self) -> EntryOrder {
        match self {
            TimelineEntry::Event(entry) => entry.order(),
            TimelineEntry::Boundary(entry) => entry.order(),
            TimelineEntry::Pending(entry) => entry.order(),
        }
    }
}

impl From<EventEntry> for TimelineEntry {
    fn from(entry: EventEntry) -> Self {
        TimelineEntry::Event(entry)
    }
}

impl From<FragmentBoundaryEntry> for TimelineEntry {
    fn from(entry: FragmentBoundaryEntry) -> Self {
        TimelineEntry::Boundary(entry)
    }
}

impl From<PendingEventEntry> for TimelineEntry {
    fn from(entry: PendingEventEntry) -> Self {
        TimelineEntry::Pending(entry)
    }
}
