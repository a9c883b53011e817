//! Core data model of the room replication engine.
//!
//! This crate holds the pure parts: event keys, fragments and their ordering,
//! timeline entries and the sorted buffer, protocol types, the stable error
//! type, retry policy and the sync phase state machine. Nothing here does I/O.

/// Session-level notification channel.
pub mod channel;
/// Timeline entry sum type and shared ordering.
pub mod entry;
/// Stable engine error types and HTTP classification helpers.
pub mod error;
/// Event keys, index sentinels and pagination direction.
pub mod event_key;
/// Fragments and the fragment id comparer.
pub mod fragment;
/// Send outcome normalization.
pub mod normalization;
/// Backoff policy used by retry loops.
pub mod retry;
/// Sync loop phase state machine.
pub mod state_machine;
/// Sorted timeline buffer with index diffs.
pub mod timeline;
/// Protocol and observable types.
pub mod types;

pub use channel::{EngineChannels, EventStream};
pub use entry::{
    DecryptionOutcome, EntryOrder, EventEntry, FragmentBoundaryEntry, OrderedEntry,
    PendingEventData, PendingEventEntry, SendStatus, TimelineEntry,
};
pub use error::{EngineError, ErrorCategory, classify_http_status};
pub use event_key::{
    Direction, EventKey, FIRST_FRAGMENT_ID, MAX_INDEX, MIDDLE_INDEX, MIN_INDEX,
    PENDING_FRAGMENT_ID,
};
pub use fragment::{ComparerError, Fragment, FragmentIdComparer};
pub use normalization::{SendOutcome, normalize_fatal_error, normalize_send_outcome};
pub use retry::RetryPolicy;
pub use state_machine::SyncStateMachine;
pub use timeline::{TimelineBuffer, TimelineMergeError};
pub use types::{
    ConnectionStatus, EngineEvent, InvitedRoom, Membership, MessagesResponse, RawEvent,
    RoomSummary, RoomSyncResponse, SendAck, StateSlice, SyncResponse, SyncRooms, SyncSnapshot,
    SyncStatus, TimelineDiff, TimelineSlice, ToDevice, Unsigned, UnreadNotifications,
    event_types,
};
