use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{entry::TimelineEntry, error::EngineError};

/// Event types the engine interprets.
pub mod event_types {
    pub const MEMBER: &str = "m.room.member";
    pub const NAME: &str = "m.room.name";
    pub const ENCRYPTION: &str = "m.room.encryption";
    pub const ENCRYPTED: &str = "m.room.encrypted";
    pub const MESSAGE: &str = "m.room.message";
}

/// Unsigned event data; only the echoed transaction id matters here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unsigned {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// A room event as delivered by sync or backfill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    #[serde(default)]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Unsigned>,
}

impl RawEvent {
    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned
            .as_ref()
            .and_then(|unsigned| unsigned.transaction_id.as_deref())
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn is_member_event(&self) -> bool {
        self.event_type == event_types::MEMBER && self.state_key.is_some()
    }

    /// String field of the content, if present.
    pub fn content_str(&self, field: &str) -> Option<&str> {
        self.content.get(field).and_then(Value::as_str)
    }
}

/// Room membership of the syncing user or of a member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    #[default]
    Join,
    Leave,
    Invite,
    Ban,
    Knock,
}

impl Membership {
    pub fn from_content(content: &Value) -> Option<Self> {
        serde_json::from_value(content.get("membership")?.clone()).ok()
    }
}

/// Timeline slice of a room in a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimelineSlice {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// State delta preceding a room's timeline slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSlice {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub notification_count: u64,
}

/// A joined or left room's section of a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoomSyncResponse {
    #[serde(default)]
    pub timeline: TimelineSlice,
    #[serde(default)]
    pub state: StateSlice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotifications>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: StateSlice,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: BTreeMap<String, RoomSyncResponse>,
    #[serde(default)]
    pub leave: BTreeMap<String, RoomSyncResponse>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoom>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToDevice {
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Response body of the incremental sync endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
    #[serde(default)]
    pub to_device: ToDevice,
}

/// Response body of the backfill (`/messages`) endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
    #[serde(default)]
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default)]
    pub state: Vec<RawEvent>,
}

/// Lightweight room metadata kept up to date by sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    /// Room ID.
    pub room_id: String,
    /// Name from `m.room.name`, if any.
    pub name: Option<String>,
    /// Membership of the syncing user.
    pub membership: Membership,
    /// Whether `m.room.encryption` was seen.
    pub is_encrypted: bool,
    /// Whether the room is considered a direct message room.
    pub is_direct: bool,
    /// Timestamp of the newest message-like event.
    pub last_message_ts: Option<u64>,
    /// Notification count reported by sync.
    pub unread_notifications: u64,
    /// Highlight/mention count reported by sync.
    pub highlight_count: u64,
}

/// Phase of the sync loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStatus {
    /// First sync without a stored token.
    InitialSync,
    /// Draining backlog with zero timeout.
    CatchupSync,
    /// Long-polling for live updates.
    Syncing,
    /// Not running.
    Stopped,
}

/// Connectivity of the sync request layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    /// Waiting before retrying after a transport failure.
    Reconnecting { attempt: u32, retry_in_ms: u64 },
}

/// Observable sync state: phase, connectivity and terminal error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub connection: ConnectionStatus,
    pub error: Option<EngineError>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            status: SyncStatus::Stopped,
            connection: ConnectionStatus::Online,
            error: None,
        }
    }
}

/// Index-carrying change to an observable timeline.
///
/// Indices refer to the concatenated view: persisted entries first, then
/// pending entries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum TimelineDiff {
    Insert { index: usize, entry: TimelineEntry },
    Update { index: usize, entry: TimelineEntry },
    Remove { index: usize },
    Reset { entries: Vec<TimelineEntry> },
}

/// Send progress report for one pending event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub room_id: String,
    pub txn_id: String,
    pub queue_index: u64,
    /// Remote event id once the server accepted the event.
    pub event_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Session-level notification fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineEvent {
    /// Sync loop state changed.
    SyncStateChanged(SyncSnapshot),
    /// A room was seen for the first time.
    RoomAdded { room_id: String },
    /// Room summary changed after a committed sync.
    RoomUpdated(RoomSummary),
    /// A pending event was sent or failed.
    SendAck(SendAck),
    /// Non-recoverable engine error.
    FatalError {
        code: String,
        message: String,
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_sync_response_with_defaults() {
        let raw = json!({
            "next_batch": "s2",
            "rooms": {
                "join": {
                    "!a:example.org": {
                        "timeline": {
                            "events": [{
                                "event_id": "$1",
                                "type": "m.room.message",
                                "sender": "@alice:example.org",
                                "origin_server_ts": 10,
                                "content": {"body": "hi"},
                                "unsigned": {"transaction_id": "txn-1"}
                            }],
                            "limited": true,
                            "prev_batch": "p1"
                        }
                    }
                }
            }
        });

        let response: SyncResponse = serde_json::from_value(raw).expect("valid sync body");
        let room = &response.rooms.join["!a:example.org"];
        assert!(room.timeline.limited);
        assert_eq!(room.timeline.prev_batch.as_deref(), Some("p1"));
        assert_eq!(room.timeline.events[0].transaction_id(), Some("txn-1"));
        assert!(response.to_device.events.is_empty());
        assert!(response.rooms.leave.is_empty());
    }

    #[test]
    fn missing_event_id_deserializes_to_empty() {
        let event: RawEvent =
            serde_json::from_value(json!({"type": "m.room.message"})).expect("lenient body");
        assert!(event.event_id.is_empty());
        assert!(!event.is_state());
    }

    #[test]
    fn reads_membership_from_content() {
        assert_eq!(
            Membership::from_content(&json!({"membership": "leave"})),
            Some(Membership::Leave)
        );
        assert_eq!(Membership::from_content(&json!({})), None);
    }
}
