use roomsync_core::{EngineError, PendingEventData, PendingEventEntry, SendStatus};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Media to upload before an event is sent. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// In-memory state of one queued local event.
#[derive(Debug)]
pub(crate) struct PendingEvent {
    pub data: PendingEventData,
    pub status: SendStatus,
    pub error: Option<EngineError>,
    pub attachment: Option<Attachment>,
    /// Cancels in-flight work for this event only.
    pub abort: CancellationToken,
}

impl PendingEvent {
    pub(crate) fn new(data: PendingEventData, attachment: Option<Attachment>) -> Self {
        Self {
            data,
            status: SendStatus::Waiting,
            error: None,
            attachment,
            abort: CancellationToken::new(),
        }
    }

    /// Restore a stored event; one that already has a remote id only waits for
    /// its echo.
    pub(crate) fn restore(data: PendingEventData) -> Self {
        let status = if data.remote_id.is_some() {
            SendStatus::Sent
        } else {
            SendStatus::Waiting
        };
        Self {
            status,
            ..Self::new(data, None)
        }
    }

    pub(crate) fn entry(&self) -> PendingEventEntry {
        PendingEventEntry {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
        }
    }

    /// Next in line for the send loop.
    pub(crate) fn is_sendable(&self) -> bool {
        self.status == SendStatus::Waiting
    }

    /// Whether a sync event echoes this local event.
    pub(crate) fn is_echo(&self, event_id: &str, txn_id: Option<&str>) -> bool {
        txn_id == Some(self.data.txn_id.as_str()) || self.data.remote_id.as_deref() == Some(event_id)
    }
}

/// Type and content to put on the wire, preferring the encrypted payload.
pub(crate) fn wire_payload(data: &PendingEventData) -> (&str, &Value) {
    match (&data.encrypted_type, &data.encrypted_content) {
        (Some(event_type), Some(content)) => (event_type.as_str(), content),
        _ => (data.event_type.as_str(), &data.content),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data() -> PendingEventData {
        PendingEventData {
            room_id: "!room:example.org".into(),
            queue_index: 3,
            event_type: "m.room.message".into(),
            content: json!({"body": "hi"}),
            txn_id: "txn-3".into(),
            needs_encryption: true,
            needs_upload: false,
            encrypted_type: None,
            encrypted_content: None,
            remote_id: None,
        }
    }

    #[test]
    fn matches_echo_by_txn_id_or_remote_id() {
        let mut pending = PendingEvent::new(data(), None);
        assert!(pending.is_echo("$x", Some("txn-3")));
        assert!(!pending.is_echo("$x", None));

        pending.data.remote_id = Some("$x".into());
        assert!(pending.is_echo("$x", None));
    }

    #[test]
    fn restored_event_with_remote_id_is_sent() {
        let mut stored = data();
        stored.remote_id = Some("$remote".into());
        assert_eq!(PendingEvent::restore(stored).status, SendStatus::Sent);
        assert_eq!(PendingEvent::restore(data()).status, SendStatus::Waiting);
    }

    #[test]
    fn prefers_encrypted_payload_on_the_wire() {
        let mut data = data();
        assert_eq!(wire_payload(&data).0, "m.room.message");

        data.encrypted_type = Some("m.room.encrypted".into());
        data.encrypted_content = Some(json!({"ciphertext": "..."}));
        let (event_type, content) = wire_payload(&data);
        assert_eq!(event_type, "m.room.encrypted");
        assert_eq!(content["ciphertext"], "...");
    }
}
