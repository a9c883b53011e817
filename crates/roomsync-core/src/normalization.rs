use crate::{
    error::EngineError,
    types::{EngineEvent, SendAck},
};

/// Send result of one pending event before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server accepted the event.
    Success { event_id: String },
    /// The event moved to the error state.
    Failure { error: EngineError },
}

/// Convert a pending event's send outcome to a stable `EngineEvent::SendAck`.
pub fn normalize_send_outcome(
    room_id: impl Into<String>,
    txn_id: impl Into<String>,
    queue_index: u64,
    outcome: SendOutcome,
) -> EngineEvent {
    let (event_id, error_code) = match outcome {
        SendOutcome::Success { event_id } => (Some(event_id), None),
        SendOutcome::Failure { error } => (None, Some(error.code)),
    };
    EngineEvent::SendAck(SendAck {
        room_id: room_id.into(),
        txn_id: txn_id.into(),
        queue_index,
        event_id,
        error_code,
    })
}

/// Convert an error into a `FatalError` engine event.
pub fn normalize_fatal_error(error: EngineError, recoverable: bool) -> EngineEvent {
    EngineEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome(
            "!room:example.org",
            "txn-1",
            4,
            SendOutcome::Success {
                event_id: "$abc".into(),
            },
        );

        match event {
            EngineEvent::SendAck(ack) => {
                assert_eq!(ack.txn_id, "txn-1");
                assert_eq!(ack.queue_index, 4);
                assert_eq!(ack.event_id.as_deref(), Some("$abc"));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "!room:example.org",
            "txn-2",
            5,
            SendOutcome::Failure {
                error: EngineError::new(ErrorCategory::Config, "M_FORBIDDEN", "not allowed"),
            },
        );

        match event {
            EngineEvent::SendAck(ack) => {
                assert_eq!(ack.room_id, "!room:example.org");
                assert_eq!(ack.event_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("M_FORBIDDEN"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn fatal_error_keeps_code_and_message() {
        let event = normalize_fatal_error(EngineError::consistency("self_link", "bad link"), false);
        assert_eq!(
            event,
            EngineEvent::FatalError {
                code: "self_link".into(),
                message: "bad link".into(),
                recoverable: false,
            }
        );
    }
}
