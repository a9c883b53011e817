use roomsync_core::{EngineError, RawEvent};
use roomsync_store::{StoreName, Transaction, key};

use super::{get_record, put_record};

/// Latest state event for `(event_type, state_key)`.
pub(crate) fn get(
    txn: &dyn Transaction,
    room_id: &str,
    event_type: &str,
    state_key: &str,
) -> Result<Option<RawEvent>, EngineError> {
    get_record(
        txn,
        StoreName::RoomState,
        &key::room_scoped(room_id, &[event_type, state_key]),
        "get_room_state",
    )
}

/// Store a state event; events without a state key are ignored.
pub(crate) fn set(
    txn: &mut dyn Transaction,
    room_id: &str,
    event: &RawEvent,
) -> Result<(), EngineError> {
    let Some(state_key) = event.state_key.as_deref() else {
        return Ok(());
    };
    put_record(
        txn,
        StoreName::RoomState,
        &key::room_scoped(room_id, &[&event.event_type, state_key]),
        event,
        "set_room_state",
    )
}
