use roomsync_core::{EngineError, PendingEventData};
use roomsync_store::{KeyRange, ScanOrder, StoreName, Transaction, key};

use super::{decode, delete_record, get_record, map_storage_error, put_record};

const QUEUE_INDEX_KEY: &str = "pending_queue_index";

/// Stored pending events of a room, ordered by queue index.
pub(crate) fn all(
    txn: &dyn Transaction,
    room_id: &str,
) -> Result<Vec<PendingEventData>, EngineError> {
    txn.scan(
        StoreName::PendingEvents,
        &KeyRange::prefix(key::room_prefix(room_id)),
        ScanOrder::Ascending,
        None,
    )
    .map_err(|err| map_storage_error("scan_pending", err))?
    .iter()
    .map(|(_, bytes)| decode("scan_pending", bytes))
    .collect()
}

pub(crate) fn get(
    txn: &dyn Transaction,
    room_id: &str,
    queue_index: u64,
) -> Result<Option<PendingEventData>, EngineError> {
    get_record(
        txn,
        StoreName::PendingEvents,
        &key::pending_key(room_id, queue_index),
        "get_pending",
    )
}

pub(crate) fn put(txn: &mut dyn Transaction, data: &PendingEventData) -> Result<(), EngineError> {
    put_record(
        txn,
        StoreName::PendingEvents,
        &key::pending_key(&data.room_id, data.queue_index),
        data,
        "put_pending",
    )
}

pub(crate) fn remove(
    txn: &mut dyn Transaction,
    room_id: &str,
    queue_index: u64,
) -> Result<(), EngineError> {
    delete_record(
        txn,
        StoreName::PendingEvents,
        &key::pending_key(room_id, queue_index),
        "remove_pending",
    )
}

/// Highest queue index ever handed out in the room, `0` if none.
///
/// Lives in the session store so it survives the queue draining.
pub(crate) fn last_queue_index(txn: &dyn Transaction, room_id: &str) -> Result<u64, EngineError> {
    Ok(get_record(
        txn,
        StoreName::Session,
        &key::room_scoped(QUEUE_INDEX_KEY, &[room_id]),
        "get_queue_index",
    )?
    .unwrap_or(0))
}

pub(crate) fn set_last_queue_index(
    txn: &mut dyn Transaction,
    room_id: &str,
    queue_index: u64,
) -> Result<(), EngineError> {
    put_record(
        txn,
        StoreName::Session,
        &key::room_scoped(QUEUE_INDEX_KEY, &[room_id]),
        &queue_index,
        "set_queue_index",
    )
}
