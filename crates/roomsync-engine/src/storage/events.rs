use std::ops::Bound;

use roomsync_core::{EngineError, EventEntry, EventKey, MAX_INDEX, MIN_INDEX};
use roomsync_store::{KeyRange, ScanOrder, StoreName, Transaction, key};

use super::{decode, get_record, map_storage_error, put_record};

pub(crate) fn get(
    txn: &dyn Transaction,
    room_id: &str,
    event_key: EventKey,
) -> Result<Option<EventEntry>, EngineError> {
    get_record(
        txn,
        StoreName::TimelineEvents,
        &key::event_key(room_id, event_key.fragment_id, event_key.event_index),
        "get_event",
    )
}

/// Key of an already stored event, looked up through the event id index.
pub(crate) fn key_for_event_id(
    txn: &dyn Transaction,
    room_id: &str,
    event_id: &str,
) -> Result<Option<EventKey>, EngineError> {
    get_record(
        txn,
        StoreName::TimelineEventIds,
        &key::room_scoped(room_id, &[event_id]),
        "get_event_id",
    )
}

pub(crate) fn get_by_event_id(
    txn: &dyn Transaction,
    room_id: &str,
    event_id: &str,
) -> Result<Option<EventEntry>, EngineError> {
    match key_for_event_id(txn, room_id, event_id)? {
        Some(event_key) => get(txn, room_id, event_key),
        None => Ok(None),
    }
}

/// Store a new event and index its id.
pub(crate) fn insert(txn: &mut dyn Transaction, entry: &EventEntry) -> Result<(), EngineError> {
    update(txn, entry)?;
    put_record(
        txn,
        StoreName::TimelineEventIds,
        &key::room_scoped(&entry.room_id, &[entry.event_id()]),
        &entry.key,
        "index_event_id",
    )
}

/// Overwrite a stored event, e.g. to attach a decryption result.
pub(crate) fn update(txn: &mut dyn Transaction, entry: &EventEntry) -> Result<(), EngineError> {
    put_record(
        txn,
        StoreName::TimelineEvents,
        &key::event_key(&entry.room_id, entry.key.fragment_id, entry.key.event_index),
        entry,
        "put_event",
    )
}

/// Up to `amount` events strictly before `before` in its fragment, in ascending order.
pub(crate) fn before(
    txn: &dyn Transaction,
    room_id: &str,
    before: EventKey,
    amount: usize,
) -> Result<Vec<EventEntry>, EngineError> {
    let range = between(room_id, before.fragment_id, MIN_INDEX, before.event_index);
    let mut entries = scan(txn, &range, ScanOrder::Descending, amount)?;
    entries.reverse();
    Ok(entries)
}

/// Up to `amount` events strictly after `after` in its fragment, in ascending order.
pub(crate) fn after(
    txn: &dyn Transaction,
    room_id: &str,
    after: EventKey,
    amount: usize,
) -> Result<Vec<EventEntry>, EngineError> {
    let range = between(room_id, after.fragment_id, after.event_index, MAX_INDEX);
    scan(txn, &range, ScanOrder::Ascending, amount)
}

pub(crate) fn first_in_fragment(
    txn: &dyn Transaction,
    room_id: &str,
    fragment_id: u32,
) -> Result<Option<EventEntry>, EngineError> {
    Ok(after(txn, room_id, EventKey::fragment_start(fragment_id), 1)?
        .into_iter()
        .next())
}

pub(crate) fn last_in_fragment(
    txn: &dyn Transaction,
    room_id: &str,
    fragment_id: u32,
) -> Result<Option<EventEntry>, EngineError> {
    Ok(before(txn, room_id, EventKey::fragment_end(fragment_id), 1)?
        .into_iter()
        .next())
}

fn between(room_id: &str, fragment_id: u32, low: u32, high: u32) -> KeyRange {
    KeyRange::new(
        Bound::Excluded(key::event_key(room_id, fragment_id, low)),
        Bound::Excluded(key::event_key(room_id, fragment_id, high)),
    )
}

fn scan(
    txn: &dyn Transaction,
    range: &KeyRange,
    order: ScanOrder,
    amount: usize,
) -> Result<Vec<EventEntry>, EngineError> {
    if amount == 0 {
        return Ok(Vec::new());
    }
    txn.scan(StoreName::TimelineEvents, range, order, Some(amount))
        .map_err(|err| map_storage_error("scan_events", err))?
        .iter()
        .map(|(_, bytes)| decode("scan_events", bytes))
        .collect()
}
