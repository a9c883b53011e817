use roomsync_core::{EngineError, Fragment};
use roomsync_store::{KeyRange, ScanOrder, StoreName, Transaction, key};

use super::{decode, get_record, map_storage_error, put_record};

pub(crate) fn get(
    txn: &dyn Transaction,
    room_id: &str,
    fragment_id: u32,
) -> Result<Option<Fragment>, EngineError> {
    get_record(
        txn,
        StoreName::TimelineFragments,
        &key::fragment_key(room_id, fragment_id),
        "get_fragment",
    )
}

/// Like [`get`] but a missing fragment is a consistency error.
pub(crate) fn require(
    txn: &dyn Transaction,
    room_id: &str,
    fragment_id: u32,
) -> Result<Fragment, EngineError> {
    get(txn, room_id, fragment_id)?.ok_or_else(|| {
        EngineError::consistency(
            "unknown_fragment",
            format!("fragment {fragment_id} of {room_id} is not stored"),
        )
    })
}

pub(crate) fn put(txn: &mut dyn Transaction, fragment: &Fragment) -> Result<(), EngineError> {
    if fragment.previous_id == Some(fragment.id) || fragment.next_id == Some(fragment.id) {
        return Err(EngineError::consistency(
            "self_link",
            format!("fragment {} cannot link to itself", fragment.id),
        ));
    }
    put_record(
        txn,
        StoreName::TimelineFragments,
        &key::fragment_key(&fragment.room_id, fragment.id),
        fragment,
        "put_fragment",
    )
}

pub(crate) fn all(txn: &dyn Transaction, room_id: &str) -> Result<Vec<Fragment>, EngineError> {
    txn.scan(
        StoreName::TimelineFragments,
        &KeyRange::prefix(key::room_prefix(room_id)),
        ScanOrder::Ascending,
        None,
    )
    .map_err(|err| map_storage_error("scan_fragments", err))?
    .iter()
    .map(|(_, bytes)| decode("scan_fragments", bytes))
    .collect()
}

/// The fragment receiving live events, if the room has one.
pub(crate) fn live(txn: &dyn Transaction, room_id: &str) -> Result<Option<Fragment>, EngineError> {
    Ok(all(txn, room_id)?
        .into_iter()
        .filter(Fragment::is_live)
        .max_by_key(|fragment| fragment.id))
}

pub(crate) fn max_id(txn: &dyn Transaction, room_id: &str) -> Result<Option<u32>, EngineError> {
    let rows = txn
        .scan(
            StoreName::TimelineFragments,
            &KeyRange::prefix(key::room_prefix(room_id)),
            ScanOrder::Descending,
            Some(1),
        )
        .map_err(|err| map_storage_error("max_fragment_id", err))?;
    Ok(rows
        .first()
        .and_then(|(fragment_key, _)| key::parse_fragment_id(fragment_key)))
}
