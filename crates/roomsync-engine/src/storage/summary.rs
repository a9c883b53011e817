use roomsync_core::{EngineError, RoomSummary};
use roomsync_store::{KeyRange, ScanOrder, StoreName, Transaction};

use super::{decode, get_record, map_storage_error, put_record};

pub(crate) fn get(txn: &dyn Transaction, room_id: &str) -> Result<Option<RoomSummary>, EngineError> {
    get_record(txn, StoreName::RoomSummary, room_id, "get_summary")
}

pub(crate) fn set(txn: &mut dyn Transaction, summary: &RoomSummary) -> Result<(), EngineError> {
    put_record(
        txn,
        StoreName::RoomSummary,
        &summary.room_id,
        summary,
        "set_summary",
    )
}

/// Every stored room summary; used to restore rooms at session load.
pub(crate) fn all(txn: &dyn Transaction) -> Result<Vec<RoomSummary>, EngineError> {
    txn.scan(
        StoreName::RoomSummary,
        &KeyRange::all(),
        ScanOrder::Ascending,
        None,
    )
    .map_err(|err| map_storage_error("scan_summaries", err))?
    .iter()
    .map(|(_, bytes)| decode("scan_summaries", bytes))
    .collect()
}
