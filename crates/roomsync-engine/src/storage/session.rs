use roomsync_core::EngineError;
use roomsync_store::{StoreName, Transaction};

use super::{get_record, put_record};

const SYNC_TOKEN_KEY: &str = "sync_token";
const FILTER_ID_KEY: &str = "filter_id";

/// Session-wide values persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SessionState {
    pub sync_token: Option<String>,
    pub filter_id: Option<String>,
}

pub(crate) fn load(txn: &dyn Transaction) -> Result<SessionState, EngineError> {
    Ok(SessionState {
        sync_token: get_record(txn, StoreName::Session, SYNC_TOKEN_KEY, "load_sync_token")?,
        filter_id: get_record(txn, StoreName::Session, FILTER_ID_KEY, "load_filter_id")?,
    })
}

pub(crate) fn set_sync_token(txn: &mut dyn Transaction, token: &str) -> Result<(), EngineError> {
    put_record(txn, StoreName::Session, SYNC_TOKEN_KEY, &token, "set_sync_token")
}

pub(crate) fn set_filter_id(txn: &mut dyn Transaction, filter_id: &str) -> Result<(), EngineError> {
    put_record(txn, StoreName::Session, FILTER_ID_KEY, &filter_id, "set_filter_id")
}
