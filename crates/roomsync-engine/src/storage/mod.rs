//! Typed accessors over the key-value store.
//!
//! Every function takes an open transaction; none of them commit. Records are
//! stored as JSON.

use roomsync_core::{EngineError, ErrorCategory};
use roomsync_store::{Storage, StorageError, StoreName, Transaction};
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

pub(crate) mod events;
pub(crate) mod fragments;
pub(crate) mod members;
pub(crate) mod pending;
pub(crate) mod room_state;
pub(crate) mod session;
pub(crate) mod summary;

pub(crate) fn encode<T: Serialize>(operation: &str, value: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(value).map_err(|err| {
        EngineError::new(
            ErrorCategory::Serialization,
            "record_serialize_error",
            format!("{operation}: {err}"),
        )
    })
}

pub(crate) fn decode<T: DeserializeOwned>(operation: &str, bytes: &[u8]) -> Result<T, EngineError> {
    serde_json::from_slice(bytes).map_err(|err| {
        EngineError::new(
            ErrorCategory::Serialization,
            "record_deserialize_error",
            format!("{operation}: {err}"),
        )
    })
}

pub(crate) fn map_storage_error(operation: &str, err: StorageError) -> EngineError {
    let code = match err {
        StorageError::StoreNotInScope(_) => "store_not_in_scope",
        StorageError::ReadOnly => "store_read_only",
        StorageError::Closed => "storage_closed",
        StorageError::Backend(_) => "storage_error",
    };
    EngineError::new(
        ErrorCategory::Storage,
        code,
        format!("{operation} failed: {err}"),
    )
}

pub(crate) fn get_record<T: DeserializeOwned>(
    txn: &dyn Transaction,
    store: StoreName,
    key: &str,
    operation: &str,
) -> Result<Option<T>, EngineError> {
    txn.get(store, key)
        .map_err(|err| map_storage_error(operation, err))?
        .map(|bytes| decode(operation, &bytes))
        .transpose()
}

pub(crate) fn put_record<T: Serialize>(
    txn: &mut dyn Transaction,
    store: StoreName,
    key: &str,
    value: &T,
    operation: &str,
) -> Result<(), EngineError> {
    let bytes = encode(operation, value)?;
    txn.put(store, key, bytes)
        .map_err(|err| map_storage_error(operation, err))
}

pub(crate) fn delete_record(
    txn: &mut dyn Transaction,
    store: StoreName,
    key: &str,
    operation: &str,
) -> Result<(), EngineError> {
    txn.delete(store, key)
        .map_err(|err| map_storage_error(operation, err))
}

/// Run `work` in a read-write transaction and commit it.
///
/// A failing `work` aborts the transaction before the error propagates.
pub(crate) async fn write_txn<T, F>(
    storage: &dyn Storage,
    stores: &[StoreName],
    operation: &str,
    work: F,
) -> Result<T, EngineError>
where
    F: FnOnce(&mut dyn Transaction) -> Result<T, EngineError>,
{
    let mut txn = storage
        .read_write_txn(stores)
        .await
        .map_err(|err| map_storage_error(operation, err))?;
    match work(txn.as_mut()) {
        Ok(value) => {
            txn.commit()
                .map_err(|err| map_storage_error(operation, err))?;
            Ok(value)
        }
        Err(err) => {
            warn!(operation, code = %err.code, "aborting write transaction");
            txn.abort();
            Err(err)
        }
    }
}

/// Run `work` in a read-only transaction.
pub(crate) async fn read_txn<T, F>(
    storage: &dyn Storage,
    stores: &[StoreName],
    operation: &str,
    work: F,
) -> Result<T, EngineError>
where
    F: FnOnce(&dyn Transaction) -> Result<T, EngineError>,
{
    let txn = storage
        .read_txn(stores)
        .await
        .map_err(|err| map_storage_error(operation, err))?;
    let result = work(txn.as_ref());
    txn.abort();
    result
}
