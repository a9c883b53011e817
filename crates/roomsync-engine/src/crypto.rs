use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use roomsync_core::{DecryptionOutcome, EngineError, ErrorCategory, RawEvent, event_types};
use roomsync_store::Transaction;
use serde_json::Value;
use thiserror::Error;

/// Decryption outcome per event id.
pub type DecryptionResults = HashMap<String, DecryptionOutcome>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("crypto store failure: {0}")]
    Store(String),
}

/// Event payload produced by [`RoomEncryption::encrypt`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedPayload {
    pub event_type: String,
    pub content: Value,
}

/// Ciphertext of an attachment plus the key material to embed in the event.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedAttachment {
    pub data: Vec<u8>,
    pub file_info: Value,
}

/// End-to-end encryption collaborator for room events.
///
/// Decryption runs in three phases so that network/crypto work happens
/// before the store transaction and only the final bookkeeping runs inside
/// it.
#[async_trait]
pub trait RoomEncryption: Send + Sync {
    async fn encrypt(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptedPayload, CryptoError>;

    async fn encrypt_attachment(&self, data: Vec<u8>) -> Result<EncryptedAttachment, CryptoError>;

    async fn prepare_decryption(
        &self,
        room_id: &str,
        events: &[RawEvent],
    ) -> Result<Box<dyn DecryptionPreparation>, CryptoError>;

    async fn receive_to_device(&self, _events: &[Value]) -> Result<(), CryptoError> {
        Ok(())
    }
}

#[async_trait]
pub trait DecryptionPreparation: Send {
    async fn decrypt(self: Box<Self>) -> Result<Box<dyn DecryptionChanges>, CryptoError>;
}

pub trait DecryptionChanges: Send {
    /// Persist session bookkeeping and hand back per-event outcomes.
    fn write(
        self: Box<Self>,
        txn: &mut dyn Transaction,
    ) -> Result<DecryptionResults, CryptoError>;
}

/// Run the pre-transaction decryption phases for the encrypted events among
/// `events`. `None` when there is nothing to decrypt or no collaborator.
pub(crate) async fn prepare_room_decryption(
    encryption: Option<&Arc<dyn RoomEncryption>>,
    room_id: &str,
    events: &[RawEvent],
) -> Result<Option<Box<dyn DecryptionChanges>>, EngineError> {
    let Some(encryption) = encryption else {
        return Ok(None);
    };
    let encrypted: Vec<RawEvent> = events
        .iter()
        .filter(|event| event.event_type == event_types::ENCRYPTED)
        .cloned()
        .collect();
    if encrypted.is_empty() {
        return Ok(None);
    }

    let preparation = encryption
        .prepare_decryption(room_id, &encrypted)
        .await
        .map_err(|err| map_crypto_error("prepare_decryption", err))?;
    let changes = preparation
        .decrypt()
        .await
        .map_err(|err| map_crypto_error("decrypt", err))?;
    Ok(Some(changes))
}

/// Write prepared decryption changes inside the recording transaction.
pub(crate) fn write_decryption(
    changes: Option<Box<dyn DecryptionChanges>>,
    txn: &mut dyn Transaction,
) -> Result<DecryptionResults, EngineError> {
    match changes {
        Some(changes) => changes
            .write(txn)
            .map_err(|err| map_crypto_error("write_decryption", err)),
        None => Ok(DecryptionResults::new()),
    }
}

pub(crate) fn map_crypto_error(operation: &str, err: CryptoError) -> EngineError {
    let code = match err {
        CryptoError::Encrypt(_) => "encrypt_failed",
        CryptoError::Decrypt(_) => "decrypt_failed",
        CryptoError::Store(_) => "crypto_store_error",
    };
    EngineError::new(
        ErrorCategory::Crypto,
        code,
        format!("{operation} failed: {err}"),
    )
}
