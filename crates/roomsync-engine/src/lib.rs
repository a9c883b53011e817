//! Client-side replication of chat rooms.
//!
//! A [`Session`] keeps a durable, ordered copy of every room's history in a
//! [`roomsync_store::Storage`], fed by an incremental sync loop against a
//! [`HomeServerApi`]. History is stored in fragments that are backfilled on
//! demand through a room's [`Timeline`]; local events go through a durable
//! per-room send queue and show up in the timeline until their remote echo
//! arrives.

mod api;
mod config;
mod crypto;
mod room;
mod session;
mod storage;
mod sync;
#[cfg(test)]
mod test_utils;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use api::{ApiError, HomeServerApi, SyncRequest};
pub use config::{ConfigError, EngineConfig};
pub use crypto::{
    CryptoError, DecryptionChanges, DecryptionPreparation, DecryptionResults,
    EncryptedAttachment, EncryptedPayload, RoomEncryption,
};
pub use room::{Attachment, Room, RoomMember, Timeline};
pub use session::{Session, SessionConfig};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
