//! Transactional key-value store used by the replication engine.
//!
//! Every access happens inside a transaction scoped to the [`StoreName`]s it
//! declares up front. Read-write transactions over overlapping stores are
//! serialized; read-only transactions run concurrently with each other.
//! Dropping a transaction without calling [`Transaction::commit`] aborts it.

use std::ops::Bound;

use async_trait::async_trait;
use thiserror::Error;

/// Composite key encoding.
pub mod key;
/// In-memory implementation with the same isolation semantics.
pub mod memory;

pub use memory::MemoryStorage;

/// Named tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreName {
    Session,
    RoomSummary,
    RoomState,
    RoomMembers,
    TimelineEvents,
    /// Secondary index from event id to event key.
    TimelineEventIds,
    TimelineFragments,
    PendingEvents,
}

impl StoreName {
    pub const ALL: [StoreName; 8] = [
        StoreName::Session,
        StoreName::RoomSummary,
        StoreName::RoomState,
        StoreName::RoomMembers,
        StoreName::TimelineEvents,
        StoreName::TimelineEventIds,
        StoreName::TimelineFragments,
        StoreName::PendingEvents,
    ];
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("store {0:?} is not part of this transaction")]
    StoreNotInScope(StoreName),
    #[error("write attempted in a read-only transaction")]
    ReadOnly,
    #[error("storage is closed")]
    Closed,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Key order of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Range of string keys to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<String>,
    upper: Bound<String>,
}

impl KeyRange {
    pub fn new(lower: Bound<String>, upper: Bound<String>) -> Self {
        Self { lower, upper }
    }

    pub fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let upper = match key::prefix_upper_bound(&prefix) {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        Self::new(Bound::Included(prefix), upper)
    }

    /// `lower..=upper`.
    pub fn inclusive(lower: impl Into<String>, upper: impl Into<String>) -> Self {
        Self::new(Bound::Included(lower.into()), Bound::Included(upper.into()))
    }

    pub fn lower(&self) -> Bound<&str> {
        self.lower.as_ref().map(String::as_str)
    }

    pub fn upper(&self) -> Bound<&str> {
        self.upper.as_ref().map(String::as_str)
    }

    /// Whether no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let above_lower = match self.lower() {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below_upper = match self.upper() {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above_lower && below_upper
    }
}

/// Store handle that opens scoped transactions.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_txn(&self, stores: &[StoreName]) -> Result<Box<dyn Transaction>, StorageError>;

    async fn read_write_txn(
        &self,
        stores: &[StoreName],
    ) -> Result<Box<dyn Transaction>, StorageError>;
}

/// One open transaction.
///
/// Reads observe the transaction's own uncommitted writes.
pub trait Transaction: Send {
    fn is_read_only(&self) -> bool;

    fn get(&self, store: StoreName, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&mut self, store: StoreName, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    fn delete(&mut self, store: StoreName, key: &str) -> Result<(), StorageError>;

    /// Key/value pairs inside `range`, in `order`, at most `limit` of them.
    fn scan(
        &self,
        store: StoreName,
        range: &KeyRange,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    fn abort(self: Box<Self>);
}
