use std::{
    cmp::Ordering,
    collections::BTreeMap,
    iter::Peekable,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
};

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

use crate::{KeyRange, ScanOrder, Storage, StorageError, StoreName, Transaction};

type Table = BTreeMap<String, Vec<u8>>;

/// Store kept entirely in memory.
///
/// Each table sits behind its own lock. Transactions take their locks in
/// [`StoreName`] order, so overlapping read-write transactions queue up
/// instead of deadlocking. Writes are staged and only become visible on
/// commit.
#[derive(Clone)]
pub struct MemoryStorage {
    tables: Arc<BTreeMap<StoreName, Arc<RwLock<Table>>>>,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        let tables = StoreName::ALL
            .iter()
            .map(|name| (*name, Arc::new(RwLock::new(Table::new()))))
            .collect();
        Self {
            tables: Arc::new(tables),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every transaction opened from now on.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }

    fn scope(
        &self,
        stores: &[StoreName],
    ) -> Result<Vec<(StoreName, Arc<RwLock<Table>>)>, StorageError> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::Closed);
        }
        let mut names = stores.to_vec();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|name| {
                self.tables
                    .get(&name)
                    .cloned()
                    .map(|table| (name, table))
                    .ok_or_else(|| StorageError::Backend(format!("missing table {name:?}")))
            })
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_txn(&self, stores: &[StoreName]) -> Result<Box<dyn Transaction>, StorageError> {
        let mut guards = BTreeMap::new();
        for (name, table) in self.scope(stores)? {
            guards.insert(name, TableGuard::Read(table.read_owned().await));
        }
        Ok(Box::new(MemoryTransaction {
            guards,
            staged: BTreeMap::new(),
        }))
    }

    async fn read_write_txn(
        &self,
        stores: &[StoreName],
    ) -> Result<Box<dyn Transaction>, StorageError> {
        let mut guards = BTreeMap::new();
        for (name, table) in self.scope(stores)? {
            guards.insert(name, TableGuard::Write(table.write_owned().await));
        }
        Ok(Box::new(MemoryTransaction {
            guards,
            staged: BTreeMap::new(),
        }))
    }
}

enum TableGuard {
    Read(OwnedRwLockReadGuard<Table>),
    Write(OwnedRwLockWriteGuard<Table>),
}

impl TableGuard {
    fn table(&self) -> &Table {
        match self {
            TableGuard::Read(guard) => &**guard,
            TableGuard::Write(guard) => &**guard,
        }
    }
}

struct MemoryTransaction {
    guards: BTreeMap<StoreName, TableGuard>,
    staged: BTreeMap<StoreName, BTreeMap<String, Option<Vec<u8>>>>,
}

impl MemoryTransaction {
    fn guard(&self, store: StoreName) -> Result<&TableGuard, StorageError> {
        self.guards
            .get(&store)
            .ok_or(StorageError::StoreNotInScope(store))
    }

    fn staged_for_write(
        &mut self,
        store: StoreName,
    ) -> Result<&mut BTreeMap<String, Option<Vec<u8>>>, StorageError> {
        if !matches!(self.guard(store)?, TableGuard::Write(_)) {
            return Err(StorageError::ReadOnly);
        }
        Ok(self.staged.entry(store).or_default())
    }
}

impl Transaction for MemoryTransaction {
    fn is_read_only(&self) -> bool {
        self.guards
            .values()
            .all(|guard| matches!(guard, TableGuard::Read(_)))
    }

    fn get(&self, store: StoreName, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let table = self.guard(store)?.table();
        if let Some(staged) = self.staged.get(&store).and_then(|staged| staged.get(key)) {
            return Ok(staged.clone());
        }
        Ok(table.get(key).cloned())
    }

    fn put(&mut self, store: StoreName, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.staged_for_write(store)?
            .insert(key.to_owned(), Some(value));
        Ok(())
    }

    fn delete(&mut self, store: StoreName, key: &str) -> Result<(), StorageError> {
        self.staged_for_write(store)?.insert(key.to_owned(), None);
        Ok(())
    }

    fn scan(
        &self,
        store: StoreName,
        range: &KeyRange,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let table = self.guard(store)?.table();
        let limit = limit.unwrap_or(usize::MAX);
        if range.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let bounds = (range.lower(), range.upper());
        let empty = BTreeMap::new();
        let staged = self.staged.get(&store).unwrap_or(&empty);
        let base = table.range::<str, _>(bounds);
        let overlay = staged.range::<str, _>(bounds);

        Ok(match order {
            ScanOrder::Ascending => merge(base.peekable(), overlay.peekable(), order, limit),
            ScanOrder::Descending => {
                merge(base.rev().peekable(), overlay.rev().peekable(), order, limit)
            }
        })
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let staged = std::mem::take(&mut self.staged);
        for (store, changes) in staged {
            let Some(TableGuard::Write(table)) = self.guards.get_mut(&store) else {
                return Err(StorageError::ReadOnly);
            };
            trace!(store = ?store, changes = changes.len(), "committing staged writes");
            for (key, value) in changes {
                match value {
                    Some(value) => {
                        table.insert(key, value);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        trace!(stores = self.guards.len(), "transaction aborted");
    }
}

/// Merge committed rows with the transaction's staged overlay.
///
/// Both iterators yield keys in `order`; staged values shadow committed ones
/// and a staged `None` hides the key.
fn merge<'a, B, S>(
    mut base: Peekable<B>,
    mut staged: Peekable<S>,
    order: ScanOrder,
    limit: usize,
) -> Vec<(String, Vec<u8>)>
where
    B: Iterator<Item = (&'a String, &'a Vec<u8>)>,
    S: Iterator<Item = (&'a String, &'a Option<Vec<u8>>)>,
{
    let mut rows = Vec::new();
    while rows.len() < limit {
        let ordering = match (base.peek(), staged.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((base_key, _)), Some((staged_key, _))) => {
                let ordering = base_key.as_str().cmp(staged_key.as_str());
                match order {
                    ScanOrder::Ascending => ordering,
                    ScanOrder::Descending => ordering.reverse(),
                }
            }
        };

        match ordering {
            Ordering::Less => {
                if let Some((key, value)) = base.next() {
                    rows.push((key.clone(), value.clone()));
                }
            }
            Ordering::Equal | Ordering::Greater => {
                if ordering == Ordering::Equal {
                    base.next();
                }
                if let Some((key, Some(value))) = staged.next() {
                    rows.push((key.clone(), value.clone()));
                }
            }
        }
    }
    rows
}
