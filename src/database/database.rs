//! # TreeStore Handle
//!
//! `TreeStore` is the engine handle: a cheap `Clone` over an `Arc` holding the
//! pager, the snapshot registry and the writer mutex. It offers one-shot
//! key/value operations (each in its own transaction) and closures that run a
//! caller's work inside one transaction.
//!
//! ```ignore
//! let store = TreeStore::open("./data.db")?;
//! store.insert(b"key01", b"value")?;
//!
//! store.update(|txn| {
//!     txn.insert(b"a", b"1")?;
//!     txn.delete(b"b")?;
//!     Ok(())
//! })?;
//!
//! let rows = store.range_scan(b"key00", b"key10")?;
//! ```

use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use super::builder::{StoreBuilder, StoreConfig};
use super::transaction::{KvRead, ReadTxn, WriteTxn};
use crate::btree::TreeStats;
use crate::mvcc::TransactionManager;
use crate::storage::Pager;

pub(crate) struct StoreShared {
    pub(crate) pager: Pager,
    pub(crate) txns: TransactionManager,
    pub(crate) writer: Mutex<()>,
    pub(crate) config: StoreConfig,
}

#[derive(Clone)]
pub struct TreeStore {
    shared: Arc<StoreShared>,
}

/// Point-in-time summary returned by [`TreeStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub version: u64,
    pub root: u64,
    /// Pages recorded in the meta page, including page 0.
    pub page_count: u64,
    /// Pages currently backing the file.
    pub file_pages: u64,
    /// Page ids queued on the free list.
    pub free_pages: u64,
    pub active_readers: usize,
}

impl std::fmt::Debug for TreeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeStore")
            .field("path", &self.shared.pager.path())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl TreeStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Opens or creates the store at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path.as_ref(), StoreConfig::default())
    }

    pub(crate) fn open_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        let (pager, meta) = Pager::open(path, config.create_if_missing, config.initial_pages)
            .wrap_err_with(|| format!("failed to open store at '{}'", path.display()))?;
        Ok(Self {
            shared: Arc::new(StoreShared {
                pager,
                txns: TransactionManager::new(meta),
                writer: Mutex::new(()),
                config,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        self.shared.pager.path()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        let slot = self.shared.txns.begin_read()?;
        Ok(ReadTxn::new(&self.shared, slot))
    }

    /// Blocks until the writer slot is free.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let writer = self.shared.writer.lock();
        let (snapshot, reuse_limit) = self.shared.txns.begin_write();
        Ok(WriteTxn::new(&self.shared, writer, snapshot, reuse_limit))
    }

    /// Runs `f` against a read snapshot.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<T>,
    {
        let txn = self.begin_read()?;
        f(&txn)
    }

    /// Runs `f` in a write transaction, committing on `Ok` and rolling back
    /// on `Err`.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let mut txn = self.begin_write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "update closure failed");
                txn.rollback();
                Err(e)
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.begin_read()?.get(key)
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.update(|txn| txn.insert(key, value))
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.update(|txn| txn.delete(key))
    }

    /// Every entry with `start <= key <= end`, ascending.
    pub fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let txn = self.begin_read()?;
        let rows = txn.range(start, end)?.collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let snapshot = self.shared.txns.current();
        Ok(StoreStats {
            version: snapshot.version,
            root: snapshot.root(),
            page_count: snapshot.meta.page_count(),
            file_pages: self.shared.pager.file_pages(),
            free_pages: snapshot.meta.free_list().len(),
            active_readers: self.shared.txns.active_readers(),
        })
    }

    /// Walks the committed tree and verifies its structural invariants.
    pub fn check_integrity(&self) -> Result<TreeStats> {
        self.begin_read()?.check()
    }

    /// Flushes the file even when `sync_on_commit` is off.
    pub fn sync(&self) -> Result<()> {
        self.shared.pager.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (TempDir, TreeStore) {
        let dir = tempdir().unwrap();
        let store = TreeStore::builder()
            .path(dir.path().join("test.db"))
            .sync_on_commit(false)
            .open()
            .unwrap();
        (dir, store)
    }

    #[test]
    fn one_shot_operations_round_trip() {
        let (_dir, store) = create_test_store();

        store.insert(b"k1", b"v1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(store.delete(b"k1").unwrap());
        assert_eq!(store.get(b"k1").unwrap(), None);
        assert!(!store.delete(b"k1").unwrap());
    }

    #[test]
    fn failed_update_leaves_store_untouched() {
        let (_dir, store) = create_test_store();
        store.insert(b"keep", b"1").unwrap();
        let before = store.stats().unwrap();

        let result: Result<()> = store.update(|txn| {
            txn.insert(b"temp", b"2")?;
            eyre::bail!("abort")
        });

        assert!(result.is_err());
        assert_eq!(store.get(b"temp").unwrap(), None);
        assert_eq!(store.stats().unwrap().version, before.version);
    }

    #[test]
    fn empty_write_transaction_does_not_bump_version() {
        let (_dir, store) = create_test_store();
        let v0 = store.stats().unwrap().version;
        let v1 = store.begin_write().unwrap().commit().unwrap();
        assert_eq!(v0, v1);
    }

    #[test]
    fn clones_share_the_same_engine() {
        let (_dir, store) = create_test_store();
        let other = store.clone();

        other.insert(b"shared", b"yes").unwrap();
        assert_eq!(store.get(b"shared").unwrap(), Some(b"yes".to_vec()));
    }

    #[test]
    fn stats_track_readers() {
        let (_dir, store) = create_test_store();
        let txn = store.begin_read().unwrap();
        assert_eq!(store.stats().unwrap().active_readers, 1);
        drop(txn);
        assert_eq!(store.stats().unwrap().active_readers, 0);
    }
}
