//! # Transactions
//!
//! ```text
//!            begin_read()                       begin_write()
//!                │                                    │
//!   claim reader slot, capture root        lock writer mutex, capture root
//!                │                         and the free-list reuse limit
//!                v                                    v
//!            ReadTxn ──── drop ──> slot freed     WriteTxn
//!                                                    │
//!                                 ┌──────────────────┼──────────────────┐
//!                                 v                  v                  v
//!                              commit()          rollback()            drop
//!                   write pages, meta, publish   discard buffers   discard buffers
//! ```
//!
//! Both transaction kinds implement [`KvRead`]; a write transaction reads its
//! own uncommitted pages. Nothing reaches the file before `commit`, so rolling
//! back is just dropping the page buffers and releasing the writer lock.
//!
//! A write that fails partway (page ceiling, I/O, corruption) may leave the
//! in-memory tree half-modified, so it marks the transaction failed and
//! `commit` refuses it. Rejected input (empty or oversized key or value) is
//! checked before any page changes and leaves the transaction usable.

use eyre::{bail, Result};
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use super::database::StoreShared;
use crate::btree::{BTree, PageReader, RangeScan, ScanEnd, TreeStats};
use crate::config::MAX_KEY_SIZE;
use crate::error::TreeStoreError;
use crate::mvcc::{ReaderSlot, Snapshot};
use crate::storage::{AllocStats, PageAllocator};

/// Streaming scan over a transaction's tree.
pub type KvIter<'a> = RangeScan<'a, dyn PageReader + 'a>;

/// Smallest key greater than every key starting with `prefix`.
fn prefix_upper(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    upper.resize(MAX_KEY_SIZE + 1, 0xFF);
    upper
}

/// Read access shared by read and write transactions.
pub trait KvRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ascending from the first key `>= start`.
    fn scan(&self, start: &[u8], end: ScanEnd) -> Result<KvIter<'_>>;

    /// Descending from the last key `<= from`.
    fn scan_rev(&self, from: &[u8], end: ScanEnd) -> Result<KvIter<'_>>;

    /// `start <= key <= end`, ascending.
    fn range(&self, start: &[u8], end: &[u8]) -> Result<KvIter<'_>> {
        self.scan(start, ScanEnd::Inclusive(end.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        self.scan(prefix, ScanEnd::Prefix(prefix.to_vec()))
    }

    fn scan_prefix_rev(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        self.scan_rev(&prefix_upper(prefix), ScanEnd::Prefix(prefix.to_vec()))
    }
}

pub struct ReadTxn<'db> {
    shared: &'db StoreShared,
    slot: ReaderSlot<'db>,
    tree: BTree,
}

impl<'db> ReadTxn<'db> {
    pub(crate) fn new(shared: &'db StoreShared, slot: ReaderSlot<'db>) -> Self {
        let tree = BTree::new(slot.snapshot().root());
        Self { shared, slot, tree }
    }

    /// Commit version this snapshot observes.
    pub fn version(&self) -> u64 {
        self.slot.snapshot().version
    }

    pub fn root(&self) -> u64 {
        self.tree.root()
    }

    /// Verifies the structural invariants of the snapshot's tree.
    pub fn check(&self) -> Result<TreeStats> {
        self.tree.check(&self.shared.pager)
    }

    fn pages(&self) -> &'db dyn PageReader {
        &self.shared.pager
    }
}

impl KvRead for ReadTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(&self.shared.pager, key)
    }

    fn scan(&self, start: &[u8], end: ScanEnd) -> Result<KvIter<'_>> {
        self.tree.scan(self.pages(), start, end)
    }

    fn scan_rev(&self, from: &[u8], end: ScanEnd) -> Result<KvIter<'_>> {
        self.tree.scan_rev(self.pages(), from, end)
    }
}

/// The single write transaction. Dropping it without `commit` rolls back.
pub struct WriteTxn<'db> {
    shared: &'db StoreShared,
    _writer: MutexGuard<'db, ()>,
    alloc: PageAllocator<'db>,
    tree: BTree,
    snapshot: Snapshot,
    failed: Option<String>,
}

/// Input errors raised before the tree is touched.
fn is_rejected_input(err: &eyre::Report) -> bool {
    matches!(
        err.downcast_ref::<TreeStoreError>(),
        Some(
            TreeStoreError::EmptyKey
                | TreeStoreError::KeyTooLarge { .. }
                | TreeStoreError::ValueTooLarge { .. }
        )
    )
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(
        shared: &'db StoreShared,
        writer: MutexGuard<'db, ()>,
        snapshot: Snapshot,
        reuse_limit: u64,
    ) -> Self {
        let alloc = PageAllocator::new(
            &shared.pager,
            snapshot.meta,
            reuse_limit,
            shared.config.max_pages,
        );
        Self {
            shared,
            _writer: writer,
            alloc,
            tree: BTree::new(snapshot.root()),
            snapshot,
            failed: None,
        }
    }

    /// Version this transaction started from.
    pub fn base_version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn root(&self) -> u64 {
        self.tree.root()
    }

    pub fn alloc_stats(&self) -> AllocStats {
        self.alloc.stats()
    }

    /// Verifies the structural invariants of the uncommitted tree.
    pub fn check(&self) -> Result<TreeStats> {
        self.tree.check(&self.alloc)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.tree.insert(&mut self.alloc, key, value);
        self.track(result)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let result = self.tree.delete(&mut self.alloc, key);
        self.track(result)
    }

    /// True once a write failed partway; `commit` will refuse.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if self.failed.is_none() && !is_rejected_input(e) {
                warn!(error = %e, "write failed, transaction can only roll back");
                self.failed = Some(e.to_string());
            }
        }
        result
    }

    /// Makes the changes durable and visible; returns the new version.
    pub fn commit(self) -> Result<u64> {
        let Self {
            shared,
            _writer: writer,
            alloc,
            tree,
            snapshot,
            failed,
        } = self;

        if let Some(cause) = failed {
            debug!(base_version = snapshot.version, "failed transaction rolled back");
            bail!(TreeStoreError::Conflict(format!(
                "transaction cannot commit after a failed write: {}",
                cause
            )));
        }

        let (plan, free, stats) = alloc.finish(tree.root())?;
        if plan.dirty.is_empty() && plan.meta == snapshot.meta {
            return Ok(snapshot.version);
        }

        let meta = plan.meta;
        if let Err(e) = shared.pager.commit(plan, shared.config.sync_on_commit) {
            warn!(error = %e, root = meta.root(), "commit failed");
            return Err(e);
        }
        let version = shared.txns.publish(meta);
        drop(writer);

        debug!(
            version,
            root = meta.root(),
            pages = meta.page_count(),
            allocated = stats.allocated,
            freed = stats.freed,
            reused = stats.reused,
            free_list = free.len(),
            "transaction committed"
        );
        Ok(version)
    }

    /// Discards every change made by this transaction.
    pub fn rollback(self) {
        debug!(
            base_version = self.snapshot.version,
            allocated = self.alloc.stats().allocated,
            "transaction rolled back"
        );
    }
}

impl KvRead for WriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(&self.alloc, key)
    }

    fn scan(&self, start: &[u8], end: ScanEnd) -> Result<KvIter<'_>> {
        let pages: &dyn PageReader = &self.alloc;
        self.tree.scan(pages, start, end)
    }

    fn scan_rev(&self, from: &[u8], end: ScanEnd) -> Result<KvIter<'_>> {
        let pages: &dyn PageReader = &self.alloc;
        self.tree.scan_rev(pages, from, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_upper_sorts_after_every_extension() {
        let upper = prefix_upper(b"ab");
        assert!(upper.as_slice() > b"ab".as_slice());
        let mut longest = b"ab".to_vec();
        longest.resize(MAX_KEY_SIZE, 0xFF);
        assert!(upper > longest);
        assert!(upper.as_slice() < b"ac".as_slice());
    }
}
