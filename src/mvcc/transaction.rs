//! # Snapshot Registry
//!
//! `TransactionManager` publishes the committed tree root and tracks which
//! versions are still being read.
//!
//! ## Memory Layout
//!
//! ```text
//! TransactionManager {
//!     reader_slots: [AtomicU64; 64],   // 0 = empty, else version + 1
//!     state: Mutex<CommitState>,       // root, version, meta, fences
//! }
//! ```
//!
//! ## Fences
//!
//! Every commit at version `G` records the free-list tail sequence it left
//! behind. Ids pushed by that commit were released from version `G - 1`, so
//! they may be reused once no reader holds a version below `G`:
//!
//! ```text
//! fences: (G=5, tail=120) (G=6, tail=131) (G=7, tail=140)
//! oldest reader: version 6
//!   -> fences 5 and 6 are passed, reuse limit = 131
//! ```
//!
//! Readers always start on the newest version, so once a fence is passed it
//! stays passed and can be folded into `reuse_base`.
//!
//! ## Slot Claiming
//!
//! A reader claims its slot under the state mutex, in the same critical
//! section that reads the published root. A writer computing the reuse limit
//! takes the same mutex, so it can never miss a reader that already holds a
//! root.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, Result};
use parking_lot::Mutex;
use tracing::trace;

use crate::config::MAX_CONCURRENT_READERS;
use crate::storage::MetaPage;

/// The committed state a transaction starts from.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub version: u64,
    pub meta: MetaPage,
}

impl Snapshot {
    pub fn root(&self) -> u64 {
        self.meta.root()
    }
}

#[derive(Debug, Clone, Copy)]
struct Fence {
    version: u64,
    tail_seq: u64,
}

#[derive(Debug)]
struct CommitState {
    version: u64,
    meta: MetaPage,
    reuse_base: u64,
    fences: VecDeque<Fence>,
}

pub struct TransactionManager {
    reader_slots: [AtomicU64; MAX_CONCURRENT_READERS],
    state: Mutex<CommitState>,
}

impl TransactionManager {
    /// Everything on the free list at open time is reusable: no reader from
    /// a previous process can still hold a page.
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new(meta: MetaPage) -> Self {
        const EMPTY: AtomicU64 = AtomicU64::new(0);
        Self {
            #[allow(clippy::borrow_interior_mutable_const)]
            reader_slots: [EMPTY; MAX_CONCURRENT_READERS],
            state: Mutex::new(CommitState {
                version: 0,
                meta,
                reuse_base: meta.free_tail_seq(),
                fences: VecDeque::new(),
            }),
        }
    }

    pub fn begin_read(&self) -> Result<ReaderSlot<'_>> {
        let state = self.state.lock();
        for (idx, slot) in self.reader_slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(state.version + 1, Ordering::SeqCst);
                return Ok(ReaderSlot {
                    manager: self,
                    slot_idx: idx,
                    snapshot: Snapshot {
                        version: state.version,
                        meta: state.meta,
                    },
                });
            }
        }
        bail!(
            "too many concurrent readers (max {})",
            MAX_CONCURRENT_READERS
        )
    }

    fn release_reader(&self, slot_idx: usize) {
        self.reader_slots[slot_idx].store(0, Ordering::SeqCst);
    }

    fn oldest_reader_locked(&self) -> Option<u64> {
        self.reader_slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|&v| v != 0)
            .min()
            .map(|v| v - 1)
    }

    /// Oldest version held by an active reader.
    pub fn oldest_reader(&self) -> Option<u64> {
        let _state = self.state.lock();
        self.oldest_reader_locked()
    }

    pub fn active_readers(&self) -> usize {
        self.reader_slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Snapshot for a new writer plus the free-list sequence below which ids
    /// are safe to reuse. Callers must hold the writer lock.
    pub fn begin_write(&self) -> (Snapshot, u64) {
        let mut state = self.state.lock();
        let oldest = self.oldest_reader_locked();
        while let Some(fence) = state.fences.front().copied() {
            if oldest.is_some_and(|v| fence.version > v) {
                break;
            }
            state.reuse_base = fence.tail_seq;
            state.fences.pop_front();
        }
        trace!(
            version = state.version,
            oldest_reader = ?oldest,
            reuse_limit = state.reuse_base,
            pending_fences = state.fences.len(),
            "writer snapshot"
        );
        (
            Snapshot {
                version: state.version,
                meta: state.meta,
            },
            state.reuse_base,
        )
    }

    /// Makes a written commit visible to new readers and returns its version.
    pub fn publish(&self, meta: MetaPage) -> u64 {
        let mut state = self.state.lock();
        state.version += 1;
        state.meta = meta;
        let fence = Fence {
            version: state.version,
            tail_seq: meta.free_tail_seq(),
        };
        state.fences.push_back(fence);
        state.version
    }

    pub fn current(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            version: state.version,
            meta: state.meta,
        }
    }
}

/// A claimed reader slot; released on drop.
pub struct ReaderSlot<'a> {
    manager: &'a TransactionManager,
    slot_idx: usize,
    snapshot: Snapshot,
}

impl ReaderSlot<'_> {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for ReaderSlot<'_> {
    fn drop(&mut self) {
        self.manager.release_reader(self.slot_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(root: u64, tail_seq: u64) -> MetaPage {
        let mut meta = MetaPage::new(10);
        meta.set_root(root);
        meta.set_free_tail_seq(tail_seq);
        meta
    }

    #[test]
    fn reader_sees_root_published_before_it_began() {
        let mgr = TransactionManager::new(meta_with(0, 0));
        mgr.publish(meta_with(3, 0));

        let reader = mgr.begin_read().unwrap();
        mgr.publish(meta_with(7, 0));

        assert_eq!(reader.snapshot().root(), 3);
        assert_eq!(reader.snapshot().version, 1);
        assert_eq!(mgr.current().root(), 7);
    }

    #[test]
    fn dropping_reader_frees_its_slot() {
        let mgr = TransactionManager::new(meta_with(0, 0));
        {
            let _a = mgr.begin_read().unwrap();
            let _b = mgr.begin_read().unwrap();
            assert_eq!(mgr.active_readers(), 2);
        }
        assert_eq!(mgr.active_readers(), 0);
    }

    #[test]
    fn slot_exhaustion_is_an_error() {
        let mgr = TransactionManager::new(meta_with(0, 0));
        let held: Vec<_> = (0..MAX_CONCURRENT_READERS)
            .map(|_| mgr.begin_read().unwrap())
            .collect();
        assert!(mgr.begin_read().is_err());
        drop(held);
        assert!(mgr.begin_read().is_ok());
    }

    #[test]
    fn reuse_limit_waits_for_old_readers() {
        let mgr = TransactionManager::new(meta_with(0, 4));
        assert_eq!(mgr.begin_write().1, 4);

        let old_reader = mgr.begin_read().unwrap();
        mgr.publish(meta_with(1, 10));
        mgr.publish(meta_with(2, 20));

        assert_eq!(mgr.begin_write().1, 4);

        let newer_reader = mgr.begin_read().unwrap();
        drop(old_reader);
        assert_eq!(mgr.oldest_reader(), Some(2));
        assert_eq!(mgr.begin_write().1, 20);

        drop(newer_reader);
        mgr.publish(meta_with(3, 25));
        assert_eq!(mgr.begin_write().1, 25);
    }
}
