//! # Write-Transaction Page Allocator
//!
//! A `PageAllocator` lives for one write transaction. It buffers every page
//! the transaction produces and decides which page id each new node gets.
//!
//! ## Allocation Order
//!
//! ```text
//! alloc_node(node)
//!   1. recycled   ids allocated and freed again inside this transaction
//!   2. free list  ids freed by earlier commits, gated by max_seq
//!   3. append     next id past the end of the file, bounded by max_pages
//! ```
//!
//! Freeing an id allocated by this same transaction puts it straight back on
//! the recycled stack: no snapshot can see it. Any other id is pushed on the
//! free list tail and becomes reusable once every reader that could still
//! reach it has finished.
//!
//! Nothing touches the file until [`PageAllocator::finish`] turns the buffers
//! into a [`CommitPlan`]; dropping the allocator discards the transaction.

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use tracing::trace;

use super::freelist::{FreeList, FreeListPages};
use super::meta::MetaPage;
use super::pager::{CommitPlan, Pager};
use crate::btree::{Node, PageReader, PageStore};
use crate::config::META_PAGE_ID;
use crate::error::TreeStoreError;

/// Counters reported with each commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocated: u64,
    pub freed: u64,
    pub reused: u64,
    pub appended: u64,
}

pub struct PageAllocator<'a> {
    pager: &'a Pager,
    base: MetaPage,
    free: FreeList,
    page_count: u64,
    max_pages: u64,
    dirty: HashMap<u64, Vec<u8>>,
    fresh: HashSet<u64>,
    recycled: Vec<u64>,
    stats: AllocStats,
}

impl<'a> PageAllocator<'a> {
    /// Starts from the committed `meta`; free-list ids at or past `max_seq`
    /// are not handed out.
    pub fn new(pager: &'a Pager, meta: MetaPage, max_seq: u64, max_pages: u64) -> Self {
        let mut free = meta.free_list();
        free.max_seq = max_seq.min(free.tail_seq);
        Self {
            pager,
            base: meta,
            free,
            page_count: meta.page_count(),
            max_pages,
            dirty: HashMap::new(),
            fresh: HashSet::new(),
            recycled: Vec::new(),
            stats: AllocStats::default(),
        }
    }

    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    fn append_id(&mut self) -> Result<u64> {
        ensure!(
            self.page_count < self.max_pages,
            TreeStoreError::Capacity(format!(
                "store is limited to {} pages",
                self.max_pages
            ))
        );
        let id = self.page_count;
        self.page_count += 1;
        self.stats.appended += 1;
        Ok(id)
    }

    fn pop_free(&mut self) -> Result<Option<u64>> {
        let mut free = self.free;
        let popped = free.pop_head(self)?;
        self.free = free;
        Ok(popped)
    }

    fn push_free(&mut self, id: u64) -> Result<()> {
        let mut free = self.free;
        free.push_tail(self, id)?;
        self.free = free;
        Ok(())
    }

    fn check_id(&self, id: u64) -> Result<()> {
        ensure!(
            id != META_PAGE_ID && id < self.page_count,
            TreeStoreError::corruption(format!(
                "page id {} outside 1..{}",
                id, self.page_count
            ))
        );
        Ok(())
    }

    /// Returns leftover recycled ids to the free list and produces the
    /// pages and meta record to write for a commit with `root`.
    pub fn finish(mut self, root: u64) -> Result<(CommitPlan, FreeList, AllocStats)> {
        while let Some(id) = self.recycled.pop() {
            self.push_free(id)?;
        }

        let mut meta = self.base;
        meta.set_root(root);
        meta.set_page_count(self.page_count);
        meta.set_free_list(&self.free);

        trace!(
            root,
            dirty = self.dirty.len(),
            free_len = self.free.len(),
            "allocator finished"
        );
        let plan = CommitPlan {
            dirty: self.dirty,
            meta,
        };
        Ok((plan, self.free, self.stats))
    }
}

impl PageReader for PageAllocator<'_> {
    fn read_node(&self, ptr: u64) -> Result<Node> {
        match self.dirty.get(&ptr) {
            Some(page) => Node::from_page(page.clone()),
            None => self.pager.read_node(ptr),
        }
    }
}

impl PageStore for PageAllocator<'_> {
    fn alloc_node(&mut self, node: Node) -> Result<u64> {
        let page = node.into_page()?;
        let id = match self.recycled.pop() {
            Some(id) => id,
            None => match self.pop_free()? {
                Some(id) => {
                    self.check_id(id)?;
                    self.stats.reused += 1;
                    id
                }
                None => self.append_id()?,
            },
        };
        self.fresh.insert(id);
        self.dirty.insert(id, page);
        self.stats.allocated += 1;
        Ok(id)
    }

    fn free_page(&mut self, ptr: u64) -> Result<()> {
        self.check_id(ptr)?;
        self.stats.freed += 1;
        if self.fresh.remove(&ptr) {
            self.dirty.remove(&ptr);
            self.recycled.push(ptr);
            Ok(())
        } else {
            self.push_free(ptr)
        }
    }
}

impl FreeListPages for PageAllocator<'_> {
    fn read_list_page(&self, id: u64) -> Result<Vec<u8>> {
        match self.dirty.get(&id) {
            Some(page) => Ok(page.clone()),
            None => self.pager.read_page(id),
        }
    }

    fn write_list_page(&mut self, id: u64, page: Vec<u8>) -> Result<()> {
        self.dirty.insert(id, page);
        Ok(())
    }

    fn append_list_page(&mut self, page: Vec<u8>) -> Result<u64> {
        let id = self.append_id()?;
        self.dirty.insert(id, page);
        Ok(id)
    }
}
