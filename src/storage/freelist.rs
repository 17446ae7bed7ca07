//! # Free List
//!
//! Released page ids are queued in a singly linked chain of list pages.
//! Writers push at the tail and pop from the head, so a page id is handed out
//! again only after everything freed before it.
//!
//! ## List Page Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       8         next list page id (0 = none yet)
//! 8       8*N       page ids, N = FREE_LIST_CAPACITY
//! ```
//!
//! ## Sequence Numbers
//!
//! Every pushed id gets the next tail sequence number and sits in slot
//! `seq % FREE_LIST_CAPACITY` of its list page. The head sequence counts
//! popped ids. `max_seq` caps popping: ids with a sequence at or above it may
//! still be reachable from a tree some reader is traversing, so they stay
//! queued until the watermark passes them.
//!
//! ```text
//!  head_page                                  tail_page
//!  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//!  │ .. .. 17 42  │ -> │ 8 9 10 11 .. │ -> │ 51 52 __ __  │
//!  └──────────────┘    └──────────────┘    └──────────────┘
//!         ^ head_seq          ^ max_seq            ^ tail_seq
//! ```
//!
//! A list page whose slots have all been popped is itself pushed onto the
//! tail. New list pages are always appended at the end of the file, and list
//! pages are only written at slots past the committed tail, so a crash before
//! the meta page is rewritten leaves the committed list intact.

use eyre::{ensure, Result};

use crate::config::{FREE_LIST_CAPACITY, FREE_LIST_HEADER, PAGE_SIZE};
use crate::error::TreeStoreError;

/// Page access needed by the free list. List pages are read and written
/// whole; the implementation decides whether writes are buffered.
pub trait FreeListPages {
    fn read_list_page(&self, id: u64) -> Result<Vec<u8>>;
    fn write_list_page(&mut self, id: u64, page: Vec<u8>) -> Result<()>;
    /// Allocates a new page at the end of the file holding `page`.
    fn append_list_page(&mut self, page: Vec<u8>) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeList {
    pub head_page: u64,
    pub head_seq: u64,
    pub tail_page: u64,
    pub tail_seq: u64,
    pub max_seq: u64,
}

fn slot(seq: u64) -> usize {
    (seq % FREE_LIST_CAPACITY as u64) as usize
}

fn read_u64(page: &[u8], pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&page[pos..pos + 8]);
    u64::from_le_bytes(buf)
}

fn next_of(page: &[u8]) -> u64 {
    read_u64(page, 0)
}

fn set_next(page: &mut [u8], next: u64) {
    page[..8].copy_from_slice(&next.to_le_bytes());
}

fn id_at(page: &[u8], slot: usize) -> u64 {
    read_u64(page, FREE_LIST_HEADER + 8 * slot)
}

fn set_id_at(page: &mut [u8], slot: usize, id: u64) {
    let pos = FREE_LIST_HEADER + 8 * slot;
    page[pos..pos + 8].copy_from_slice(&id.to_le_bytes());
}

impl FreeList {
    /// Ids queued in total, reusable or not.
    pub fn len(&self) -> u64 {
        self.tail_seq - self.head_seq
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids that may be popped right now.
    pub fn reusable(&self) -> u64 {
        self.max_seq.min(self.tail_seq).saturating_sub(self.head_seq)
    }

    /// Pops the oldest reusable id, or `None` when the watermark blocks.
    pub fn pop_head<S: FreeListPages + ?Sized>(&mut self, pages: &mut S) -> Result<Option<u64>> {
        if self.head_page == 0 || self.head_seq >= self.max_seq || self.head_seq >= self.tail_seq
        {
            return Ok(None);
        }

        let page = pages.read_list_page(self.head_page)?;
        let id = id_at(&page, slot(self.head_seq));
        ensure!(
            id != 0,
            TreeStoreError::corruption(format!(
                "free list slot {} of page {} is empty",
                slot(self.head_seq),
                self.head_page
            ))
        );
        self.head_seq += 1;

        if slot(self.head_seq) == 0 {
            let exhausted = self.head_page;
            let next = next_of(&page);
            ensure!(
                next != 0,
                TreeStoreError::corruption(format!(
                    "free list page {} is full but has no successor",
                    exhausted
                ))
            );
            self.head_page = next;
            self.push_tail(pages, exhausted)?;
        }
        Ok(Some(id))
    }

    pub fn push_tail<S: FreeListPages + ?Sized>(&mut self, pages: &mut S, id: u64) -> Result<()> {
        ensure!(id != 0, "page 0 cannot be freed");

        if self.tail_page == 0 {
            let first = pages.append_list_page(vec![0u8; PAGE_SIZE])?;
            self.head_page = first;
            self.tail_page = first;
        }

        let mut page = pages.read_list_page(self.tail_page)?;
        set_id_at(&mut page, slot(self.tail_seq), id);
        self.tail_seq += 1;

        if slot(self.tail_seq) == 0 {
            let next = pages.append_list_page(vec![0u8; PAGE_SIZE])?;
            set_next(&mut page, next);
            pages.write_list_page(self.tail_page, page)?;
            self.tail_page = next;
        } else {
            pages.write_list_page(self.tail_page, page)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hashbrown::HashMap;

    #[derive(Default)]
    pub(crate) struct MemList {
        pages: HashMap<u64, Vec<u8>>,
        next: u64,
    }

    impl FreeListPages for MemList {
        fn read_list_page(&self, id: u64) -> Result<Vec<u8>> {
            self.pages
                .get(&id)
                .cloned()
                .ok_or_else(|| eyre::eyre!("list page {} missing", id))
        }

        fn write_list_page(&mut self, id: u64, page: Vec<u8>) -> Result<()> {
            self.pages.insert(id, page);
            Ok(())
        }

        fn append_list_page(&mut self, page: Vec<u8>) -> Result<u64> {
            self.next += 1;
            let id = 10_000 + self.next;
            self.pages.insert(id, page);
            Ok(id)
        }
    }

    #[test]
    fn pops_in_push_order() {
        let mut pages = MemList::default();
        let mut list = FreeList::default();

        for id in 1..=5 {
            list.push_tail(&mut pages, id).unwrap();
        }
        list.max_seq = list.tail_seq;

        let popped: Vec<_> = std::iter::from_fn(|| list.pop_head(&mut pages).unwrap()).collect();
        assert_eq!(popped, vec![1, 2, 3, 4, 5]);
        assert!(list.is_empty());
    }

    #[test]
    fn max_seq_blocks_recent_ids() {
        let mut pages = MemList::default();
        let mut list = FreeList::default();

        list.push_tail(&mut pages, 7).unwrap();
        list.max_seq = list.tail_seq;
        list.push_tail(&mut pages, 8).unwrap();

        assert_eq!(list.reusable(), 1);
        assert_eq!(list.pop_head(&mut pages).unwrap(), Some(7));
        assert_eq!(list.pop_head(&mut pages).unwrap(), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn spans_multiple_list_pages_and_recycles_exhausted_heads() {
        let mut pages = MemList::default();
        let mut list = FreeList::default();
        let total = FREE_LIST_CAPACITY as u64 * 2 + 10;

        for id in 1..=total {
            list.push_tail(&mut pages, id).unwrap();
        }
        let first_head = list.head_page;
        list.max_seq = list.tail_seq;

        for expected in 1..=FREE_LIST_CAPACITY as u64 {
            assert_eq!(list.pop_head(&mut pages).unwrap(), Some(expected));
        }
        assert_ne!(list.head_page, first_head);
        // The drained list page is queued behind everything else.
        assert_eq!(list.len(), total - FREE_LIST_CAPACITY as u64 + 1);

        list.max_seq = list.tail_seq;
        let rest: Vec<_> = std::iter::from_fn(|| list.pop_head(&mut pages).unwrap()).collect();
        assert_eq!(rest.last(), Some(&first_head));
        assert!(rest.contains(&total));
    }
}
