//! # Meta Page
//!
//! Page 0 holds a single fixed-layout record describing the committed state
//! of the store. Writing it is the commit point: every page it references is
//! synced before the meta page is overwritten.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       16    signature "TreeStore01" padded with zeros
//! 16      8     root page id (0 = empty tree)
//! 24      8     page count (file length in pages)
//! 32      8     free list head page
//! 40      8     free list head sequence
//! 48      8     free list tail page
//! 56      8     free list tail sequence
//! 64      8     free list max sequence
//! ```
//!
//! All integers are little-endian.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::freelist::FreeList;
use crate::config::{META_SIGNATURE, META_SIZE};
use crate::error::TreeStoreError;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaPage {
    signature: [u8; 16],
    root: U64,
    page_count: U64,
    free_head_page: U64,
    free_head_seq: U64,
    free_tail_page: U64,
    free_tail_seq: U64,
    free_max_seq: U64,
}

const _: () = assert!(std::mem::size_of::<MetaPage>() == META_SIZE);

impl MetaPage {
    /// Meta record of a freshly created file: empty tree, empty free list.
    pub fn new(page_count: u64) -> Self {
        Self {
            signature: *META_SIGNATURE,
            root: U64::new(0),
            page_count: U64::new(page_count),
            free_head_page: U64::new(0),
            free_head_seq: U64::new(0),
            free_tail_page: U64::new(0),
            free_tail_seq: U64::new(0),
            free_max_seq: U64::new(0),
        }
    }

    /// Parses and validates the record at the start of page 0.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= META_SIZE,
            "buffer too small for MetaPage: {} < {}",
            bytes.len(),
            META_SIZE
        );

        let meta = Self::read_from_bytes(&bytes[..META_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MetaPage: {:?}", e))?;

        ensure!(
            &meta.signature == META_SIGNATURE,
            TreeStoreError::corruption("meta page signature mismatch")
        );
        ensure!(
            meta.page_count() >= 1,
            TreeStoreError::corruption("meta page records zero pages")
        );
        for (name, id) in [
            ("root", meta.root()),
            ("free list head", meta.free_head_page()),
            ("free list tail", meta.free_tail_page()),
        ] {
            ensure!(
                id < meta.page_count(),
                TreeStoreError::corruption(format!(
                    "{} page {} is past the end of the file ({} pages)",
                    name,
                    id,
                    meta.page_count()
                ))
            );
        }
        ensure!(
            meta.free_head_seq() <= meta.free_tail_seq(),
            TreeStoreError::corruption(format!(
                "free list head sequence {} is ahead of tail sequence {}",
                meta.free_head_seq(),
                meta.free_tail_seq()
            ))
        );

        Ok(meta)
    }

    zerocopy_accessors! {
        root: u64,
        page_count: u64,
        free_head_page: u64,
        free_head_seq: u64,
        free_tail_page: u64,
        free_tail_seq: u64,
        free_max_seq: u64,
    }

    pub fn free_list(&self) -> FreeList {
        FreeList {
            head_page: self.free_head_page(),
            head_seq: self.free_head_seq(),
            tail_page: self.free_tail_page(),
            tail_seq: self.free_tail_seq(),
            max_seq: self.free_max_seq(),
        }
    }

    pub fn set_free_list(&mut self, list: &FreeList) {
        self.set_free_head_page(list.head_page);
        self.set_free_head_seq(list.head_seq);
        self.set_free_tail_page(list.tail_page);
        self.set_free_tail_seq(list.tail_seq);
        self.set_free_max_seq(list.max_seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn fresh_meta_round_trips_through_page() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut meta = MetaPage::new(9);
        meta.set_root(4);
        meta.set_free_list(&FreeList {
            head_page: 2,
            head_seq: 3,
            tail_page: 5,
            tail_seq: 700,
            max_seq: 650,
        });
        page[..META_SIZE].copy_from_slice(meta.as_bytes());

        let parsed = MetaPage::from_bytes(&page).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.free_list().tail_seq, 700);
        assert_eq!(&page[..11], b"TreeStore01");
    }

    #[test]
    fn rejects_wrong_signature() {
        let page = vec![0u8; PAGE_SIZE];
        let err = MetaPage::from_bytes(&page).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::Corruption(_))
        ));
    }

    #[test]
    fn rejects_root_past_end_of_file() {
        let mut meta = MetaPage::new(3);
        meta.set_root(3);
        let err = MetaPage::from_bytes(meta.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("past the end of the file"));
    }
}
