//! # Pager
//!
//! Owns the mapped file. Readers copy pages out under a shared lock; a commit
//! takes the exclusive lock to grow the file, write the dirty pages and then
//! the meta page.
//!
//! ## Commit Order
//!
//! ```text
//! 1. grow file to the new page count
//! 2. write every dirty page
//! 3. sync                      (data reaches disk first)
//! 4. write meta page 0
//! 5. sync                      (commit point)
//! ```
//!
//! A crash before step 5 leaves the previous meta page in place, and every
//! page it references is untouched because committed pages are never
//! rewritten.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info};
use zerocopy::IntoBytes;

use super::meta::MetaPage;
use super::mmap::MmapStorage;
use crate::btree::{Node, PageReader};
use crate::config::{META_PAGE_ID, META_SIZE, PAGE_SIZE};
use crate::error::TreeStoreError;

/// Everything a write transaction hands to the pager at commit.
#[derive(Debug)]
pub struct CommitPlan {
    pub dirty: HashMap<u64, Vec<u8>>,
    pub meta: MetaPage,
}

#[derive(Debug)]
pub struct Pager {
    path: PathBuf,
    storage: RwLock<MmapStorage>,
}

impl Pager {
    /// Opens `path`, creating and initialising it when `create` allows.
    /// Returns the pager and the committed meta record.
    pub fn open(path: &Path, create: bool, initial_pages: u64) -> Result<(Self, MetaPage)> {
        let exists = path.exists();
        ensure!(
            exists || create,
            "store file '{}' does not exist",
            path.display()
        );

        let (storage, meta) = if exists && file_len(path)? > 0 {
            let storage = MmapStorage::open(path)?;
            let meta = MetaPage::from_bytes(storage.page(META_PAGE_ID)?)
                .wrap_err_with(|| format!("invalid meta page in '{}'", path.display()))?;
            ensure!(
                meta.page_count() <= storage.page_count(),
                TreeStoreError::corruption(format!(
                    "meta page records {} pages but the file holds {}",
                    meta.page_count(),
                    storage.page_count()
                ))
            );
            info!(
                path = %path.display(),
                root = meta.root(),
                pages = meta.page_count(),
                "opened store"
            );
            (storage, meta)
        } else {
            let mut storage = MmapStorage::create(path, initial_pages.max(1))?;
            let meta = MetaPage::new(1);
            storage.page_mut(META_PAGE_ID)?[..META_SIZE].copy_from_slice(meta.as_bytes());
            storage.sync()?;
            info!(path = %path.display(), "created store");
            (storage, meta)
        };

        Ok((
            Self {
                path: path.to_path_buf(),
                storage: RwLock::new(storage),
            },
            meta,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&self, id: u64) -> Result<Vec<u8>> {
        ensure!(
            id != META_PAGE_ID,
            TreeStoreError::corruption("page 0 referenced as a data page")
        );
        let storage = self.storage.read();
        Ok(storage.page(id)?.to_vec())
    }

    pub fn file_pages(&self) -> u64 {
        self.storage.read().page_count()
    }

    pub fn commit(&self, plan: CommitPlan, sync: bool) -> Result<()> {
        let page_count = plan.meta.page_count();
        let mut storage = self.storage.write();

        storage.grow(page_count)?;
        for (&id, data) in &plan.dirty {
            ensure!(
                id != META_PAGE_ID && id < page_count,
                "dirty page {} outside 1..{}",
                id,
                page_count
            );
            ensure!(data.len() == PAGE_SIZE, "dirty page {} has {} bytes", id, data.len());
            storage.page_mut(id)?.copy_from_slice(data);
        }
        if sync {
            storage.sync()?;
        }

        storage.page_mut(META_PAGE_ID)?[..META_SIZE].copy_from_slice(plan.meta.as_bytes());
        if sync {
            storage.sync()?;
        }

        debug!(
            pages_written = plan.dirty.len(),
            root = plan.meta.root(),
            page_count,
            "commit written"
        );
        Ok(())
    }

    /// Flushes the mapping regardless of the per-commit sync setting.
    pub fn sync(&self) -> Result<()> {
        self.storage.read().sync()
    }
}

impl PageReader for Pager {
    fn read_node(&self, ptr: u64) -> Result<Node> {
        Node::from_page(self.read_page(ptr)?)
            .wrap_err_with(|| format!("failed to decode page {}", ptr))
    }
}

fn file_len(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)
        .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
        .len())
}
