//! # Store Builder
//!
//! `StoreBuilder` configures and opens a [`TreeStore`](super::TreeStore).
//! Unset options fall back to [`StoreConfig::default`].
//!
//! ## Configuration Options
//!
//! | Option            | Default    | Description                                   |
//! |-------------------|------------|-----------------------------------------------|
//! | create_if_missing | true       | Create and initialise the file when absent    |
//! | sync_on_commit    | true       | msync data pages and meta page on every commit|
//! | max_pages         | 4_194_304  | File size ceiling in pages (16 GiB)           |
//! | initial_pages     | 1          | Pages preallocated when the file is created   |
//!
//! ## Usage
//!
//! ```ignore
//! let store = TreeStore::builder()
//!     .path("./policies.db")
//!     .sync_on_commit(false)
//!     .max_pages(1 << 16)
//!     .open()?;
//! ```

use std::path::{Path, PathBuf};

use eyre::Result;

use super::TreeStore;
use crate::config::{DEFAULT_INITIAL_PAGES, DEFAULT_MAX_PAGES};

/// Resolved runtime options of an open store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub create_if_missing: bool,
    pub sync_on_commit: bool,
    pub max_pages: u64,
    pub initial_pages: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            max_pages: DEFAULT_MAX_PAGES,
            initial_pages: DEFAULT_INITIAL_PAGES,
        }
    }
}

#[derive(Debug, Default)]
pub struct StoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: Option<bool>,
    sync_on_commit: Option<bool>,
    max_pages: Option<u64>,
    initial_pages: Option<u64>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the store file. Required.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = Some(create);
        self
    }

    /// Disabling sync keeps commits atomic with respect to other threads but
    /// lets the OS decide when pages reach disk.
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = Some(sync);
        self
    }

    /// Upper bound on the file size in pages; growth past it fails with
    /// `TreeStoreError::Capacity`.
    pub fn max_pages(mut self, pages: u64) -> Self {
        self.max_pages = Some(pages);
        self
    }

    pub fn initial_pages(mut self, pages: u64) -> Self {
        self.initial_pages = Some(pages);
        self
    }

    pub fn config(&self) -> StoreConfig {
        let defaults = StoreConfig::default();
        StoreConfig {
            create_if_missing: self.create_if_missing.unwrap_or(defaults.create_if_missing),
            sync_on_commit: self.sync_on_commit.unwrap_or(defaults.sync_on_commit),
            max_pages: self.max_pages.unwrap_or(defaults.max_pages),
            initial_pages: self.initial_pages.unwrap_or(defaults.initial_pages),
        }
    }

    pub fn open(self) -> Result<TreeStore> {
        let config = self.config();
        let path = self
            .path
            .ok_or_else(|| eyre::eyre!("store path not specified: call .path() first"))?;
        TreeStore::open_with_config(&path, config)
    }
}
