//! # Memory-Mapped Page File
//!
//! `MmapStorage` maps the whole store file and exposes it as an array of
//! `PAGE_SIZE` pages addressed by `u64` id. Page `n` lives at byte offset
//! `n * PAGE_SIZE`; the file length is always a whole number of pages.
//!
//! ## Remapping
//!
//! `grow()` extends the file and replaces the mapping. It takes `&mut self`,
//! so the borrow checker rules out any page slice surviving a remap:
//!
//! ```text
//! page(&self) -> &[u8]               // shared borrow
//! page_mut(&mut self) -> &mut [u8]   // exclusive borrow
//! grow(&mut self)                    // exclusive borrow
//! ```
//!
//! Concurrent access is arbitrated one level up by the pager's `RwLock`.
//!
//! ## Durability
//!
//! `sync()` flushes the mapping (`msync` on Unix, `FlushViewOfFile` on
//! Windows). The commit path calls it once for data pages and once more after
//! the meta page is written.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_count: u64,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty store file '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "store file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        // SAFETY: the mapping is only sound while no other process truncates
        // or rewrites the file. The store owns its file exclusively, the map
        // lives exactly as long as `self`, and every access goes through
        // page()/page_mut() which bounds-check the page id.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: file_size / PAGE_SIZE as u64,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_pages: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_pages > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        let file_size = initial_pages * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: the file was just created and truncated by this process and
        // sized to a whole number of pages; see `open` for the access rules.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_pages,
        })
    }

    fn byte_range(&self, id: u64) -> Result<std::ops::Range<usize>> {
        ensure!(
            id < self.page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.page_count
        );
        let offset = id as usize * PAGE_SIZE;
        Ok(offset..offset + PAGE_SIZE)
    }

    pub fn page(&self, id: u64) -> Result<&[u8]> {
        let range = self.byte_range(id)?;
        Ok(&self.mmap[range])
    }

    pub fn page_mut(&mut self, id: u64) -> Result<&mut [u8]> {
        let range = self.byte_range(id)?;
        Ok(&mut self.mmap[range])
    }

    /// Extends the file to `new_page_count` pages; shrinking is a no-op.
    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_page_count * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: grow() holds `&mut self`, so no page slice borrowed from the
        // old mapping is alive. The old mapping was flushed above and is
        // dropped by the assignment; the file already has the new length.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };
        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sizes_file_in_pages() {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("t.db"), 4).unwrap();

        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.file_size(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn create_fails_with_zero_pages() {
        let dir = tempdir().unwrap();
        let err = MmapStorage::create(dir.path().join("t.db"), 0).unwrap_err();

        assert!(err.to_string().contains("initial page count must be at least 1"));
    }

    #[test]
    fn open_rejects_partial_page_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 7]).unwrap();

        let err = MmapStorage::open(&path).unwrap_err();
        assert!(err.to_string().contains("not a multiple of page size"));
    }

    #[test]
    fn open_fails_for_missing_file() {
        let dir = tempdir().unwrap();
        assert!(MmapStorage::open(dir.path().join("missing.db")).is_err());
    }

    #[test]
    fn writes_survive_sync_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let mut storage = MmapStorage::create(&path, 3).unwrap();
            storage.page_mut(2).unwrap()[PAGE_SIZE - 1] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 3);
        assert_eq!(storage.page(2).unwrap()[PAGE_SIZE - 1], 0xAB);
    }

    #[test]
    fn page_access_is_bounds_checked() {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("t.db"), 2).unwrap();

        assert!(storage.page(1).is_ok());
        assert!(storage.page(2).is_err());
        assert!(storage.page(u64::MAX / PAGE_SIZE as u64).is_err());
    }

    #[test]
    fn grow_preserves_data_and_ignores_shrink() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::create(dir.path().join("t.db"), 2).unwrap();
        storage.page_mut(1).unwrap()[0] = 0xCA;

        storage.grow(8).unwrap();
        storage.grow(3).unwrap();

        assert_eq!(storage.page_count(), 8);
        assert_eq!(storage.page(1).unwrap()[0], 0xCA);
        assert!(storage.page(7).unwrap().iter().all(|&b| b == 0));
    }
}
