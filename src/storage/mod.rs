//! # Storage Layer
//!
//! A store is one file of fixed-size pages:
//!
//! ```text
//! Offset 0:         page 0   meta record (root, page count, free list)
//! Offset 4096:      page 1   tree node or free-list page
//! Offset 8192:      page 2   ...
//! ```
//!
//! ## Module Organization
//!
//! - `mmap`: memory-mapped file with bounds-checked page access
//! - `meta`: zerocopy layout of page 0
//! - `freelist`: queue of released page ids stored in list pages
//! - `pager`: shared reader access and the ordered commit write
//! - `allocator`: per-write-transaction page buffer and id allocation
//!
//! ## Thread Safety
//!
//! `MmapStorage` is not shared directly; the `Pager` wraps it in a
//! `parking_lot::RwLock`. Readers copy pages out under the shared lock, so a
//! remap during commit never invalidates a slice a reader is holding.

mod allocator;
mod freelist;
mod meta;
mod mmap;
mod pager;

pub use allocator::{AllocStats, PageAllocator};
pub use freelist::{FreeList, FreeListPages};
pub use meta::MetaPage;
pub use mmap::MmapStorage;
pub use pager::{CommitPlan, Pager};
