//! # Copy-on-Write B+Tree
//!
//! The tree is identified only by the page id of its root. No node objects
//! outlive an operation: every call reads pages through a [`PageReader`],
//! builds replacement nodes in memory and hands them to a [`PageStore`] for
//! allocation. A page is never modified after it has been allocated, so a
//! reader holding an old root keeps seeing a consistent tree while a writer
//! builds the next one.
//!
//! ## Node Invariants
//!
//! - Every page-resident node encodes to at most `PAGE_SIZE` bytes.
//! - Keys inside a node are strictly increasing.
//! - The first key of a node is `<=` every key in its subtree; internal
//!   nodes route a key to the child with the last separator `<=` the key.
//! - The leftmost leaf starts with the empty key. It is inserted with the
//!   first entry of an empty tree and guarantees every lookup finds a slot.
//!   The empty key is rejected as a user key and hidden from scans.
//!
//! ## Write Path
//!
//! ```text
//! insert(key, value)
//!   ├─ descend: lookup_le at each internal node
//!   ├─ leaf: build replacement (update or insert), may reach 2 pages
//!   ├─ unwind: split child into 1..=3 pieces, rebuild parent with new ptrs
//!   └─ root: split into a taller root when it produced >1 piece
//! ```
//!
//! Deletes unwind the same way, merging a child that shrank under a quarter
//! page into its left (preferred) or right sibling when the result fits one
//! page, and collapsing an internal root left with a single child.
//!
//! ## Module Organization
//!
//! - [`node`]: page codec and typed node view
//! - `tree`: get / insert / delete / integrity check
//! - `iter`: cursor and range scans

pub mod node;

mod iter;
mod tree;

use eyre::Result;

pub use iter::{RangeScan, ScanEnd, TreeCursor};
pub use node::{Node, NodeKind};
pub use tree::{BTree, TreeStats};

/// Read access to pages by id.
pub trait PageReader {
    fn read_node(&self, ptr: u64) -> Result<Node>;
}

/// Page allocation interface driven by tree mutations.
///
/// `alloc_node` receives a node that fits one page and returns its new id;
/// `free_page` releases a page the tree no longer references. Implementations
/// decide when a freed id may be handed out again.
pub trait PageStore: PageReader {
    fn alloc_node(&mut self, node: Node) -> Result<u64>;
    fn free_page(&mut self, ptr: u64) -> Result<()>;
}

impl<T: PageReader + ?Sized> PageReader for &T {
    fn read_node(&self, ptr: u64) -> Result<Node> {
        (**self).read_node(ptr)
    }
}

impl<T: PageReader + ?Sized> PageReader for &mut T {
    fn read_node(&self, ptr: u64) -> Result<Node> {
        (**self).read_node(ptr)
    }
}
