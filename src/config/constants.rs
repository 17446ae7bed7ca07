//! # TreeStore Configuration Constants
//!
//! This module centralizes the numeric layout and limit constants, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located and checked at compile time.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> NODE_HEADER_SIZE (4 bytes: kind u16 + nkeys u16)
//!       │
//!       ├─> MAX_KEY_SIZE (1000) + MAX_VALUE_SIZE (3000)
//!       │     A single maximal entry in a node with one key must fit one
//!       │     page, otherwise the three-way split cannot terminate.
//!       │
//!       ├─> SPLIT_FILL_TARGET (3/4 page)
//!       │
//!       ├─> MERGE_THRESHOLD (1/4 page)
//!       │
//!       ├─> WORKING_NODE_SIZE (2 pages)
//!       │     Upper bound for a node under construction before it is split.
//!       │
//!       └─> FREE_LIST_CAPACITY (derived: (PAGE_SIZE - 8) / 8)
//!
//! META_SIZE (72 bytes, page 0 only)
//!       │
//!       └─> must fit PAGE_SIZE
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{PAGE_SIZE, MAX_KEY_SIZE};
//! ```

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the persisted node format and must not change for an existing
// file.
// ============================================================================

/// Size of every page in bytes. Page `n` lives at file offset `n * PAGE_SIZE`.
pub const PAGE_SIZE: usize = 4096;

/// Node header: kind (u16 LE) followed by key count (u16 LE).
pub const NODE_HEADER_SIZE: usize = 4;

/// Child pointer width in internal nodes.
pub const POINTER_SIZE: usize = 8;

/// Width of one offset table entry.
pub const OFFSET_SIZE: usize = 2;

/// Per-entry prefix: key length (u16 LE) + value length (u16 LE).
pub const KV_HEADER_SIZE: usize = 4;

/// Node kind tag for internal nodes.
pub const NODE_KIND_INTERNAL: u16 = 1;

/// Node kind tag for leaf nodes.
pub const NODE_KIND_LEAF: u16 = 2;

/// A node under construction may grow to two pages before it is split.
pub const WORKING_NODE_SIZE: usize = 2 * PAGE_SIZE;

// ============================================================================
// SIZE LIMITS
// Enforced before any page is touched.
// ============================================================================

pub const MAX_KEY_SIZE: usize = 1000;
pub const MAX_VALUE_SIZE: usize = 3000;

const _: () = assert!(
    NODE_HEADER_SIZE + POINTER_SIZE + OFFSET_SIZE + KV_HEADER_SIZE + MAX_KEY_SIZE + MAX_VALUE_SIZE
        <= PAGE_SIZE,
    "a single maximal entry must fit in one page"
);

// ============================================================================
// SPLIT / MERGE THRESHOLDS
// ============================================================================

/// The left piece of a split is filled up to this many bytes.
pub const SPLIT_FILL_TARGET: usize = PAGE_SIZE * 3 / 4;

/// Nodes at or below this size try to merge with a sibling after a delete.
pub const MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

/// Maximum tree height tracked by iterator path stacks without spilling.
pub const MAX_TREE_DEPTH: usize = 16;

const _: () = assert!(
    MERGE_THRESHOLD < SPLIT_FILL_TARGET,
    "merge threshold must stay below the split fill target"
);

// ============================================================================
// META PAGE
// ============================================================================

/// Page 0 holds the meta record; no tree page ever uses id 0, so 0 also
/// means "no page".
pub const META_PAGE_ID: u64 = 0;

pub const META_SIGNATURE: &[u8; 16] = b"TreeStore01\x00\x00\x00\x00\x00";

/// Signature + root + page count + five free-list fields.
pub const META_SIZE: usize = 16 + 8 + 8 + 5 * 8;

const _: () = assert!(META_SIZE <= PAGE_SIZE, "meta record must fit page 0");

// ============================================================================
// FREE LIST
// ============================================================================

/// List page header: next list page id (u64 LE).
pub const FREE_LIST_HEADER: usize = 8;

/// Page ids stored per list page.
pub const FREE_LIST_CAPACITY: usize = (PAGE_SIZE - FREE_LIST_HEADER) / 8;

const _: () = assert!(
    FREE_LIST_HEADER + FREE_LIST_CAPACITY * 8 <= PAGE_SIZE,
    "FREE_LIST_CAPACITY derivation mismatch"
);

// ============================================================================
// CONCURRENCY LIMITS
// ============================================================================

/// Maximum number of concurrent read snapshots.
pub const MAX_CONCURRENT_READERS: usize = 64;

// ============================================================================
// RUNTIME DEFAULTS
// ============================================================================

/// Default ceiling on the file size in pages (16 GiB with 4KB pages).
pub const DEFAULT_MAX_PAGES: u64 = 4 * 1024 * 1024;

/// Pages allocated when a new file is created (meta page only).
pub const DEFAULT_INITIAL_PAGES: u64 = 1;

/// Default result cap for store listings when the caller passes no limit.
pub const DEFAULT_QUERY_LIMIT: usize = 100;
