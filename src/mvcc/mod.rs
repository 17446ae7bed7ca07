//! # Snapshot Isolation
//!
//! TreeStore is single-writer / multi-reader. Isolation comes from the
//! copy-on-write tree rather than from per-record versions:
//!
//! - A reader captures the committed root when it begins and traverses only
//!   pages reachable from it. Those pages are never rewritten in place.
//! - The one writer builds a new tree next to the old one and publishes its
//!   root after the meta page is durable.
//! - Pages the writer released stay off-limits for reuse until every reader
//!   that started before the release has finished.
//!
//! ```text
//! version:   4            5            6
//! root:      p17 ───────> p31 ───────> p44
//!             ^            ^
//!          reader A     reader B       (new readers start at 6)
//!
//! pages freed by commit 5: reusable once A is gone
//! pages freed by commit 6: reusable once A and B are gone
//! ```
//!
//! ## Key Structures
//!
//! - `TransactionManager`: published root/version, reader slots, fences
//! - `ReaderSlot`: RAII registration of one reader
//! - `Snapshot`: committed meta record and version a transaction starts from

mod transaction;

pub use transaction::{ReaderSlot, Snapshot, TransactionManager};
