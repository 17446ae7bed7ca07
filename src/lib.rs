//! # TreeStore - Embeddable Hierarchical Storage Engine
//!
//! TreeStore is a key-value engine built on a disk-backed B+Tree with
//! copy-on-write pages, snapshot reads and a single writer. Specialized
//! stores for policy documents, versions, metadata and conversation history
//! are layered on the same tree through composite-key secondary indexes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use treestore::{TreeStore, KvRead};
//!
//! let store = TreeStore::builder()
//!     .path("./policies.db")
//!     .sync_on_commit(true)
//!     .open()?;
//!
//! store.insert(b"key01", b"one")?;
//! let rows = store.range_scan(b"key00", b"key99")?;
//!
//! let docs = treestore::DocumentStore::new(store.clone());
//! let children = docs.get_children("LCD-L34220", Some("root"))?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    QueryEngine                        │
//! ├─────────────┬─────────────┬─────────────┬────────────┤
//! │ Document    │ Version     │ Metadata    │ Prompt     │
//! │ Store       │ Store       │ Store       │ Store      │
//! ├─────────────┴─────────────┴─────────────┴────────────┤
//! │     Composite keys (encoding) + JSON records          │
//! ├──────────────────────────────────────────────────────┤
//! │   TreeStore: ReadTxn / WriteTxn, snapshot registry    │
//! ├──────────────────────────────────────────────────────┤
//! │   B+Tree (copy-on-write, page codec, range cursor)    │
//! ├──────────────────────────────────────────────────────┤
//! │   Page allocator, free list, meta page, mmap file     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One file of 4096-byte pages. Page 0 holds the meta record (signature,
//! root, page count, free list pointers); every other page is a tree node or
//! a free-list page. A commit writes new pages first and the meta page last.
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and limits
//! - [`error`]: `TreeStoreError` kinds carried through `eyre::Report`
//! - [`btree`]: node codec, copy-on-write tree, cursors
//! - [`storage`]: mmap file, meta page, free list, per-transaction allocator
//! - [`mvcc`]: published snapshots, reader slots, page reuse fences
//! - [`database`]: engine handle, builder, transactions
//! - [`encoding`]: composite keys and record values
//! - [`document`], [`version`], [`metadata`], [`prompt`]: specialized stores
//! - [`query`]: cross-store reads

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod database;
pub mod document;
pub mod encoding;
pub mod error;
pub mod metadata;
pub mod mvcc;
pub mod prompt;
pub mod query;
pub mod storage;
pub mod version;

pub use database::{
    KvIter, KvRead, ReadTxn, StoreBuilder, StoreConfig, StoreStats, TreeStore, WriteTxn,
};
pub use document::{Document, DocumentStore, Node, QueryOptions, SearchResult};
pub use error::TreeStoreError;
pub use metadata::{EntityRef, MetadataEntry, MetadataStore, ValueType};
pub use prompt::{Conversation, ConversationWithMessages, Message, PromptStore, Role};
pub use query::{Query, QueryBuilder, QueryEngine, QueryResult, QueryType, SearchOptions};
pub use version::{Version, VersionStore};
