//! # Engine Handle and Transactions
//!
//! Entry point of the crate. Everything above this layer (document, version,
//! metadata and prompt stores, the query engine) is written against
//! [`TreeStore`], [`WriteTxn`] and the [`KvRead`] trait.
//!
//! ## Concurrency
//!
//! ```text
//! TreeStore (Arc)
//!   ├─ writer: Mutex<()>            one WriteTxn at a time
//!   ├─ txns:   TransactionManager   published root, reader slots, fences
//!   └─ pager:  Pager                RwLock<MmapStorage>
//! ```
//!
//! Readers never wait for the writer mutex; they only take the pager's read
//! lock for the duration of one page copy.

mod builder;
#[allow(clippy::module_inception)]
mod database;
mod transaction;

pub use builder::{StoreBuilder, StoreConfig};
pub use database::{StoreStats, TreeStore};
pub use transaction::{KvIter, KvRead, ReadTxn, WriteTxn};
