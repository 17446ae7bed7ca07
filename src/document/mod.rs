//! # Document Module
//!
//! Hierarchical policy documents stored as node trees:
//!
//! - **Types**: [`Document`], [`Node`], [`SearchResult`], [`QueryOptions`]
//! - **Store**: [`DocumentStore`] with atomic replace-on-ingest, child and
//!   subtree traversal, ancestor paths, section-path and page lookups, and
//!   keyword search

mod store;
mod types;

pub use store::DocumentStore;
pub use types::{Document, Node, QueryOptions, SearchResult};

pub(crate) use store::{get_children_in, get_node_in, search_in};
