//! # Query Module
//!
//! Composes the document, version, metadata and prompt stores into
//! snapshot-consistent cross-store reads:
//!
//! - enriched documents (node + metadata + version)
//! - enriched conversations (conversation + messages + metadata)
//! - batched node lookups and metadata-based relationship discovery
//! - typed [`Query`] execution with pagination, and scored search

mod engine;
mod types;

pub use engine::QueryEngine;
pub use types::{
    filter, EnrichedConversation, EnrichedDocument, Query, QueryBuilder, QueryResult, QueryType,
    SearchHit, SearchOptions, DEFAULT_QUERY_LIMIT,
};
