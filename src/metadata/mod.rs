//! # Metadata Module
//!
//! Flexible attributes attached to any entity, with per-key and per-value
//! indexes for lookups and multi-filter intersection queries.

mod store;
mod types;

pub use store::MetadataStore;
pub use types::{entity, EntityRef, MetadataEntry, ValueType};

pub(crate) use store::{
    get_all_metadata_in, get_metadata_in, query_by_key_in, query_by_key_value_in,
};
