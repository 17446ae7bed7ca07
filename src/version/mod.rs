//! # Version Module
//!
//! Append-only version records per policy with point-in-time ("as of"),
//! latest, tag and ordered listing lookups.

mod store;
mod types;

pub use store::VersionStore;
pub use types::Version;

pub(crate) use store::{
    get_latest_version_in, get_version_by_tag_in, get_version_in, list_versions_in,
};
