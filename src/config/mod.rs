//! # TreeStore Configuration Module
//!
//! Centralized layout constants for pages, limits and concurrency. Runtime
//! options (file path, sync policy, page ceiling) live on
//! [`crate::database::StoreBuilder`].
//!
//! ## Module Organization
//!
//! - [`constants`]: numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
