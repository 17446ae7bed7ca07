//! # Error Kinds
//!
//! Every fallible operation returns `eyre::Result`. Failures that callers are
//! expected to branch on are raised as a [`TreeStoreError`] so they can be
//! recovered with `downcast_ref`:
//!
//! ```ignore
//! match store.insert(&key, &value) {
//!     Err(e) if matches!(e.downcast_ref(), Some(TreeStoreError::ValueTooLarge { .. })) => {
//!         // shrink and retry
//!     }
//!     other => other?,
//! }
//! ```
//!
//! Absence is not an error: lookups return `Ok(None)` or an empty collection.
//! `NotFound` is reserved for operations whose target must exist, such as
//! appending a message to an unknown conversation.

use thiserror::Error;

use crate::config::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

#[derive(Debug, Error)]
pub enum TreeStoreError {
    /// A record required by the operation does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("key of {len} bytes exceeds the maximum of {} bytes", MAX_KEY_SIZE)]
    KeyTooLarge { len: usize },

    #[error("value of {len} bytes exceeds the maximum of {} bytes", MAX_VALUE_SIZE)]
    ValueTooLarge { len: usize },

    /// The empty key is reserved for the tree's leftmost sentinel entry.
    #[error("empty keys are reserved")]
    EmptyKey,

    /// A page or the meta record failed structural validation.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The allocator cannot grow the file any further.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// The write would violate a uniqueness or referential rule.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl TreeStoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }
}

/// Returns true when `err` carries a [`TreeStoreError::NotFound`].
pub fn is_not_found(err: &eyre::Report) -> bool {
    matches!(
        err.downcast_ref::<TreeStoreError>(),
        Some(TreeStoreError::NotFound { .. })
    )
}

/// Rejects keys and values over the size limits before any page is read.
pub fn check_entry_size(key: &[u8], value: &[u8]) -> Result<(), TreeStoreError> {
    if key.is_empty() {
        return Err(TreeStoreError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(TreeStoreError::KeyTooLarge { len: key.len() });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(TreeStoreError::ValueTooLarge { len: value.len() });
    }
    Ok(())
}
