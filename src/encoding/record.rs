//! # Record Values
//!
//! Store records are persisted as compact JSON in B+Tree values. Index
//! entries that only point back at a primary key carry an empty value.

use eyre::{Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::MAX_VALUE_SIZE;
use crate::error::TreeStoreError;

pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(record).wrap_err("failed to serialize record")?;
    if bytes.len() > MAX_VALUE_SIZE {
        return Err(TreeStoreError::ValueTooLarge { len: bytes.len() }.into());
    }
    Ok(bytes)
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        TreeStoreError::corruption(format!(
            "undecodable {} record: {}",
            std::any::type_name::<T>(),
            e
        ))
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        count: u32,
    }

    #[test]
    fn encodes_as_json() {
        let bytes = encode_record(&Sample {
            id: "a".into(),
            count: 2,
        })
        .unwrap();
        assert_eq!(bytes, br#"{"id":"a","count":2}"#);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let big = Sample {
            id: "x".repeat(MAX_VALUE_SIZE),
            count: 0,
        };
        let err = encode_record(&big).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_is_corruption() {
        let err = decode_record::<Sample>(b"{not json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::Corruption(_))
        ));
    }
}
