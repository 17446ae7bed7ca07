//! # Encoding Module
//!
//! - **Key encoding**: byte-comparable composite keys with a table prefix,
//!   used for every primary and secondary index
//! - **Record encoding**: JSON values for store records

pub mod key;
pub mod record;

pub use key::{
    decode_key, encode_key, encode_key_partial, extract_prefix, str_field, table, tag, KeyEncoder,
    KeyValue,
};
pub use record::{decode_record, encode_record};
