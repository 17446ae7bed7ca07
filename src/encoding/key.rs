//! # Composite Index Keys
//!
//! Every record and index entry lives in the one B+Tree. Keys are built so
//! that plain byte comparison orders them by table, then field by field:
//!
//! ```text
//! [table prefix: u32 BE][tag][field bytes][tag][field bytes]...
//! ```
//!
//! ## Field Encodings
//!
//! ```text
//! Tag   Type     Bytes
//! ----  -------  ------------------------------------------------------
//! 0x01  BYTES    escaped content, then 0x00 terminator
//! 0x02  INT64    8 bytes BE with the sign bit flipped
//! 0x03  UINT64   8 bytes BE
//! 0x04  TIME     unix microseconds as INT64
//! ```
//!
//! BYTES escaping keeps the terminator the smallest byte so a string sorts
//! before every extension of itself:
//!
//! ```text
//! 0x00 -> 0x01 0x01
//! 0x01 -> 0x01 0x02
//! ```
//!
//! ## Partial Keys
//!
//! A key built from a leading subset of fields is a prefix of every full key
//! sharing those fields. [`KeyEncoder::finish_partial`] appends `0xFF`, which
//! sorts after any tag byte, giving an upper bound for "greater than" starts
//! and "less or equal" backward scans.
//!
//! ```ignore
//! let start = KeyEncoder::new(table::VERSION_TIME)
//!     .str(policy_id)
//!     .time(as_of)
//!     .finish_partial();
//! ```

use chrono::{DateTime, Utc};
use eyre::{bail, ensure, Result};

use crate::error::TreeStoreError;

pub mod tag {
    pub const BYTES: u8 = 0x01;
    pub const INT64: u8 = 0x02;
    pub const UINT64: u8 = 0x03;
    pub const TIME: u8 = 0x04;

    /// Appended to partial keys; greater than every tag.
    pub const PARTIAL_MAX: u8 = 0xFF;
}

/// Table prefixes. Each store owns a range of a hundred or a thousand ids.
pub mod table {
    pub const DOCUMENT: u32 = 1000;
    pub const DOC_NODES: u32 = 1100;
    pub const NODE: u32 = 2000;
    pub const CHILDREN: u32 = 3000;
    pub const PATH: u32 = 4000;
    pub const PAGE: u32 = 5000;

    pub const VERSION: u32 = 6000;
    pub const VERSION_TIME: u32 = 6100;
    pub const VERSION_TAG: u32 = 6200;
    pub const LATEST_VERSION: u32 = 6300;

    pub const METADATA: u32 = 7000;
    pub const METADATA_ENTITY: u32 = 7100;
    pub const METADATA_KEY: u32 = 7200;
    pub const METADATA_VALUE: u32 = 7300;

    pub const CONVERSATION: u32 = 8000;
    pub const MESSAGE: u32 = 8100;
    pub const CONVERSATION_USER: u32 = 8200;
    pub const CONVERSATION_TIME: u32 = 8300;
    pub const CONVERSATION_TAG: u32 = 8400;
    pub const MESSAGE_CONVERSATION: u32 = 8500;
}

const ESCAPE: u8 = 0x01;
const TERMINATOR: u8 = 0x00;
const SIGN_FLIP: u64 = 1 << 63;

/// One decoded key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Bytes(Vec<u8>),
    Int64(i64),
    Uint64(u64),
    Time(DateTime<Utc>),
}

impl KeyValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            KeyValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeyValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            KeyValue::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            KeyValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int64(v)
    }
}

impl From<u64> for KeyValue {
    fn from(v: u64) -> Self {
        KeyValue::Uint64(v)
    }
}

impl From<DateTime<Utc>> for KeyValue {
    fn from(t: DateTime<Utc>) -> Self {
        KeyValue::Time(t)
    }
}

/// Appends escaped bytes and the terminator.
pub fn encode_bytes_to(value: &[u8], buf: &mut Vec<u8>) {
    buf.push(tag::BYTES);
    for &b in value {
        match b {
            0x00 => buf.extend_from_slice(&[ESCAPE, 0x01]),
            0x01 => buf.extend_from_slice(&[ESCAPE, 0x02]),
            _ => buf.push(b),
        }
    }
    buf.push(TERMINATOR);
}

pub fn encode_int64_to(value: i64, buf: &mut Vec<u8>) {
    buf.push(tag::INT64);
    buf.extend_from_slice(&((value as u64) ^ SIGN_FLIP).to_be_bytes());
}

pub fn encode_uint64_to(value: u64, buf: &mut Vec<u8>) {
    buf.push(tag::UINT64);
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn encode_time_to(value: DateTime<Utc>, buf: &mut Vec<u8>) {
    buf.push(tag::TIME);
    buf.extend_from_slice(&((value.timestamp_micros() as u64) ^ SIGN_FLIP).to_be_bytes());
}

/// Fluent builder for one composite key.
#[derive(Debug, Clone)]
pub struct KeyEncoder {
    buf: Vec<u8>,
}

impl KeyEncoder {
    pub fn new(prefix: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&prefix.to_be_bytes());
        Self { buf }
    }

    pub fn bytes(mut self, value: impl AsRef<[u8]>) -> Self {
        encode_bytes_to(value.as_ref(), &mut self.buf);
        self
    }

    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    pub fn int64(mut self, value: i64) -> Self {
        encode_int64_to(value, &mut self.buf);
        self
    }

    pub fn uint64(mut self, value: u64) -> Self {
        encode_uint64_to(value, &mut self.buf);
        self
    }

    pub fn time(mut self, value: DateTime<Utc>) -> Self {
        encode_time_to(value, &mut self.buf);
        self
    }

    pub fn value(self, value: &KeyValue) -> Self {
        match value {
            KeyValue::Bytes(b) => self.bytes(b),
            KeyValue::Int64(v) => self.int64(*v),
            KeyValue::Uint64(v) => self.uint64(*v),
            KeyValue::Time(t) => self.time(*t),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Key that sorts after every key extending the fields encoded so far.
    pub fn finish_partial(mut self) -> Vec<u8> {
        self.buf.push(tag::PARTIAL_MAX);
        self.buf
    }
}

pub fn encode_key(prefix: u32, values: &[KeyValue]) -> Vec<u8> {
    values
        .iter()
        .fold(KeyEncoder::new(prefix), |enc, v| enc.value(v))
        .finish()
}

pub fn encode_key_partial(prefix: u32, values: &[KeyValue]) -> Vec<u8> {
    values
        .iter()
        .fold(KeyEncoder::new(prefix), |enc, v| enc.value(v))
        .finish_partial()
}

pub fn extract_prefix(key: &[u8]) -> Result<u32> {
    ensure!(
        key.len() >= 4,
        TreeStoreError::corruption(format!("key of {} bytes has no table prefix", key.len()))
    );
    Ok(u32::from_be_bytes([key[0], key[1], key[2], key[3]]))
}

fn read_be_u64(key: &[u8], pos: usize) -> Result<u64> {
    ensure!(
        pos + 8 <= key.len(),
        TreeStoreError::corruption(format!("truncated integer field at byte {}", pos))
    );
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[pos..pos + 8]);
    Ok(u64::from_be_bytes(raw))
}

/// Decodes a full key into its prefix and fields. A trailing partial marker
/// is accepted and ignored.
pub fn decode_key(key: &[u8]) -> Result<(u32, Vec<KeyValue>)> {
    let prefix = extract_prefix(key)?;
    let mut values = Vec::new();
    let mut pos = 4;

    while pos < key.len() {
        let field_tag = key[pos];
        pos += 1;
        match field_tag {
            tag::BYTES => {
                let mut out = Vec::new();
                loop {
                    let Some(&b) = key.get(pos) else {
                        bail!(TreeStoreError::corruption("unterminated bytes field"));
                    };
                    pos += 1;
                    match b {
                        TERMINATOR => break,
                        ESCAPE => {
                            let escaped = match key.get(pos) {
                                Some(0x01) => 0x00,
                                Some(0x02) => 0x01,
                                other => bail!(TreeStoreError::corruption(format!(
                                    "invalid escape sequence 0x01 {:?}",
                                    other
                                ))),
                            };
                            pos += 1;
                            out.push(escaped);
                        }
                        _ => out.push(b),
                    }
                }
                values.push(KeyValue::Bytes(out));
            }
            tag::INT64 => {
                let raw = read_be_u64(key, pos)?;
                pos += 8;
                values.push(KeyValue::Int64((raw ^ SIGN_FLIP) as i64));
            }
            tag::UINT64 => {
                values.push(KeyValue::Uint64(read_be_u64(key, pos)?));
                pos += 8;
            }
            tag::TIME => {
                let micros = (read_be_u64(key, pos)? ^ SIGN_FLIP) as i64;
                pos += 8;
                let time = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                    TreeStoreError::corruption(format!("time field {} out of range", micros))
                })?;
                values.push(KeyValue::Time(time));
            }
            tag::PARTIAL_MAX if pos == key.len() => break,
            other => bail!(TreeStoreError::corruption(format!(
                "unknown key field tag 0x{:02x} at byte {}",
                other,
                pos - 1
            ))),
        }
    }
    Ok((prefix, values))
}

/// Decodes `key` and returns its field at `index` as a UTF-8 string.
///
/// Index entries carry the id of the record they point at as a key field;
/// this is how stores read it back.
pub fn str_field(key: &[u8], index: usize) -> Result<String> {
    let (prefix, fields) = decode_key(key)?;
    fields
        .get(index)
        .and_then(KeyValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            TreeStoreError::corruption(format!(
                "table {} key has no string field at position {}",
                prefix, index
            ))
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn prefix_is_big_endian_and_orders_tables() {
        let a = KeyEncoder::new(table::NODE).str("zzz").finish();
        let b = KeyEncoder::new(table::CHILDREN).str("aaa").finish();

        assert_eq!(&a[..4], &2000u32.to_be_bytes());
        assert!(a < b);
        assert_eq!(extract_prefix(&b).unwrap(), table::CHILDREN);
    }

    #[test]
    fn bytes_escape_keeps_prefix_strings_first() {
        let plain = KeyEncoder::new(1).bytes(b"a").finish();
        let nul = KeyEncoder::new(1).bytes(b"a\x00").finish();
        let one = KeyEncoder::new(1).bytes(b"a\x01").finish();
        let two = KeyEncoder::new(1).bytes(b"a\x02").finish();

        assert!(plain < nul);
        assert!(nul < one);
        assert!(one < two);
        assert_eq!(&nul[4..], &[tag::BYTES, b'a', 0x01, 0x01, 0x00]);
    }

    #[test]
    fn int64_orders_negatives_first() {
        let keys: Vec<_> = [i64::MIN, -5, -1, 0, 1, 7, i64::MAX]
            .iter()
            .map(|&v| KeyEncoder::new(1).int64(v).finish())
            .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn decode_recovers_every_field_kind() {
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let values = vec![
            KeyValue::Bytes(b"p\x00\x01x".to_vec()),
            KeyValue::Int64(-42),
            KeyValue::Uint64(7),
            KeyValue::Time(when),
        ];

        let (prefix, decoded) = decode_key(&encode_key(table::MESSAGE, &values)).unwrap();
        assert_eq!(prefix, table::MESSAGE);
        assert_eq!(decoded, values);
    }

    #[test]
    fn time_orders_within_one_second() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let early = base + chrono::Duration::milliseconds(200);
        let late = base + chrono::Duration::milliseconds(800);

        let a = KeyEncoder::new(table::VERSION_TIME).time(late).str("a").finish();
        let z = KeyEncoder::new(table::VERSION_TIME).time(early).str("z").finish();
        assert!(z < a);

        let (_, decoded) = decode_key(&a).unwrap();
        assert_eq!(decoded[0].as_time(), Some(late));
    }

    #[test]
    fn partial_key_bounds_all_extensions() {
        let partial = KeyEncoder::new(table::VERSION_TIME).str("POL-1").finish_partial();
        let full = KeyEncoder::new(table::VERSION_TIME)
            .str("POL-1")
            .time(Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap())
            .str("v9")
            .finish();
        let next_policy = KeyEncoder::new(table::VERSION_TIME).str("POL-2").finish();

        assert!(full < partial);
        assert!(partial < next_policy);
        assert_eq!(decode_key(&partial).unwrap().1, vec![KeyValue::from("POL-1")]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_key(b"\x00\x00").is_err());
        assert!(decode_key(&[0, 0, 0, 1, tag::BYTES, b'a']).is_err());
        assert!(decode_key(&[0, 0, 0, 1, 0x09]).is_err());
        assert!(decode_key(&[0, 0, 0, 1, tag::INT64, 1, 2]).is_err());
    }

    #[test]
    fn str_field_reads_trailing_id() {
        let key = KeyEncoder::new(table::CHILDREN)
            .str("P")
            .str("root")
            .str("child-1")
            .finish();
        assert_eq!(str_field(&key, 2).unwrap(), "child-1");
        assert!(str_field(&key, 3).is_err());

        let numeric = KeyEncoder::new(table::PAGE).str("P").int64(4).finish();
        assert!(str_field(&numeric, 1).is_err());
    }
}
