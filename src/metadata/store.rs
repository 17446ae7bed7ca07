//! # Metadata Store
//!
//! Free-form `key = value` attributes on any `(entity_type, entity_id)`.
//!
//! ```text
//! METADATA         (type, id, key)          -> MetadataEntry
//! METADATA_ENTITY  (type, id, key)          -> ()
//! METADATA_KEY     (key, type, id)          -> ()
//! METADATA_VALUE   (key, value, type, id)   -> ()
//! ```
//!
//! The value is part of the `METADATA_VALUE` key, so values share the key
//! size limit.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use eyre::Result;
use tracing::debug;

use super::types::{EntityRef, MetadataEntry, ValueType};
use crate::database::{KvRead, TreeStore, WriteTxn};
use crate::encoding::{decode_record, encode_record, str_field, table, KeyEncoder};
use crate::error::TreeStoreError;

fn primary_key(entity_type: &str, entity_id: &str, key: &str) -> Vec<u8> {
    KeyEncoder::new(table::METADATA)
        .str(entity_type)
        .str(entity_id)
        .str(key)
        .finish()
}

fn entity_key(entity_type: &str, entity_id: &str, key: &str) -> Vec<u8> {
    KeyEncoder::new(table::METADATA_ENTITY)
        .str(entity_type)
        .str(entity_id)
        .str(key)
        .finish()
}

fn key_index(entry: &MetadataEntry) -> Vec<u8> {
    KeyEncoder::new(table::METADATA_KEY)
        .str(&entry.key)
        .str(&entry.entity_type)
        .str(&entry.entity_id)
        .finish()
}

fn value_index(entry: &MetadataEntry) -> Vec<u8> {
    KeyEncoder::new(table::METADATA_VALUE)
        .str(&entry.key)
        .str(&entry.value)
        .str(&entry.entity_type)
        .str(&entry.entity_id)
        .finish()
}

fn key_prefix(key: &str, entity_type: Option<&str>) -> Vec<u8> {
    let enc = KeyEncoder::new(table::METADATA_KEY).str(key);
    match entity_type {
        Some(t) => enc.str(t).finish(),
        None => enc.finish(),
    }
}

fn value_prefix(key: &str, value: &str, entity_type: Option<&str>) -> Vec<u8> {
    let enc = KeyEncoder::new(table::METADATA_VALUE).str(key).str(value);
    match entity_type {
        Some(t) => enc.str(t).finish(),
        None => enc.finish(),
    }
}

pub(crate) fn get_metadata_in<R: KvRead + ?Sized>(
    txn: &R,
    entity_type: &str,
    entity_id: &str,
    key: &str,
) -> Result<Option<MetadataEntry>> {
    txn.get(&primary_key(entity_type, entity_id, key))?
        .map(|bytes| decode_record(&bytes))
        .transpose()
}

fn entity_entries<R: KvRead + ?Sized>(
    txn: &R,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<MetadataEntry>> {
    let prefix = KeyEncoder::new(table::METADATA_ENTITY)
        .str(entity_type)
        .str(entity_id)
        .finish();

    let mut entries = Vec::new();
    for entry in txn.scan_prefix(&prefix)? {
        let (index_key, _) = entry?;
        let key = str_field(&index_key, 2)?;
        if let Some(found) = get_metadata_in(txn, entity_type, entity_id, &key)? {
            entries.push(found);
        }
    }
    Ok(entries)
}

pub(crate) fn get_all_metadata_in<R: KvRead + ?Sized>(
    txn: &R,
    entity_type: &str,
    entity_id: &str,
) -> Result<BTreeMap<String, String>> {
    Ok(entity_entries(txn, entity_type, entity_id)?
        .into_iter()
        .map(|e| (e.key, e.value))
        .collect())
}

/// Walks an index whose last two key fields are `(type, id)` and loads the
/// entry for `key` on each entity.
fn entries_from_index<R: KvRead + ?Sized>(
    txn: &R,
    prefix: &[u8],
    type_field: usize,
    key: &str,
    limit: usize,
) -> Result<Vec<MetadataEntry>> {
    let mut results = Vec::new();
    for entry in txn.scan_prefix(prefix)? {
        if limit > 0 && results.len() >= limit {
            break;
        }
        let (index_key, _) = entry?;
        let entity_type = str_field(&index_key, type_field)?;
        let entity_id = str_field(&index_key, type_field + 1)?;
        match get_metadata_in(txn, &entity_type, &entity_id, key)? {
            Some(found) => results.push(found),
            None => {
                return Err(TreeStoreError::corruption(format!(
                    "metadata index points at missing entry {}/{}/{}",
                    entity_type, entity_id, key
                ))
                .into())
            }
        }
    }
    Ok(results)
}

pub(crate) fn query_by_key_in<R: KvRead + ?Sized>(
    txn: &R,
    key: &str,
    entity_type: Option<&str>,
    limit: usize,
) -> Result<Vec<MetadataEntry>> {
    entries_from_index(txn, &key_prefix(key, entity_type), 1, key, limit)
}

pub(crate) fn query_by_key_value_in<R: KvRead + ?Sized>(
    txn: &R,
    key: &str,
    value: &str,
    entity_type: Option<&str>,
    limit: usize,
) -> Result<Vec<MetadataEntry>> {
    entries_from_index(txn, &value_prefix(key, value, entity_type), 2, key, limit)
}

fn entity_refs<R: KvRead + ?Sized>(
    txn: &R,
    key: &str,
    value: &str,
    entity_type: Option<&str>,
) -> Result<HashSet<EntityRef>> {
    let mut refs = HashSet::new();
    for entry in txn.scan_prefix(&value_prefix(key, value, entity_type))? {
        let (index_key, _) = entry?;
        refs.insert(EntityRef {
            entity_type: str_field(&index_key, 2)?,
            entity_id: str_field(&index_key, 3)?,
        });
    }
    Ok(refs)
}

fn unlink_entry(txn: &mut WriteTxn<'_>, entry: &MetadataEntry) -> Result<()> {
    txn.delete(&primary_key(&entry.entity_type, &entry.entity_id, &entry.key))?;
    txn.delete(&entity_key(&entry.entity_type, &entry.entity_id, &entry.key))?;
    txn.delete(&key_index(entry))?;
    txn.delete(&value_index(entry))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    store: TreeStore,
}

impl MetadataStore {
    pub fn new(store: TreeStore) -> Self {
        Self { store }
    }

    /// Upserts one attribute. An existing entry keeps its `created_at`; its
    /// old value index entry is replaced. `value_type` is inferred from the
    /// value when not given.
    pub fn set_metadata(
        &self,
        entity_type: &str,
        entity_id: &str,
        key: &str,
        value: &str,
        value_type: Option<ValueType>,
    ) -> Result<MetadataEntry> {
        let entry = self.store.update(|txn| {
            let now = Utc::now();
            let previous = get_metadata_in(&*txn, entity_type, entity_id, key)?;

            let entry = MetadataEntry {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                value_type: value_type.unwrap_or_else(|| ValueType::infer(value)),
                created_at: previous.as_ref().map_or(now, |p| p.created_at),
                updated_at: now,
            };

            if let Some(old) = &previous {
                if old.value != entry.value {
                    txn.delete(&value_index(old))?;
                }
            }
            txn.insert(
                &primary_key(entity_type, entity_id, key),
                &encode_record(&entry)?,
            )?;
            txn.insert(&entity_key(entity_type, entity_id, key), &[])?;
            txn.insert(&key_index(&entry), &[])?;
            txn.insert(&value_index(&entry), &[])?;
            Ok(entry)
        })?;

        debug!(
            %entity_type,
            %entity_id,
            %key,
            value_type = entry.value_type.as_str(),
            "metadata set"
        );
        Ok(entry)
    }

    pub fn get_metadata(
        &self,
        entity_type: &str,
        entity_id: &str,
        key: &str,
    ) -> Result<Option<MetadataEntry>> {
        self.store
            .view(|txn| get_metadata_in(txn, entity_type, entity_id, key))
    }

    /// All attributes of one entity as `key -> value`.
    pub fn get_all_metadata(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.store
            .view(|txn| get_all_metadata_in(txn, entity_type, entity_id))
    }

    pub fn delete_metadata(&self, entity_type: &str, entity_id: &str, key: &str) -> Result<bool> {
        self.store.update(|txn| {
            match get_metadata_in(&*txn, entity_type, entity_id, key)? {
                Some(entry) => {
                    unlink_entry(txn, &entry)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Removes every attribute of an entity; returns how many were removed.
    pub fn delete_all_metadata(&self, entity_type: &str, entity_id: &str) -> Result<usize> {
        let removed = self.store.update(|txn| {
            let entries = entity_entries(&*txn, entity_type, entity_id)?;
            for entry in &entries {
                unlink_entry(txn, entry)?;
            }
            Ok(entries.len())
        })?;
        if removed > 0 {
            debug!(%entity_type, %entity_id, removed, "metadata cleared");
        }
        Ok(removed)
    }

    /// Entries carrying `key`, ordered by entity. `limit` 0 means no limit.
    pub fn query_by_key(
        &self,
        key: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MetadataEntry>> {
        self.store
            .view(|txn| query_by_key_in(txn, key, entity_type, limit))
    }

    pub fn query_by_key_value(
        &self,
        key: &str,
        value: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MetadataEntry>> {
        self.store
            .view(|txn| query_by_key_value_in(txn, key, value, entity_type, limit))
    }

    /// Entities matching every `key = value` filter.
    ///
    /// Each filter's candidates come from one value-index range scan; sets
    /// are intersected smallest first and the walk stops as soon as the
    /// running intersection is empty. Results are ordered by entity.
    pub fn query_multiple(
        &self,
        filters: &BTreeMap<String, String>,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EntityRef>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        self.store.view(|txn| {
            let mut sets = Vec::with_capacity(filters.len());
            for (key, value) in filters {
                let set = entity_refs(txn, key, value, entity_type)?;
                if set.is_empty() {
                    return Ok(Vec::new());
                }
                sets.push(set);
            }
            sets.sort_by_key(HashSet::len);

            let mut sets = sets.into_iter();
            let mut matches = sets.next().unwrap_or_default();
            for set in sets {
                matches.retain(|r| set.contains(r));
                if matches.is_empty() {
                    break;
                }
            }

            let mut results: Vec<EntityRef> = matches.into_iter().collect();
            results.sort();
            if limit > 0 {
                results.truncate(limit);
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (TempDir, MetadataStore) {
        let dir = tempdir().unwrap();
        let store = TreeStore::builder()
            .path(dir.path().join("meta.db"))
            .sync_on_commit(false)
            .open()
            .unwrap();
        (dir, MetadataStore::new(store))
    }

    #[test]
    fn upsert_preserves_created_at_and_moves_value_index() {
        let (_dir, meta) = create_test_store();
        let first = meta
            .set_metadata("document", "doc-1", "status", "draft", None)
            .unwrap();
        let second = meta
            .set_metadata("document", "doc-1", "status", "published", None)
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert!(meta
            .query_by_key_value("status", "draft", None, 0)
            .unwrap()
            .is_empty());
        assert_eq!(
            meta.query_by_key_value("status", "published", None, 0)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(meta.query_by_key("status", None, 0).unwrap().len(), 1);
    }

    #[test]
    fn explicit_type_wins_over_inference() {
        let (_dir, meta) = create_test_store();
        let entry = meta
            .set_metadata("node", "n1", "code", "0042", Some(ValueType::String))
            .unwrap();
        assert_eq!(entry.value_type, ValueType::String);
        let inferred = meta.set_metadata("node", "n1", "pages", "12", None).unwrap();
        assert_eq!(inferred.value_type, ValueType::Number);
    }

    #[test]
    fn query_by_key_filters_entity_type() {
        let (_dir, meta) = create_test_store();
        meta.set_metadata("document", "d1", "owner", "alice", None)
            .unwrap();
        meta.set_metadata("node", "n1", "owner", "bob", None).unwrap();
        meta.set_metadata("node", "n2", "owner", "alice", None).unwrap();

        assert_eq!(meta.query_by_key("owner", None, 0).unwrap().len(), 3);
        assert_eq!(meta.query_by_key("owner", Some("node"), 0).unwrap().len(), 2);
        assert_eq!(meta.query_by_key("owner", None, 2).unwrap().len(), 2);

        let alices = meta
            .query_by_key_value("owner", "alice", Some("node"), 0)
            .unwrap();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].entity_id, "n2");
    }

    #[test]
    fn delete_removes_every_index_entry() {
        let (_dir, meta) = create_test_store();
        meta.set_metadata("node", "n1", "a", "1", None).unwrap();
        meta.set_metadata("node", "n1", "b", "2", None).unwrap();
        meta.set_metadata("node", "n2", "a", "1", None).unwrap();

        assert!(meta.delete_metadata("node", "n1", "a").unwrap());
        assert!(!meta.delete_metadata("node", "n1", "a").unwrap());
        assert_eq!(meta.query_by_key("a", None, 0).unwrap().len(), 1);

        assert_eq!(meta.delete_all_metadata("node", "n1").unwrap(), 1);
        assert!(meta.get_all_metadata("node", "n1").unwrap().is_empty());
        assert_eq!(meta.get_all_metadata("node", "n2").unwrap().len(), 1);
    }

    #[test]
    fn query_multiple_short_circuits_on_empty_filter() {
        let (_dir, meta) = create_test_store();
        meta.set_metadata("document", "doc-1", "department", "Legal", None)
            .unwrap();

        let filters = BTreeMap::from([
            ("department".to_string(), "Legal".to_string()),
            ("status".to_string(), "archived".to_string()),
        ]);
        assert!(meta.query_multiple(&filters, None, 0).unwrap().is_empty());
        assert!(meta
            .query_multiple(&BTreeMap::new(), None, 0)
            .unwrap()
            .is_empty());
    }
}
