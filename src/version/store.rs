//! # Version Store
//!
//! Versions are append-only. Each create writes four entries in one
//! transaction:
//!
//! ```text
//! VERSION         (policy, version)              -> Version
//! VERSION_TIME    (policy, created_at, version)  -> ()
//! VERSION_TAG     (policy, tag, version)         -> ()   one per tag
//! LATEST_VERSION  (policy)                       -> version id
//! ```
//!
//! The time index stores microseconds. "As of" lookups start from the
//! partial key just past the requested microsecond and filter on the record's
//! exact timestamp while walking backward; versions sharing the first
//! matching microsecond are compared on their full timestamps.

use chrono::{DateTime, Utc};
use eyre::{bail, Result};
use tracing::debug;

use super::types::Version;
use crate::btree::ScanEnd;
use crate::database::{KvRead, TreeStore};
use crate::encoding::{decode_record, encode_record, str_field, table, KeyEncoder};
use crate::error::TreeStoreError;

fn version_key(policy_id: &str, version_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::VERSION)
        .str(policy_id)
        .str(version_id)
        .finish()
}

fn time_prefix(policy_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::VERSION_TIME).str(policy_id).finish()
}

fn time_key(version: &Version) -> Vec<u8> {
    KeyEncoder::new(table::VERSION_TIME)
        .str(&version.policy_id)
        .time(version.created_at)
        .str(&version.version_id)
        .finish()
}

fn tag_key(policy_id: &str, tag: &str, version_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::VERSION_TAG)
        .str(policy_id)
        .str(tag)
        .str(version_id)
        .finish()
}

fn latest_key(policy_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::LATEST_VERSION)
        .str(policy_id)
        .finish()
}

pub(crate) fn get_version_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    version_id: &str,
) -> Result<Option<Version>> {
    txn.get(&version_key(policy_id, version_id))?
        .map(|bytes| decode_record(&bytes))
        .transpose()
}

pub(crate) fn get_latest_version_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
) -> Result<Option<Version>> {
    let Some(raw) = txn.get(&latest_key(policy_id))? else {
        return Ok(None);
    };
    let Ok(version_id) = std::str::from_utf8(&raw) else {
        bail!(TreeStoreError::corruption(format!(
            "latest version pointer of {} is not UTF-8",
            policy_id
        )));
    };
    get_version_in(txn, policy_id, version_id)
}

fn load_indexed<R: KvRead + ?Sized>(txn: &R, policy_id: &str, key: &[u8]) -> Result<Version> {
    let version_id = str_field(key, 2)?;
    get_version_in(txn, policy_id, &version_id)?.ok_or_else(|| {
        TreeStoreError::corruption(format!(
            "index entry for version {}/{} has no record",
            policy_id, version_id
        ))
        .into()
    })
}

/// Newest first when `newest_first`, oldest first otherwise. A `limit` of 0
/// returns every version.
pub(crate) fn list_versions_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    limit: usize,
    newest_first: bool,
) -> Result<Vec<Version>> {
    let prefix = time_prefix(policy_id);
    let scan = if newest_first {
        txn.scan_prefix_rev(&prefix)?
    } else {
        txn.scan_prefix(&prefix)?
    };

    let mut versions = Vec::new();
    for entry in scan {
        if limit > 0 && versions.len() >= limit {
            break;
        }
        let (key, _) = entry?;
        versions.push(load_indexed(txn, policy_id, &key)?);
    }
    Ok(versions)
}

pub(crate) fn get_version_by_tag_in<R: KvRead + ?Sized>(
    txn: &R,
    policy_id: &str,
    tag: &str,
) -> Result<Option<Version>> {
    let prefix = KeyEncoder::new(table::VERSION_TAG)
        .str(policy_id)
        .str(tag)
        .finish();

    let mut best: Option<Version> = None;
    for entry in txn.scan_prefix(&prefix)? {
        let (key, _) = entry?;
        let version = load_indexed(txn, policy_id, &key)?;
        if best
            .as_ref()
            .map_or(true, |b| version.created_at > b.created_at)
        {
            best = Some(version);
        }
    }
    Ok(best)
}

/// Temporal version records keyed by policy.
#[derive(Debug, Clone)]
pub struct VersionStore {
    store: TreeStore,
}

impl VersionStore {
    pub fn new(store: TreeStore) -> Self {
        Self { store }
    }

    /// Records a new version. An existing `(policy_id, version_id)` is a
    /// [`TreeStoreError::Conflict`]: versions are never edited in place.
    ///
    /// The latest pointer moves to this version unless a version with a later
    /// `created_at` is already recorded.
    pub fn create_version(&self, version: &Version) -> Result<()> {
        self.store.update(|txn| {
            let key = version_key(&version.policy_id, &version.version_id);
            if txn.get(&key)?.is_some() {
                bail!(TreeStoreError::Conflict(format!(
                    "version {}/{} already exists",
                    version.policy_id, version.version_id
                )));
            }

            txn.insert(&key, &encode_record(version)?)?;
            txn.insert(&time_key(version), &[])?;
            for tag in &version.tags {
                txn.insert(
                    &tag_key(&version.policy_id, tag, &version.version_id),
                    &[],
                )?;
            }

            let supersedes = match get_latest_version_in(&*txn, &version.policy_id)? {
                Some(latest) => version.created_at >= latest.created_at,
                None => true,
            };
            if supersedes {
                txn.insert(
                    &latest_key(&version.policy_id),
                    version.version_id.as_bytes(),
                )?;
            }
            Ok(())
        })?;

        debug!(
            policy_id = %version.policy_id,
            version_id = %version.version_id,
            created_at = %version.created_at,
            "version created"
        );
        Ok(())
    }

    pub fn get_version(&self, policy_id: &str, version_id: &str) -> Result<Option<Version>> {
        self.store
            .view(|txn| get_version_in(txn, policy_id, version_id))
    }

    pub fn get_latest_version(&self, policy_id: &str) -> Result<Option<Version>> {
        self.store
            .view(|txn| get_latest_version_in(txn, policy_id))
    }

    /// The most recent version created at or before `as_of`, or `None` when
    /// every version is newer.
    pub fn get_version_as_of(
        &self,
        policy_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Version>> {
        self.store.view(|txn| {
            let from = KeyEncoder::new(table::VERSION_TIME)
                .str(policy_id)
                .time(as_of)
                .finish_partial();
            let scan = txn.scan_rev(&from, ScanEnd::Prefix(time_prefix(policy_id)))?;

            let mut best: Option<Version> = None;
            for entry in scan {
                let (key, _) = entry?;
                let version = load_indexed(txn, policy_id, &key)?;
                if version.created_at > as_of {
                    continue;
                }
                let newer = match &best {
                    Some(b)
                        if version.created_at.timestamp_micros()
                            < b.created_at.timestamp_micros() =>
                    {
                        break;
                    }
                    Some(b) => version.created_at > b.created_at,
                    None => true,
                };
                if newer {
                    best = Some(version);
                }
            }
            Ok(best)
        })
    }

    /// Most recently created version carrying `tag`.
    pub fn get_version_by_tag(&self, policy_id: &str, tag: &str) -> Result<Option<Version>> {
        self.store
            .view(|txn| get_version_by_tag_in(txn, policy_id, tag))
    }

    /// Newest first, at most `limit` entries (0 for all).
    pub fn list_versions(&self, policy_id: &str, limit: usize) -> Result<Vec<Version>> {
        self.store
            .view(|txn| list_versions_in(txn, policy_id, limit, true))
    }

    /// Every version of the policy, oldest first.
    pub fn get_version_history(&self, policy_id: &str) -> Result<Vec<Version>> {
        self.store
            .view(|txn| list_versions_in(txn, policy_id, 0, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (TempDir, VersionStore) {
        let dir = tempdir().unwrap();
        let store = TreeStore::builder()
            .path(dir.path().join("versions.db"))
            .sync_on_commit(false)
            .open()
            .unwrap();
        (dir, VersionStore::new(store))
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
    }

    fn seed(versions: &VersionStore) {
        for (id, d, tag) in [("v1", 1, "draft"), ("v2", 10, "final"), ("v3", 20, "draft")] {
            versions
                .create_version(&Version::new("P", id, "doc").created_at(day(d)).tag(tag))
                .unwrap();
        }
    }

    #[test]
    fn as_of_picks_latest_not_after_date() {
        let (_dir, versions) = create_test_store();
        seed(&versions);

        let v = versions.get_version_as_of("P", day(5)).unwrap().unwrap();
        assert_eq!(v.version_id, "v1");
        let v = versions.get_version_as_of("P", day(10)).unwrap().unwrap();
        assert_eq!(v.version_id, "v2");
        let v = versions.get_version_as_of("P", day(31)).unwrap().unwrap();
        assert_eq!(v.version_id, "v3");
        assert!(versions
            .get_version_as_of("P", Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
            .unwrap()
            .is_none());
        assert!(versions.get_version_as_of("Q", day(31)).unwrap().is_none());
    }

    #[test]
    fn as_of_respects_sub_second_timestamps() {
        let (_dir, versions) = create_test_store();
        let base = day(1);
        let later = base + chrono::Duration::milliseconds(500);
        versions
            .create_version(&Version::new("P", "late", "doc").created_at(later))
            .unwrap();

        assert!(versions.get_version_as_of("P", base).unwrap().is_none());
        assert_eq!(
            versions
                .get_version_as_of("P", later)
                .unwrap()
                .unwrap()
                .version_id,
            "late"
        );
    }

    #[test]
    fn same_second_versions_order_by_creation_time() {
        let (_dir, versions) = create_test_store();
        let base = day(1);
        versions
            .create_version(
                &Version::new("P", "z", "doc")
                    .created_at(base + chrono::Duration::milliseconds(200)),
            )
            .unwrap();
        versions
            .create_version(
                &Version::new("P", "a", "doc")
                    .created_at(base + chrono::Duration::milliseconds(800)),
            )
            .unwrap();

        let as_of = base + chrono::Duration::milliseconds(900);
        assert_eq!(
            versions.get_version_as_of("P", as_of).unwrap().unwrap().version_id,
            "a"
        );
        let between = base + chrono::Duration::milliseconds(500);
        assert_eq!(
            versions.get_version_as_of("P", between).unwrap().unwrap().version_id,
            "z"
        );

        let history: Vec<_> = versions
            .get_version_history("P")
            .unwrap()
            .into_iter()
            .map(|v| v.version_id)
            .collect();
        assert_eq!(history, vec!["z", "a"]);
        assert_eq!(versions.list_versions("P", 1).unwrap()[0].version_id, "a");
    }

    #[test]
    fn versions_in_one_microsecond_resolve_on_full_timestamp() {
        let (_dir, versions) = create_test_store();
        let base = day(1);
        versions
            .create_version(
                &Version::new("P", "b", "doc")
                    .created_at(base + chrono::Duration::nanoseconds(100)),
            )
            .unwrap();
        versions
            .create_version(
                &Version::new("P", "c", "doc")
                    .created_at(base + chrono::Duration::nanoseconds(50)),
            )
            .unwrap();

        let found = versions
            .get_version_as_of("P", base + chrono::Duration::nanoseconds(900))
            .unwrap()
            .unwrap();
        assert_eq!(found.version_id, "b");
    }

    #[test]
    fn duplicate_version_is_conflict() {
        let (_dir, versions) = create_test_store();
        seed(&versions);

        let err = versions
            .create_version(&Version::new("P", "v1", "other"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::Conflict(_))
        ));
        assert_eq!(
            versions.get_version("P", "v1").unwrap().unwrap().document_id,
            "doc"
        );
    }

    #[test]
    fn latest_follows_creation_time() {
        let (_dir, versions) = create_test_store();
        seed(&versions);
        assert_eq!(
            versions.get_latest_version("P").unwrap().unwrap().version_id,
            "v3"
        );

        versions
            .create_version(&Version::new("P", "backfill", "doc").created_at(day(2)))
            .unwrap();
        assert_eq!(
            versions.get_latest_version("P").unwrap().unwrap().version_id,
            "v3"
        );
        assert!(versions.get_latest_version("Q").unwrap().is_none());
    }

    #[test]
    fn tag_lookup_prefers_newest() {
        let (_dir, versions) = create_test_store();
        seed(&versions);

        let draft = versions.get_version_by_tag("P", "draft").unwrap().unwrap();
        assert_eq!(draft.version_id, "v3");
        assert!(versions.get_version_by_tag("P", "gold").unwrap().is_none());
    }

    #[test]
    fn list_and_history_orders() {
        let (_dir, versions) = create_test_store();
        seed(&versions);

        let ids = |vs: Vec<Version>| vs.into_iter().map(|v| v.version_id).collect::<Vec<_>>();
        assert_eq!(ids(versions.list_versions("P", 0).unwrap()), ["v3", "v2", "v1"]);
        assert_eq!(ids(versions.list_versions("P", 2).unwrap()), ["v3", "v2"]);
        assert_eq!(
            ids(versions.get_version_history("P").unwrap()),
            ["v1", "v2", "v3"]
        );
    }
}
