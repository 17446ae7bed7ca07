//! # B+Tree Property Tests
//!
//! Random insert/delete workloads are replayed against a `BTreeMap` model.
//! Every single insert or delete is followed by the structural check on the
//! uncommitted tree, every commit by the check on the stored tree, and the
//! final tree must hold exactly the model's entries in order. Composite keys must sort the same
//! way as the field tuples they encode.

use std::collections::BTreeMap;

use proptest::prelude::*;
use treestore::encoding::{table, KeyEncoder};
use treestore::{KvRead, TreeStore};

#[derive(Debug, Clone)]
enum Op {
    Insert(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"abcde".to_vec()), 1..40)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key_strategy(), prop::collection::vec(any::<u8>(), 0..400))
            .prop_map(|(k, v)| Op::Insert(k, v)),
        1 => key_strategy().prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tree_matches_model(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::builder()
            .path(dir.path().join("prop.db"))
            .sync_on_commit(false)
            .open()
            .unwrap();
        let mut model = BTreeMap::new();

        for chunk in ops.chunks(25) {
            store
                .update(|txn| {
                    for op in chunk {
                        match op {
                            Op::Insert(k, v) => {
                                txn.insert(k, v)?;
                                model.insert(k.clone(), v.clone());
                                assert_eq!(txn.get(k)?.as_ref(), Some(v));
                            }
                            Op::Delete(k) => {
                                let existed = txn.delete(k)?;
                                assert_eq!(existed, model.remove(k).is_some());
                                assert_eq!(txn.get(k)?, None);
                            }
                        }
                        let stats = txn.check()?;
                        assert_eq!(stats.keys, model.len());
                    }
                    Ok(())
                })
                .unwrap();

            let stats = store.check_integrity().unwrap();
            prop_assert_eq!(stats.keys, model.len());
        }

        let rows = store.range_scan(b"\x00", b"\xff").unwrap();
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(&rows, &expected);
    }

    #[test]
    fn composite_keys_sort_like_tuples(
        a in (".{0,12}", any::<i64>(), any::<u64>()),
        b in (".{0,12}", any::<i64>(), any::<u64>()),
    ) {
        let encode = |(s, i, u): &(String, i64, u64)| {
            KeyEncoder::new(table::NODE).str(s).int64(*i).uint64(*u).finish()
        };
        prop_assert_eq!(encode(&a).cmp(&encode(&b)), a.cmp(&b));
    }

    #[test]
    fn partial_key_bounds_every_extension(
        prefix in "[a-z\\x00\\x01]{0,8}",
        suffix in any::<i64>(),
    ) {
        let partial = KeyEncoder::new(table::PATH).str(&prefix).finish_partial();
        let full = KeyEncoder::new(table::PATH).str(&prefix).int64(suffix).finish();
        let bare = KeyEncoder::new(table::PATH).str(&prefix).finish();

        prop_assert!(full.starts_with(&bare));
        prop_assert!(full < partial);
    }
}
