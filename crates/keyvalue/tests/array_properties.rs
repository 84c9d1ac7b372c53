// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// Property tests for chunked-array ordering, range and tail reads

use proptest::prelude::*;
use tablekv_keyvalue::{ConnectionPool, KVConfig, KvStore, SaveArrayOptions, ValueKind};

async fn json_store() -> KvStore {
    store_on(&KVConfig::default()).await
}

async fn store_on(config: &KVConfig) -> KvStore {
    let pool = ConnectionPool::open(config).await.unwrap();
    KvStore::open(&pool, "props", ValueKind::Json).await.unwrap()
}

/// `(start, end)` with `start <= end <= total` from two arbitrary picks.
fn range_bounds(bounds: (usize, usize), total: usize) -> (usize, usize) {
    let (a, b) = (bounds.0 % (total + 1), bounds.1 % (total + 1));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Append every batch with `batch_size`, returning the expected concatenation.
async fn append_all(kv: &KvStore, batches: &[Vec<i64>], batch_size: usize) -> Vec<i64> {
    let mut expected = Vec::new();
    for batch in batches {
        kv.save_array("seq", batch, SaveArrayOptions::with_batch_size(batch_size))
            .await
            .unwrap();
        expected.extend_from_slice(batch);
    }
    expected
}

fn batches() -> impl Strategy<Value = Vec<Vec<i64>>> {
    proptest::collection::vec(proptest::collection::vec(any::<i64>(), 0..20), 1..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn should_preserve_insertion_order(batches in batches(), batch_size in 1usize..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (all, expected, meta) = rt.block_on(async {
            let kv = json_store().await;
            let expected = append_all(&kv, &batches, batch_size).await;
            let all: Vec<i64> = kv.get_all_array("seq").await.unwrap();
            let meta = kv.get_array_meta("seq").await.unwrap().unwrap();
            (all, expected, meta)
        });

        prop_assert_eq!(&all, &expected);
        prop_assert_eq!(meta.total_items, expected.len() as u64);
        prop_assert_eq!(
            meta.batch_count,
            expected.len().div_ceil(batch_size) as u64
        );
    }

    #[test]
    fn should_range_equal_slice(
        batches in batches(),
        batch_size in 1usize..8,
        bounds in (0usize..200, 0usize..200),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (range, expected, start, end) = rt.block_on(async {
            let kv = json_store().await;
            let expected = append_all(&kv, &batches, batch_size).await;
            let (start, end) = range_bounds(bounds, expected.len());
            let range: Vec<i64> = kv.get_array_range("seq", start, end).await.unwrap();
            (range, expected, start, end)
        });

        prop_assert_eq!(&range[..], &expected[start..end]);
    }

    #[test]
    fn should_tail_equal_slice(
        batches in batches(),
        batch_size in 1usize..8,
        picks in (0usize..200, 0usize..200),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (tail, expected, count, offset) = rt.block_on(async {
            let kv = json_store().await;
            let expected = append_all(&kv, &batches, batch_size).await;
            let total = expected.len();
            let offset = picks.0 % (total + 1);
            let count = picks.1 % (total - offset + 1);
            let tail: Vec<i64> = kv.get_recent_array("seq", count, offset).await.unwrap();
            (tail, expected, count, offset)
        });

        let total = expected.len();
        prop_assert_eq!(&tail[..], &expected[total - offset - count..total - offset]);
    }

    #[test]
    fn should_rebuild_preserve_content(
        batches in batches(),
        batch_size in 1usize..8,
        new_size in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (before, after, meta) = rt.block_on(async {
            let kv = json_store().await;
            append_all(&kv, &batches, batch_size).await;
            let before: Vec<i64> = kv.get_all_array("seq").await.unwrap();
            let empty: Vec<i64> = Vec::new();
            let summary = kv
                .save_array(
                    "seq",
                    &empty,
                    SaveArrayOptions::with_batch_size(new_size).force_rebatch(true),
                )
                .await
                .unwrap();
            let after: Vec<i64> = kv.get_all_array("seq").await.unwrap();
            (before, after, summary.meta)
        });

        prop_assert_eq!(&after, &before);
        prop_assert_eq!(meta.total_items, before.len() as u64);
        prop_assert_eq!(meta.batch_count, before.len().div_ceil(new_size) as u64);
    }
}

#[cfg(feature = "sql-backend")]
mod sqlite {
    use super::*;
    use tablekv_keyvalue::BackendType;

    fn sqlite_config() -> KVConfig {
        KVConfig::new(BackendType::Sqlite {
            path: ":memory:".to_string(),
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn should_range_equal_slice_on_sqlite(
            batches in batches(),
            batch_size in 1usize..8,
            bounds in (0usize..200, 0usize..200),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (range, expected, start, end) = rt.block_on(async {
                let kv = store_on(&sqlite_config()).await;
                let expected = append_all(&kv, &batches, batch_size).await;
                let (start, end) = range_bounds(bounds, expected.len());
                let range: Vec<i64> = kv.get_array_range("seq", start, end).await.unwrap();
                (range, expected, start, end)
            });

            prop_assert_eq!(&range[..], &expected[start..end]);
        }

        #[test]
        fn should_tail_equal_slice_on_sqlite(
            batches in batches(),
            batch_size in 1usize..8,
            picks in (0usize..200, 0usize..200),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (tail, expected, count, offset) = rt.block_on(async {
                let kv = store_on(&sqlite_config()).await;
                let expected = append_all(&kv, &batches, batch_size).await;
                let total = expected.len();
                let offset = picks.0 % (total + 1);
                let count = picks.1 % (total - offset + 1);
                let tail: Vec<i64> = kv.get_recent_array("seq", count, offset).await.unwrap();
                (tail, expected, count, offset)
            });

            let total = expected.len();
            prop_assert_eq!(&tail[..], &expected[total - offset - count..total - offset]);
        }
    }
}
