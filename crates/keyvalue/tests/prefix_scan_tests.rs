// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// Integration tests for prefix range scans and key-pattern queries

use chrono::Utc;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;
use tablekv_keyvalue::{
    ConnectionPool, KVConfig, KvEntry, KvStore, PatternScanOptions, PrefixScanOptions, ScanOrder,
    TimeBounds, ValueKind,
};

async fn text_store() -> KvStore {
    let pool = ConnectionPool::open(&KVConfig::default()).await.unwrap();
    KvStore::open(&pool, "scan", ValueKind::Text).await.unwrap()
}

fn keys(entries: &[KvEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.key.as_str()).collect()
}

async fn seed(kv: &KvStore) {
    for key in [
        "user", "user:", "user:alice", "user:bob", "user:carol", "user;x", "usera", "admin:root",
        "user:\u{fff0}edge",
    ] {
        kv.put(key, "v").await.unwrap();
    }
}

#[tokio::test]
async fn test_prefix_scan_bounds() {
    let kv = text_store().await;
    seed(&kv).await;

    let found = kv
        .get_with_prefix("user:", &PrefixScanOptions::default())
        .await
        .unwrap();
    assert_eq!(
        keys(&found),
        vec!["user:", "user:alice", "user:bob", "user:carol", "user:\u{fff0}edge"]
    );
}

#[tokio::test]
async fn test_prefix_scan_order_and_paging() {
    let kv = text_store().await;
    seed(&kv).await;

    let options = PrefixScanOptions {
        order: ScanOrder::Descending,
        limit: Some(2),
        offset: 1,
        ..Default::default()
    };
    let found = kv.get_with_prefix("user:", &options).await.unwrap();
    assert_eq!(keys(&found), vec!["user:carol", "user:bob"]);
}

#[tokio::test]
async fn test_prefix_scan_post_filter_pages_after_filtering() {
    let kv = text_store().await;
    for i in 0..10 {
        let tag = if i % 2 == 0 { "even" } else { "odd" };
        kv.put(&format!("log:{}:{}", i, tag), "v").await.unwrap();
    }

    let options = PrefixScanOptions {
        contains: Some("even".to_string()),
        limit: Some(2),
        offset: 1,
        ..Default::default()
    };
    let found = kv.get_with_prefix("log:", &options).await.unwrap();
    assert_eq!(keys(&found), vec!["log:2:even", "log:4:even"]);
}

#[tokio::test]
async fn test_prefix_scan_created_filter() {
    let kv = text_store().await;
    kv.put("evt:1", "v").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let cutoff = Utc::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    kv.put("evt:2", "v").await.unwrap();

    let options = PrefixScanOptions {
        created: TimeBounds::new(Some(cutoff), None),
        ..Default::default()
    };
    let found = kv.get_with_prefix("evt:", &options).await.unwrap();
    assert_eq!(keys(&found), vec!["evt:2"]);
}

#[tokio::test]
async fn test_contains_and_suffix() {
    let kv = text_store().await;
    for key in ["app:Log:1", "app:log:2", "db:log:3", "cache.json", "CONFIG.JSON"] {
        kv.put(key, "v").await.unwrap();
    }

    let sensitive = kv
        .get_with_contains("log", &PatternScanOptions::default())
        .await
        .unwrap();
    assert_eq!(keys(&sensitive), vec!["app:log:2", "db:log:3"]);

    let insensitive = kv
        .get_with_contains(
            "LOG",
            &PatternScanOptions {
                case_insensitive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(insensitive.len(), 3);

    let json = kv
        .get_with_suffix(".json", &PatternScanOptions::default())
        .await
        .unwrap();
    assert_eq!(keys(&json), vec!["cache.json"]);

    let any_json = kv
        .get_with_suffix(
            ".json",
            &PatternScanOptions {
                case_insensitive: true,
                order: ScanOrder::Descending,
                limit: Some(1),
                offset: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(keys(&any_json), vec!["cache.json"]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn should_prefix_scan_equal_filtered_full_scan(
        prefix in "[a-c:]{1,3}",
        stored in proptest::collection::btree_set("[a-c:;]{0,6}", 0..30),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (scanned, expected) = rt.block_on(async {
            let kv = text_store().await;
            for key in stored.iter().filter(|k| !k.is_empty()) {
                kv.put(key, "v").await.unwrap();
            }
            let scanned: Vec<String> = kv
                .get_with_prefix(&prefix, &PrefixScanOptions::default())
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.key)
                .collect();
            let expected: Vec<String> = kv
                .keys()
                .await
                .unwrap()
                .into_iter()
                .filter(|k| k.starts_with(prefix.as_str()))
                .collect();
            (scanned, expected)
        });

        prop_assert_eq!(&scanned, &expected);
        let unique: BTreeSet<&String> = scanned.iter().collect();
        prop_assert_eq!(unique.len(), scanned.len());
    }
}
