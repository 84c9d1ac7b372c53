// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// Integration tests for the KvStore facade on the in-memory backend

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tablekv_keyvalue::{
    ConnectionPool, KVConfig, KVError, KvStore, KvValue, StoreOperation, ValueKind,
};

async fn open(kind: ValueKind) -> (ConnectionPool, KvStore) {
    let pool = ConnectionPool::open(&KVConfig::default()).await.unwrap();
    let kv = KvStore::open(&pool, "store", kind).await.unwrap();
    (pool, kv)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    city: String,
    active: bool,
}

#[tokio::test]
async fn test_basic_operations() {
    let (_pool, kv) = open(ValueKind::Text).await;

    kv.put("b", "2").await.unwrap();
    kv.put("a", "1").await.unwrap();
    kv.put("c", "3").await.unwrap();
    assert_eq!(kv.get("a").await.unwrap(), Some(KvValue::Text("1".to_string())));
    assert_eq!(kv.get("missing").await.unwrap(), None);
    assert!(kv.has("b").await.unwrap());
    assert_eq!(kv.keys().await.unwrap(), vec!["a", "b", "c"]);
    assert_eq!(kv.count().await.unwrap(), 3);

    // Overwrite keeps created_at, moves updated_at
    let before = kv.get_entry("a").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    kv.put("a", "one").await.unwrap();
    let after = kv.get_entry("a").await.unwrap().unwrap();
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);

    assert!(kv.delete("a").await.unwrap());
    assert!(!kv.delete("a").await.unwrap());
    assert_eq!(kv.delete_many(&["b", "zzz"]).await.unwrap(), 1);
    assert_eq!(kv.clear().await.unwrap(), 1);
    assert_eq!(kv.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_add_rejects_existing_key() {
    let (_pool, kv) = open(ValueKind::Number).await;
    kv.add("n", 1i64).await.unwrap();

    let err = kv.add("n", 2i64).await.unwrap_err();
    assert!(matches!(err, KVError::DuplicateKey(ref key) if key == "n"));
    assert_eq!(kv.get("n").await.unwrap(), Some(KvValue::Number(1.0)));
}

#[tokio::test]
async fn test_many_preserves_input_order() {
    let (_pool, kv) = open(ValueKind::Text).await;
    kv.put_many(vec![("x", "1"), ("y", "2"), ("z", "3")])
        .await
        .unwrap();

    let values = kv.get_many(&["z", "nope", "x"]).await.unwrap();
    assert_eq!(
        values,
        vec![
            Some(KvValue::Text("3".to_string())),
            None,
            Some(KvValue::Text("1".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_put_many_validates_before_writing() {
    let (_pool, kv) = open(ValueKind::Text).await;
    let err = kv
        .put_many(vec![
            ("ok", KvValue::from("fine")),
            ("bad", KvValue::from(true)),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, KVError::InvalidValue(_)));
    assert_eq!(kv.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_kind_mismatch_is_rejected() {
    let (_pool, kv) = open(ValueKind::Binary).await;
    kv.put("blob", vec![0u8, 1, 2]).await.unwrap();
    assert!(matches!(
        kv.put("blob", "text").await,
        Err(KVError::InvalidValue(_))
    ));

    let err = kv.merge("blob", json!({})).await.unwrap_err();
    match err {
        KVError::TypeUnsupported { kind, operation } => {
            assert_eq!(kind, ValueKind::Binary);
            assert_eq!(operation, StoreOperation::Merge);
        }
        other => panic!("expected TypeUnsupported, got {:?}", other),
    }
    assert!(matches!(
        kv.search_json("a", json!(1)).await,
        Err(KVError::TypeUnsupported { .. })
    ));
}

#[tokio::test]
async fn test_reopen_with_other_kind_fails() {
    let (pool, _kv) = open(ValueKind::Text).await;
    let result = KvStore::open(&pool, "store", ValueKind::Json).await;
    assert!(matches!(result, Err(KVError::ConfigError(_))));
}

#[tokio::test]
async fn test_get_fresh_expires_stale_entries() {
    let (_pool, kv) = open(ValueKind::Text).await;
    kv.put("session", "abc").await.unwrap();

    assert_eq!(
        kv.get_fresh("session", Duration::from_secs(60)).await.unwrap(),
        Some(KvValue::Text("abc".to_string()))
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        kv.get_fresh("session", Duration::from_millis(5)).await.unwrap(),
        None
    );
    assert!(!kv.has("session").await.unwrap());
}

#[tokio::test]
async fn test_merge_is_recursive() {
    let (_pool, kv) = open(ValueKind::Json).await;
    kv.put("cfg", json!({"a": {"x": 1}, "keep": true})).await.unwrap();
    kv.merge("cfg", json!({"a": {"y": 2}})).await.unwrap();
    assert_eq!(
        kv.get_json::<serde_json::Value>("cfg").await.unwrap(),
        Some(json!({"a": {"x": 1, "y": 2}, "keep": true}))
    );

    // Non-object values are replaced
    kv.merge("cfg", json!({"a": [1, 2], "keep": "yes"})).await.unwrap();
    assert_eq!(
        kv.get_json::<serde_json::Value>("cfg").await.unwrap(),
        Some(json!({"a": [1, 2], "keep": "yes"}))
    );

    // Absent keys are created
    kv.merge("fresh", json!({"n": 1})).await.unwrap();
    assert_eq!(
        kv.get("fresh").await.unwrap(),
        Some(KvValue::Json(json!({"n": 1})))
    );
}

#[tokio::test]
async fn test_typed_json_helpers() {
    let (_pool, kv) = open(ValueKind::Json).await;
    let profile = Profile {
        name: "ada".to_string(),
        city: "London".to_string(),
        active: true,
    };
    kv.put_json("user:1", &profile).await.unwrap();
    assert_eq!(kv.get_json::<Profile>("user:1").await.unwrap(), Some(profile));
    assert_eq!(kv.get_json::<Profile>("user:2").await.unwrap(), None);
}

#[tokio::test]
async fn test_search_json() {
    let (_pool, kv) = open(ValueKind::Json).await;
    kv.put("u1", json!({"profile": {"city": "Paris"}, "age": 30}))
        .await
        .unwrap();
    kv.put("u2", json!({"profile": {"city": "Rome"}, "age": 30}))
        .await
        .unwrap();
    kv.put("u3", json!({"profile": {"city": "Paris"}, "age": 41}))
        .await
        .unwrap();

    let paris = kv.search_json("profile.city", json!("Paris")).await.unwrap();
    let keys: Vec<_> = paris.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["u1", "u3"]);

    let thirty = kv.search_json("age", json!(30)).await.unwrap();
    assert_eq!(thirty.len(), 2);

    let none = kv.search_json("profile.zip", json!("75001")).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_search_by_time() {
    let (_pool, kv) = open(ValueKind::Json).await;
    kv.put("old", json!({"t": "x"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let cutoff = Utc::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    kv.put("new", json!({"t": "x"})).await.unwrap();

    let recent = kv.search_by_time(Some(cutoff), None).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].key, "new");

    let early = kv.search_by_time(None, Some(cutoff)).await.unwrap();
    assert_eq!(early.len(), 1);
    assert_eq!(early[0].key, "old");

    let both = kv
        .search_json_by_time("t", json!("x"), Some(cutoff - ChronoDuration::hours(1)), None)
        .await
        .unwrap();
    assert_eq!(both.len(), 2);

    let later = kv
        .search_json_by_time("t", json!("x"), Some(cutoff), Some(Utc::now()))
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
}

#[tokio::test]
async fn test_find_bool_values() {
    let (_pool, kv) = open(ValueKind::Boolean).await;
    kv.put("a", true).await.unwrap();
    kv.put("b", false).await.unwrap();
    kv.put("c", true).await.unwrap();

    let on = kv.find_bool_values(true).await.unwrap();
    let keys: Vec<_> = on.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "c"]);
    assert_eq!(kv.find_bool_values(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_search_by_time_on_text_store() {
    let (_pool, kv) = open(ValueKind::Text).await;
    kv.put("a", "x").await.unwrap();
    assert_eq!(kv.search_by_time(None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_closed_pool_rejects_open() {
    let (pool, kv) = open(ValueKind::Text).await;
    pool.close().await;
    assert!(matches!(
        KvStore::open(&pool, "other", ValueKind::Text).await,
        Err(KVError::PoolClosed)
    ));
    // Already opened in-memory tables keep working
    kv.put("k", "v").await.unwrap();
}
