// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of TableKV.
//
// TableKV is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// TableKV is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with TableKV. If not, see <https://www.gnu.org/licenses/>.

//! SQLite table backend.

use super::{validate_table_name, Dialect, SqlParam, Statements, IN_LIST_CHUNK};
use crate::codec::{now_millis, timestamp_from_millis, KvEntry, KvValue, ValueKind};
use crate::config::RetryPolicy;
use crate::merge::deep_merge_into;
use crate::retry::with_busy_retry;
use crate::scan::ScanQuery;
use crate::{KVError, KVResult, KvBackend, KvTransaction};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Pool, Row, Sqlite, Transaction};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

// Takes the write lock up front; a deferred transaction that reads first
// cannot upgrade once another connection has committed.
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &KvValue) -> SqliteQuery<'q> {
    match value {
        KvValue::Json(v) => query.bind(v.to_string()),
        KvValue::Text(s) => query.bind(s.clone()),
        KvValue::Binary(b) => query.bind(b.clone()),
        KvValue::Number(n) => query.bind(*n),
        KvValue::Boolean(b) => query.bind(*b),
    }
}

fn bind_param<'q>(query: SqliteQuery<'q>, param: &SqlParam) -> SqliteQuery<'q> {
    match param {
        SqlParam::Text(s) => query.bind(s.clone()),
        SqlParam::Int(i) => query.bind(*i),
        // Only produced for PostgreSQL
        SqlParam::TextArray(items) => query.bind(serde_json::Value::from(items.clone()).to_string()),
        SqlParam::Value(value) => bind_value(query, value),
    }
}

fn decode_value(kind: ValueKind, row: &SqliteRow) -> KVResult<KvValue> {
    Ok(match kind {
        ValueKind::Json => {
            let text: String = row.try_get("value")?;
            KvValue::Json(serde_json::from_str(&text)?)
        }
        ValueKind::Text => KvValue::Text(row.try_get("value")?),
        ValueKind::Binary => KvValue::Binary(row.try_get("value")?),
        ValueKind::Number => KvValue::Number(row.try_get("value")?),
        ValueKind::Boolean => KvValue::Boolean(row.try_get("value")?),
    })
}

fn decode_entry(kind: ValueKind, row: &SqliteRow) -> KVResult<KvEntry> {
    Ok(KvEntry {
        key: row.try_get("key")?,
        value: decode_value(kind, row)?,
        created_at: timestamp_from_millis(row.try_get("created_at")?),
        updated_at: timestamp_from_millis(row.try_get("updated_at")?),
    })
}

/// SQLite-backed table.
///
/// ## Example
/// ```rust,no_run
/// use tablekv_keyvalue::{KvBackend, RetryPolicy, SqliteTable, ValueKind};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = sqlx::SqlitePool::connect("sqlite::memory:").await?;
/// let table = SqliteTable::open(pool, "settings", ValueKind::Text, RetryPolicy::default()).await?;
///
/// table.put("key", &"value".into()).await?;
/// assert!(table.get("key").await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteTable {
    pool: Pool<Sqlite>,
    kind: ValueKind,
    statements: Arc<Statements>,
    retry: RetryPolicy,
}

impl SqliteTable {
    /// Open `table` on `pool`, creating it if it does not exist.
    pub async fn open(
        pool: Pool<Sqlite>,
        table: &str,
        kind: ValueKind,
        retry: RetryPolicy,
    ) -> KVResult<Self> {
        validate_table_name(table)?;
        let statements = Statements::new(Dialect::Sqlite, table, kind);
        for ddl in &statements.create {
            sqlx::query(ddl).execute(&pool).await?;
        }
        debug!(table = %table, kind = %kind, "Opened SQLite table");

        Ok(Self {
            pool,
            kind,
            statements: Arc::new(statements),
            retry,
        })
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, f: F) -> KVResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KVResult<T>>,
    {
        with_busy_retry(&self.retry, operation, f).await
    }

    async fn write(&self, operation: &str, sql: &str, key: &str, value: &KvValue) -> KVResult<u64> {
        let pool = &self.pool;
        self.retrying(operation, move || async move {
            let now = now_millis();
            let query = bind_value(sqlx::query(sql).bind(key.to_string()), value);
            let result = query.bind(now).bind(now).execute(pool).await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[async_trait]
impl KvBackend for SqliteTable {
    fn table(&self) -> &str {
        &self.statements.table
    }

    fn kind(&self) -> ValueKind {
        self.kind
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }

    async fn get(&self, key: &str) -> KVResult<Option<KvEntry>> {
        let (pool, sql, kind) = (&self.pool, &self.statements.select_one, self.kind);
        self.retrying("get", move || async move {
            let row = sqlx::query(sql)
                .bind(key.to_string())
                .fetch_optional(pool)
                .await?;
            row.map(|row| decode_entry(kind, &row)).transpose()
        })
        .await
    }

    async fn get_many(&self, keys: &[String]) -> KVResult<Vec<KvEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(IN_LIST_CHUNK) {
            let sql = self.statements.select_many(chunk.len());
            let (pool, sql, kind) = (&self.pool, &sql, self.kind);
            let rows = self
                .retrying("get_many", move || async move {
                    let mut query = sqlx::query(sql);
                    for key in chunk {
                        query = query.bind(key.clone());
                    }
                    Ok(query.fetch_all(pool).await?)
                })
                .await?;
            for row in &rows {
                entries.push(decode_entry(kind, row)?);
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self, value), fields(table = %self.statements.table))]
    async fn put(&self, key: &str, value: &KvValue) -> KVResult<()> {
        self.write("put", &self.statements.upsert, key, value).await?;
        Ok(())
    }

    async fn insert(&self, key: &str, value: &KvValue) -> KVResult<bool> {
        let inserted = self.write("insert", &self.statements.insert_new, key, value).await?;
        Ok(inserted == 1)
    }

    async fn delete_many(&self, keys: &[String]) -> KVResult<u64> {
        let mut deleted = 0;
        for chunk in keys.chunks(IN_LIST_CHUNK) {
            let sql = self.statements.delete_many(chunk.len());
            let (pool, sql) = (&self.pool, &sql);
            deleted += self
                .retrying("delete_many", move || async move {
                    let mut query = sqlx::query(sql);
                    for key in chunk {
                        query = query.bind(key.clone());
                    }
                    Ok(query.execute(pool).await?.rows_affected())
                })
                .await?;
        }
        Ok(deleted)
    }

    async fn clear(&self) -> KVResult<u64> {
        let (pool, sql) = (&self.pool, &self.statements.clear);
        self.retrying("clear", move || async move {
            Ok(sqlx::query(sql).execute(pool).await?.rows_affected())
        })
        .await
    }

    async fn count(&self) -> KVResult<u64> {
        let (pool, sql) = (&self.pool, &self.statements.count);
        self.retrying("count", move || async move {
            let count: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
            Ok(count as u64)
        })
        .await
    }

    async fn scan(&self, query: &ScanQuery) -> KVResult<Vec<KvEntry>> {
        // Object and array targets are compared decoded, with paging after the filter
        let exact = query.value_filter.as_ref().filter(|f| f.compares_container());
        let (sql, params) = match exact {
            Some(_) => self.statements.scan(&query.clone().with_page(None, 0))?,
            None => self.statements.scan(query)?,
        };
        let (pool, sql, params, kind) = (&self.pool, &sql, &params, self.kind);
        let rows = self
            .retrying("scan", move || async move {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_param(query, param);
                }
                Ok(query.fetch_all(pool).await?)
            })
            .await?;
        let entries = rows
            .iter()
            .map(|row| decode_entry(kind, row))
            .collect::<KVResult<Vec<_>>>()?;
        Ok(match exact {
            Some(filter) => entries
                .into_iter()
                .filter(|entry| filter.matches(&entry.value))
                .skip(query.offset)
                .take(query.limit.unwrap_or(usize::MAX))
                .collect(),
            None => entries,
        })
    }

    /// Read, merge with [`deep_merge_into`] and write back under one
    /// `BEGIN IMMEDIATE` transaction, so the write lock is held from the read.
    #[instrument(skip(self, partial), fields(table = %self.statements.table))]
    async fn merge_json(&self, key: &str, partial: &serde_json::Value) -> KVResult<()> {
        let (pool, statements) = (&self.pool, &self.statements);
        self.retrying("merge", move || async move {
            let mut tx = pool.begin_with(BEGIN_IMMEDIATE).await?;
            let row = sqlx::query(&statements.select_one)
                .bind(key.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            let merged = match row {
                Some(row) => {
                    let text: String = row.try_get("value")?;
                    let mut doc: serde_json::Value = serde_json::from_str(&text)?;
                    deep_merge_into(&mut doc, partial.clone());
                    doc
                }
                None => partial.clone(),
            };
            let now = now_millis();
            bind_value(
                sqlx::query(&statements.upsert).bind(key.to_string()),
                &KvValue::Json(merged),
            )
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn begin(&self) -> KVResult<Box<dyn KvTransaction>> {
        let pool = &self.pool;
        let tx = self
            .retrying("begin", move || async move {
                Ok(pool.begin_with(BEGIN_IMMEDIATE).await?)
            })
            .await?;
        Ok(Box::new(SqliteTransaction {
            tx,
            kind: self.kind,
            statements: self.statements.clone(),
        }))
    }
}

/// Transaction over one SQLite table. Dropping it without commit rolls back.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    kind: ValueKind,
    statements: Arc<Statements>,
}

#[async_trait]
impl KvTransaction for SqliteTransaction {
    async fn get(&mut self, key: &str) -> KVResult<Option<KvValue>> {
        let row = sqlx::query(&self.statements.select_one)
            .bind(key.to_string())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|row| decode_value(self.kind, &row)).transpose()
    }

    async fn get_many(&mut self, keys: &[String]) -> KVResult<Vec<(String, KvValue)>> {
        let mut found = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(IN_LIST_CHUNK) {
            let sql = self.statements.select_many(chunk.len());
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key.clone());
            }
            for row in query.fetch_all(&mut *self.tx).await? {
                found.push((row.try_get("key")?, decode_value(self.kind, &row)?));
            }
        }
        Ok(found)
    }

    async fn put(&mut self, key: &str, value: &KvValue) -> KVResult<()> {
        let now = now_millis();
        bind_value(
            sqlx::query(&self.statements.upsert).bind(key.to_string()),
            value,
        )
        .bind(now)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_many(&mut self, keys: &[String]) -> KVResult<u64> {
        let mut deleted = 0;
        for chunk in keys.chunks(IN_LIST_CHUNK) {
            let sql = self.statements.delete_many(chunk.len());
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key.clone());
            }
            deleted += query.execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> KVResult<()> {
        self.tx.commit().await.map_err(KVError::from)
    }

    async fn rollback(self: Box<Self>) -> KVResult<()> {
        self.tx.rollback().await.map_err(KVError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{KeyRange, ValueFilter};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn table(kind: ValueKind) -> SqliteTable {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteTable::open(pool, "test_kv", kind, RetryPolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_basic_operations() {
        let kv = table(ValueKind::Text).await;

        kv.put("key1", &"value1".into()).await.unwrap();
        let entry = kv.get("key1").await.unwrap().unwrap();
        assert_eq!(entry.value, KvValue::Text("value1".to_string()));

        assert!(!kv.insert("key1", &"again".into()).await.unwrap());
        assert!(kv.insert("key2", &"two".into()).await.unwrap());
        assert_eq!(kv.count().await.unwrap(), 2);

        let deleted = kv
            .delete_many(&["key1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(kv.clear().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_overwrite_preserves_created_at() {
        let kv = table(ValueKind::Number).await;
        kv.put("n", &KvValue::Number(1.0)).await.unwrap();
        let first = kv.get("n").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        kv.put("n", &KvValue::Number(2.5)).await.unwrap();
        let second = kv.get("n").await.unwrap().unwrap();

        assert_eq!(second.value, KvValue::Number(2.5));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn test_sqlite_native_kinds() {
        let kv = table(ValueKind::Binary).await;
        kv.put("b", &KvValue::Binary(vec![0, 159, 146, 150])).await.unwrap();
        assert_eq!(
            kv.get("b").await.unwrap().unwrap().value,
            KvValue::Binary(vec![0, 159, 146, 150])
        );

        let kv = table(ValueKind::Boolean).await;
        kv.put("flag", &KvValue::Boolean(true)).await.unwrap();
        assert_eq!(kv.get("flag").await.unwrap().unwrap().value, KvValue::Boolean(true));
    }

    #[tokio::test]
    async fn test_sqlite_prefix_scan_is_bytewise() {
        let kv = table(ValueKind::Text).await;
        for key in ["user:", "user:a", "user:\u{ffff}", "user;", "usera", "use"] {
            kv.put(key, &"x".into()).await.unwrap();
        }
        let query = ScanQuery::all().with_range(KeyRange::prefix("user:"));
        let keys: Vec<String> = kv
            .scan(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["user:", "user:a", "user:\u{ffff}"]);
    }

    #[tokio::test]
    async fn test_sqlite_merge_is_recursive_and_keeps_nulls() {
        let kv = table(ValueKind::Json).await;
        kv.merge_json("doc", &json!({"a": {"x": 1}})).await.unwrap();
        kv.merge_json("doc", &json!({"a": {"y": 2}, "b": [1]})).await.unwrap();
        assert_eq!(
            kv.get("doc").await.unwrap().unwrap().value,
            KvValue::Json(json!({"a": {"x": 1, "y": 2}, "b": [1]}))
        );

        kv.merge_json("doc", &json!({"a": {"x": null}, "b": null})).await.unwrap();
        assert_eq!(
            kv.get("doc").await.unwrap().unwrap().value,
            KvValue::Json(json!({"a": {"x": null, "y": 2}, "b": null}))
        );
    }

    #[tokio::test]
    async fn test_sqlite_container_filter_ignores_stored_key_order() {
        let kv = table(ValueKind::Json).await;
        for (key, doc) in [
            ("a", r#"{"tags":{"y":2,"x":1}}"#),
            ("b", r#"{"tags":{"x":1,"y":2}}"#),
            ("c", r#"{"tags":{"x":1}}"#),
            ("d", r#"{"tags":{"x":1,"y":2}}"#),
        ] {
            sqlx::query("INSERT INTO test_kv (key, value, created_at, updated_at) VALUES (?, ?, 0, 0)")
                .bind(key)
                .bind(doc)
                .execute(&kv.pool)
                .await
                .unwrap();
        }

        let filter = ValueFilter::JsonEquals {
            path: vec!["tags".to_string()],
            value: json!({"x": 1, "y": 2}),
        };
        let query = ScanQuery::all().with_value_filter(filter);
        let keys: Vec<String> = kv.scan(&query).await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b", "d"]);

        let page = kv.scan(&query.with_page(Some(1), 1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, "b");
    }

    #[tokio::test]
    async fn test_sqlite_transaction_sees_own_writes_and_rolls_back() {
        let kv = table(ValueKind::Text).await;
        let mut tx = kv.begin().await.unwrap();
        tx.put("a", &"1".into()).await.unwrap();
        assert_eq!(tx.get("a").await.unwrap(), Some("1".into()));
        tx.rollback().await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());

        let mut tx = kv.begin().await.unwrap();
        tx.put("a", &"1".into()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(kv.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_rejects_bad_table_name() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let result = SqliteTable::open(pool, "bad name", ValueKind::Text, RetryPolicy::default()).await;
        assert!(matches!(result, Err(KVError::InvalidArgument(_))));
    }
}
