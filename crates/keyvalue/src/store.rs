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

//! Per-table store facade.
//!
//! ## Purpose
//! [`KvStore`] binds one table to one [`ValueKind`] and exposes every
//! operation: basic KV, deep merge, key-pattern queries, chunked arrays and
//! value-predicate searches. Kind checks run before any I/O.

use crate::array::{ArrayMeta, ArrayWriteSummary, ChunkedArrayStore, SaveArrayOptions};
use crate::codec::{KvEntry, KvValue, StoreOperation, ValueCodec, ValueKind};
use crate::pool::ConnectionPool;
use crate::scan::{
    PatternScanOptions, PrefixRangeScanner, PrefixScanOptions, ScanQuery, TimeBounds, ValueFilter,
};
use crate::{begin_transaction, finish_transaction, KVError, KVResult, KvBackend, KvTransaction};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Storage statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVStats {
    /// Total number of keys in the table
    pub total_keys: usize,
    /// Total value size in bytes (approximate)
    pub total_size_bytes: usize,
    /// Backend type (e.g., "InMemory", "SQLite", "PostgreSQL")
    pub backend_type: String,
}

fn validate_key(key: &str) -> KVResult<()> {
    if key.is_empty() {
        return Err(KVError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}

/// `"profile.city"` -> `["profile", "city"]`; `""` is the document root.
fn json_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').map(str::to_string).collect()
    }
}

/// Stored value as JSON, for the typed helpers.
fn value_to_json(value: KvValue) -> KVResult<Value> {
    match value {
        KvValue::Json(v) => Ok(v),
        KvValue::Text(s) => Ok(Value::String(s)),
        KvValue::Boolean(b) => Ok(Value::Bool(b)),
        KvValue::Number(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| KVError::InvalidValue(format!("number {} has no JSON form", n))),
        KvValue::Binary(_) => Err(KVError::InvalidValue(
            "binary values have no JSON form".to_string(),
        )),
    }
}

/// Key-value store over one table.
///
/// ## Example
/// ```rust
/// use tablekv_keyvalue::{ConnectionPool, KVConfig, KvStore, ValueKind};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::open(&KVConfig::default()).await?;
/// let flags = KvStore::open(&pool, "flags", ValueKind::Boolean).await?;
///
/// flags.put("dark_mode", true).await?;
/// flags.put("beta", false).await?;
/// let enabled = flags.find_bool_values(true).await?;
/// assert_eq!(enabled.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    codec: ValueCodec,
    scanner: PrefixRangeScanner,
    arrays: Option<ChunkedArrayStore>,
}

impl KvStore {
    /// Open (creating if needed) `table` on `pool`, holding values of `kind`.
    ///
    /// ## Returns
    /// `Err(KVError::PoolClosed)` if the pool was closed.
    pub async fn open(pool: &ConnectionPool, table: &str, kind: ValueKind) -> KVResult<Self> {
        let backend = pool.open_table(table, kind).await?;
        Ok(Self::with_backend(backend))
    }

    /// Store over an already opened backend.
    pub fn with_backend(backend: Arc<dyn KvBackend>) -> Self {
        let codec = ValueCodec::new(backend.kind());
        let arrays = ChunkedArrayStore::new(backend.clone()).ok();
        Self {
            scanner: PrefixRangeScanner::new(backend.clone()),
            backend,
            codec,
            arrays,
        }
    }

    /// Configured value kind.
    pub fn kind(&self) -> ValueKind {
        self.codec.kind()
    }

    /// Table name.
    pub fn table(&self) -> &str {
        self.backend.table()
    }

    // ========================================================================
    // Basic KV
    // ========================================================================

    /// Insert or overwrite `key`.
    #[instrument(skip(self, value), fields(table = %self.backend.table()))]
    pub async fn put(&self, key: &str, value: impl Into<KvValue>) -> KVResult<()> {
        validate_key(key)?;
        let value = self.codec.encode(value.into())?;
        self.backend.put(key, &value).await?;
        debug!(key = %key, "Put value");
        Ok(())
    }

    /// Insert `key` only if it does not exist.
    ///
    /// ## Returns
    /// `Err(KVError::DuplicateKey)` if the key already exists.
    #[instrument(skip(self, value), fields(table = %self.backend.table()))]
    pub async fn add(&self, key: &str, value: impl Into<KvValue>) -> KVResult<()> {
        validate_key(key)?;
        let value = self.codec.encode(value.into())?;
        if self.backend.insert(key, &value).await? {
            Ok(())
        } else {
            Err(KVError::DuplicateKey(key.to_string()))
        }
    }

    /// Value at `key`, or `None`.
    pub async fn get(&self, key: &str) -> KVResult<Option<KvValue>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    /// Entry (value plus timestamps) at `key`, or `None`.
    pub async fn get_entry(&self, key: &str) -> KVResult<Option<KvEntry>> {
        match self.backend.get(key).await? {
            Some(mut entry) => {
                entry.value = self.codec.decode(entry.value)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Value at `key` if it was written within `max_age`.
    ///
    /// A stale entry is deleted and reported as absent.
    #[instrument(skip(self), fields(table = %self.backend.table()))]
    pub async fn get_fresh(&self, key: &str, max_age: Duration) -> KVResult<Option<KvValue>> {
        let Some(entry) = self.get_entry(key).await? else {
            return Ok(None);
        };
        let age = Utc::now().signed_duration_since(entry.updated_at);
        let stale = chrono::Duration::from_std(max_age).is_ok_and(|max_age| age > max_age);
        if stale {
            self.backend.delete_many(&[key.to_string()]).await?;
            debug!(key = %key, age_ms = age.num_milliseconds(), "Deleted stale entry");
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Delete `key`, returning whether it existed.
    pub async fn delete(&self, key: &str) -> KVResult<bool> {
        Ok(self.backend.delete_many(&[key.to_string()]).await? > 0)
    }

    /// Whether `key` exists.
    pub async fn has(&self, key: &str) -> KVResult<bool> {
        Ok(self.backend.get(key).await?.is_some())
    }

    /// Every key, ascending.
    pub async fn keys(&self) -> KVResult<Vec<String>> {
        let entries = self.backend.scan(&ScanQuery::all()).await?;
        Ok(entries.into_iter().map(|entry| entry.key).collect())
    }

    /// Every entry, ascending by key.
    pub async fn get_all(&self) -> KVResult<Vec<KvEntry>> {
        self.backend.scan(&ScanQuery::all()).await
    }

    /// Values for `keys`, in the same order; `None` for missing keys.
    pub async fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> KVResult<Vec<Option<KvValue>>> {
        let wanted: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let mut found: HashMap<String, KvValue> = HashMap::with_capacity(wanted.len());
        for entry in self.backend.get_many(&wanted).await? {
            found.insert(entry.key, self.codec.decode(entry.value)?);
        }
        Ok(wanted.iter().map(|key| found.get(key).cloned()).collect())
    }

    /// Write every pair in one transaction.
    #[instrument(skip(self, pairs), fields(table = %self.backend.table()))]
    pub async fn put_many<K, V, I>(&self, pairs: I) -> KVResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<KvValue>,
    {
        let mut encoded = Vec::new();
        for (key, value) in pairs {
            let key = key.into();
            validate_key(&key)?;
            encoded.push((key, self.codec.encode(value.into())?));
        }
        if encoded.is_empty() {
            return Ok(());
        }

        let first_key = encoded[0].0.clone();
        let mut tx = begin_transaction(self.backend.as_ref(), "put_many", &first_key).await?;
        let result = Self::put_all(tx.as_mut(), &encoded).await;
        finish_transaction(self.backend.as_ref(), tx, "put_many", &first_key, result).await?;
        debug!(count = encoded.len(), "Put values");
        Ok(())
    }

    async fn put_all(tx: &mut dyn KvTransaction, pairs: &[(String, KvValue)]) -> KVResult<()> {
        for (key, value) in pairs {
            tx.put(key, value).await?;
        }
        Ok(())
    }

    /// Delete `keys`, returning how many existed.
    pub async fn delete_many<S: AsRef<str>>(&self, keys: &[S]) -> KVResult<u64> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self.backend.delete_many(&keys).await
    }

    /// Delete every row, returning how many existed.
    pub async fn clear(&self) -> KVResult<u64> {
        self.backend.clear().await
    }

    /// Number of rows.
    pub async fn count(&self) -> KVResult<u64> {
        self.backend.count().await
    }

    /// Key count and approximate value size (reads every row).
    pub async fn stats(&self) -> KVResult<KVStats> {
        let entries = self.backend.scan(&ScanQuery::all()).await?;
        Ok(KVStats {
            total_keys: entries.len(),
            total_size_bytes: entries
                .iter()
                .map(|entry| entry.key.len() + entry.value.size_hint())
                .sum(),
            backend_type: self.backend.backend_type().to_string(),
        })
    }

    // ========================================================================
    // Typed JSON helpers
    // ========================================================================

    /// Serialize `value` and store it at `key`.
    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> KVResult<()> {
        let doc = self.codec.to_json(value)?;
        self.put(key, KvValue::Json(doc)).await
    }

    /// Value at `key`, deserialized into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> KVResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(self.codec.from_json(value_to_json(value)?)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Deep merge
    // ========================================================================

    /// Atomically deep-merge `partial` into the document at `key`.
    ///
    /// Nested objects merge key-wise; scalars, arrays and type mismatches are
    /// replaced by `partial`'s value, `null` included. An absent key is
    /// created with `partial`.
    ///
    /// ## Returns
    /// `Err(KVError::TypeUnsupported)` unless the store holds JSON.
    #[instrument(skip(self, partial), fields(table = %self.backend.table()))]
    pub async fn merge(&self, key: &str, partial: Value) -> KVResult<()> {
        self.codec.ensure_supports(StoreOperation::Merge)?;
        validate_key(key)?;
        self.backend.merge_json(key, &partial).await?;
        debug!(key = %key, "Merged value");
        Ok(())
    }

    // ========================================================================
    // Key-pattern queries
    // ========================================================================

    /// Entries whose key starts with `prefix` (index-assisted range scan).
    pub async fn get_with_prefix(
        &self,
        prefix: &str,
        options: &PrefixScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        self.scanner.get_with_prefix(prefix, options).await
    }

    /// Entries whose key contains `needle` (full table scan).
    pub async fn get_with_contains(
        &self,
        needle: &str,
        options: &PatternScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        self.scanner.get_with_contains(needle, options).await
    }

    /// Entries whose key ends with `suffix` (full table scan).
    pub async fn get_with_suffix(
        &self,
        suffix: &str,
        options: &PatternScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        self.scanner.get_with_suffix(suffix, options).await
    }

    // ========================================================================
    // Chunked arrays
    // ========================================================================

    fn arrays(&self) -> KVResult<&ChunkedArrayStore> {
        self.codec.ensure_supports(StoreOperation::ChunkedArray)?;
        self.arrays.as_ref().ok_or(KVError::TypeUnsupported {
            kind: self.codec.kind(),
            operation: StoreOperation::ChunkedArray,
        })
    }

    /// Append `items` to the chunked array at `key` (see [`ChunkedArrayStore::save`]).
    pub async fn save_array<T: Serialize>(
        &self,
        key: &str,
        items: &[T],
        options: SaveArrayOptions,
    ) -> KVResult<ArrayWriteSummary> {
        self.arrays()?.save(key, items, options).await
    }

    /// Every item of the array at `key`, in insertion order.
    pub async fn get_all_array<T: DeserializeOwned>(&self, key: &str) -> KVResult<Vec<T>> {
        self.arrays()?.read_all(key).await
    }

    /// The last `count` items before the final `offset` items.
    pub async fn get_recent_array<T: DeserializeOwned>(
        &self,
        key: &str,
        count: usize,
        offset: usize,
    ) -> KVResult<Vec<T>> {
        self.arrays()?.read_tail(key, count, offset).await
    }

    /// Items at positions `[start, end)`.
    pub async fn get_array_range<T: DeserializeOwned>(
        &self,
        key: &str,
        start: usize,
        end: usize,
    ) -> KVResult<Vec<T>> {
        self.arrays()?.read_range(key, start, end).await
    }

    /// Metadata of the array at `key`.
    pub async fn get_array_meta(&self, key: &str) -> KVResult<Option<ArrayMeta>> {
        self.arrays()?.get_meta(key).await
    }

    /// Delete the array at `key` (metadata and every chunk).
    pub async fn delete_array(&self, key: &str) -> KVResult<bool> {
        self.arrays()?.delete(key).await
    }

    // ========================================================================
    // Value-predicate searches
    // ========================================================================

    async fn search(&self, query: ScanQuery, operation: &'static str) -> KVResult<Vec<KvEntry>> {
        self.backend.scan(&query).await.map_err(|e| {
            error!(table = %self.backend.table(), operation, error = %e, "Search failed");
            e
        })
    }

    /// Entries whose JSON field at dotted `path` equals `value`.
    ///
    /// An empty `path` compares the whole document.
    pub async fn search_json(&self, path: &str, value: Value) -> KVResult<Vec<KvEntry>> {
        self.codec.ensure_supports(StoreOperation::SearchJson)?;
        let query = ScanQuery::all().with_value_filter(ValueFilter::JsonEquals {
            path: json_path(path),
            value,
        });
        self.search(query, "search_json").await
    }

    /// [`KvStore::search_json`] restricted to entries created within
    /// `[from, to]` (either side may be open).
    pub async fn search_json_by_time(
        &self,
        path: &str,
        value: Value,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> KVResult<Vec<KvEntry>> {
        self.codec
            .ensure_supports(StoreOperation::SearchJsonByTime)?;
        let query = ScanQuery::all()
            .with_value_filter(ValueFilter::JsonEquals {
                path: json_path(path),
                value,
            })
            .with_created(TimeBounds::new(from, to));
        self.search(query, "search_json_by_time").await
    }

    /// Entries created within `[from, to]` (either side may be open).
    pub async fn search_by_time(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> KVResult<Vec<KvEntry>> {
        let query = ScanQuery::all().with_created(TimeBounds::new(from, to));
        self.search(query, "search_by_time").await
    }

    /// Entries whose boolean value equals `flag`.
    pub async fn find_bool_values(&self, flag: bool) -> KVResult<Vec<KvEntry>> {
        self.codec.ensure_supports(StoreOperation::FindBoolValues)?;
        let query = ScanQuery::all().with_value_filter(ValueFilter::BoolEquals(flag));
        self.search(query, "find_bool_values").await
    }
}
