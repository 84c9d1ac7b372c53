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

//! # TableKV KeyValue Store
//!
//! ## Purpose
//! Provides a key-value abstraction layered on relational tables, plus three
//! capabilities a flat key-value table does not have on its own:
//!
//! - **Prefix range scans**: `[prefix, prefix + MAX_KEY_CHAR)` answered from
//!   the primary-key index
//! - **Deep merge**: atomic partial updates of JSON documents (one upsert on
//!   PostgreSQL, one write transaction on SQLite)
//! - **Chunked arrays**: ordered sequences too large for one row, split into
//!   fixed-size chunks plus one metadata row
//!
//! ## Key Components
//!
//! - [`KvStore`]: Per-table facade exposing every operation
//! - [`ChunkedArrayStore`]: Append / rebuild / slice logic for chunked arrays
//! - [`PrefixRangeScanner`]: Prefix and key-pattern queries
//! - [`ValueCodec`]: Value-kind validation chosen once per store
//! - [`ConnectionPool`]: Shared connections with an explicit open/close lifecycle
//! - [`KvBackend`] / [`KvTransaction`]: What a storage backend must provide
//! - [`KVError`]: Error types for all operations
//!
//! ## Physical Layout
//! One row per key: `(key PRIMARY KEY, value, created_at, updated_at)`. A
//! chunked array with base key `nums` occupies `nums_meta` plus
//! `nums_0 .. nums_{batch_count-1}` in the same table.
//!
//! ## Backend Support
//!
//! - **InMemory**: BTreeMap-based (always available)
//! - **SQLite**: Persistent, single-node (feature: `sql-backend`)
//! - **PostgreSQL**: Shared, multi-node (feature: `sql-backend`)
//!
//! ## Concurrency
//! Operations on different keys run fully concurrently. There is no
//! per-key write serialization: two concurrent `save_array` calls on the same
//! base key can race on the last chunk and the metadata row. Callers must
//! keep at most one writer per base key.
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust
//! use tablekv_keyvalue::{ConnectionPool, KVConfig, KvStore, KvValue, ValueKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::open(&KVConfig::default()).await?;
//! let kv = KvStore::open(&pool, "settings", ValueKind::Text).await?;
//!
//! kv.put("timeout", "30s").await?;
//! assert_eq!(kv.get("timeout").await?, Some(KvValue::Text("30s".to_string())));
//!
//! kv.delete("timeout").await?;
//! assert!(!kv.has("timeout").await?);
//! pool.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Chunked Arrays
//! ```rust
//! use tablekv_keyvalue::{ConnectionPool, KVConfig, KvStore, SaveArrayOptions, ValueKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::open(&KVConfig::default()).await?;
//! let kv = KvStore::open(&pool, "series", ValueKind::Json).await?;
//!
//! let items: Vec<u32> = (1..=2500).collect();
//! let summary = kv.save_array("nums", &items, SaveArrayOptions::with_batch_size(1000)).await?;
//! assert_eq!(summary.meta.batch_count, 3);
//!
//! let straddle: Vec<u32> = kv.get_array_range("nums", 999, 1001).await?;
//! assert_eq!(straddle, vec![1000, 1001]);
//! # Ok(())
//! # }
//! ```
//!
//! ### Deep Merge
//! ```rust
//! use serde_json::json;
//! use tablekv_keyvalue::{ConnectionPool, KVConfig, KvStore, ValueKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::open(&KVConfig::default()).await?;
//! let kv = KvStore::open(&pool, "docs", ValueKind::Json).await?;
//!
//! kv.put("cfg", json!({"a": {"x": 1}})).await?;
//! kv.merge("cfg", json!({"a": {"y": 2}})).await?;
//! assert_eq!(kv.get_json::<serde_json::Value>("cfg").await?, Some(json!({"a": {"x": 1, "y": 2}})));
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//! ```bash
//! # Run tests (in-memory and SQLite backends)
//! cargo test -p tablekv-keyvalue
//!
//! # In-memory backend only
//! cargo test -p tablekv-keyvalue --no-default-features
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;

pub mod array;
pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod merge;
pub mod pool;
pub mod retry;
pub mod scan;
pub mod store;

#[cfg(feature = "sql-backend")]
pub mod sql;

pub use array::{ArrayMeta, ArrayWriteMode, ArrayWriteSummary, ChunkedArrayStore, SaveArrayOptions};
pub use codec::{KvEntry, KvValue, StoreOperation, ValueCodec, ValueKind};
pub use config::{BackendType, KVConfig, PostgresConnection, RetryPolicy};
pub use error::{KVError, KVResult};
pub use memory::{MemoryDatabase, MemoryTable};
pub use merge::deep_merge;
pub use pool::ConnectionPool;
pub use scan::{
    KeyPattern, KeyRange, PatternScanOptions, PrefixRangeScanner, PrefixScanOptions, ScanOrder,
    ScanQuery, TimeBounds, ValueFilter, MAX_KEY_CHAR,
};
pub use store::{KVStats, KvStore};

#[cfg(feature = "sql-backend")]
pub use sql::{PostgresTable, SqliteTable};

/// Storage collaborator for one table.
///
/// ## Purpose
/// The store facade, the chunked-array logic and the prefix scanner are
/// written once against this trait; each backend (in-memory, SQLite,
/// PostgreSQL) implements it for a single table.
///
/// ## Contract
/// - Keys are ordered bytewise; [`KvBackend::scan`] honors that order
/// - `get` on a missing key returns `Ok(None)`
/// - [`KvBackend::merge_json`] is atomic: concurrent merges on one key never
///   lose an update
/// - Writes made through a [`KvTransaction`] become visible together on
///   commit and not at all on rollback or drop
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Table (namespace) name.
    fn table(&self) -> &str;

    /// Configured value kind.
    fn kind(&self) -> ValueKind;

    /// Backend name (e.g., "InMemory", "SQLite", "PostgreSQL").
    fn backend_type(&self) -> &'static str;

    /// Get an entry by key.
    async fn get(&self, key: &str) -> KVResult<Option<KvEntry>>;

    /// Get the entries that exist among `keys` (any order).
    async fn get_many(&self, keys: &[String]) -> KVResult<Vec<KvEntry>>;

    /// Insert or overwrite a key. `created_at` survives overwrites.
    async fn put(&self, key: &str, value: &KvValue) -> KVResult<()>;

    /// Insert only if absent.
    ///
    /// ## Returns
    /// - `Ok(true)` if the row was inserted
    /// - `Ok(false)` if the key already existed (nothing changed)
    async fn insert(&self, key: &str, value: &KvValue) -> KVResult<bool>;

    /// Delete keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> KVResult<u64>;

    /// Delete every row, returning how many existed.
    async fn clear(&self) -> KVResult<u64>;

    /// Number of rows.
    async fn count(&self) -> KVResult<u64>;

    /// Ordered, bounded scan.
    async fn scan(&self, query: &ScanQuery) -> KVResult<Vec<KvEntry>>;

    /// Atomically deep-merge `partial` into the JSON document at `key`
    /// (inserting `partial` if the key is absent).
    async fn merge_json(&self, key: &str, partial: &serde_json::Value) -> KVResult<()>;

    /// Open a transaction.
    async fn begin(&self) -> KVResult<Box<dyn KvTransaction>>;
}

/// Transaction scope on one table.
///
/// Reads observe the transaction's own staged writes.
#[async_trait]
pub trait KvTransaction: Send {
    /// Get a value by key.
    async fn get(&mut self, key: &str) -> KVResult<Option<KvValue>>;

    /// Get the `(key, value)` pairs that exist among `keys` (any order).
    async fn get_many(&mut self, keys: &[String]) -> KVResult<Vec<(String, KvValue)>>;

    /// Insert or overwrite a key.
    async fn put(&mut self, key: &str, value: &KvValue) -> KVResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete_many(&mut self, keys: &[String]) -> KVResult<u64>;

    /// Make every write visible.
    async fn commit(self: Box<Self>) -> KVResult<()>;

    /// Discard every write.
    async fn rollback(self: Box<Self>) -> KVResult<()>;
}

/// Open a transaction on `backend` for `operation` on `key`.
pub(crate) async fn begin_transaction(
    backend: &dyn KvBackend,
    operation: &'static str,
    key: &str,
) -> KVResult<Box<dyn KvTransaction>> {
    backend
        .begin()
        .await
        .map_err(|e| transaction_failed(backend, operation, key, e))
}

/// Commit on success; otherwise roll back and wrap the error in
/// [`KVError::Transaction`].
pub(crate) async fn finish_transaction<T>(
    backend: &dyn KvBackend,
    tx: Box<dyn KvTransaction>,
    operation: &'static str,
    key: &str,
    result: KVResult<T>,
) -> KVResult<T> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| transaction_failed(backend, operation, key, e))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(key = %key, error = %rollback_err, "Rollback failed");
            }
            Err(transaction_failed(backend, operation, key, e))
        }
    }
}

fn transaction_failed(
    backend: &dyn KvBackend,
    operation: &'static str,
    key: &str,
    source: KVError,
) -> KVError {
    metrics::counter!("tablekv_transaction_rollbacks_total", "operation" => operation).increment(1);
    tracing::error!(
        table = %backend.table(),
        key = %key,
        operation,
        error = %source,
        "Transaction failed"
    );
    KVError::Transaction {
        operation: operation.to_string(),
        source: Box::new(source),
    }
}
