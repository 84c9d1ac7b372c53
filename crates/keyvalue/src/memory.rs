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

//! In-memory KeyValue backend.
//!
//! ## Purpose
//! Provides a BTreeMap-based backend for testing and single-process scenarios.
//!
//! ## Features
//! - Key-ordered storage, so range scans walk only the requested range
//! - Transactions that stage writes and hold the table's write lock until
//!   commit or rollback
//! - Atomic deep merge under the write lock
//!
//! ## Limitations
//! - Not persistent (data lost on restart)
//! - Not distributed (single process only)
//! - One open transaction per table at a time; a transaction must not be
//!   held across calls to the same table's non-transactional methods

use crate::codec::{now_millis, timestamp_from_millis, KvEntry, KvValue, ValueKind};
use crate::merge::deep_merge_into;
use crate::scan::{page, ScanOrder, ScanQuery};
use crate::{KVError, KVResult, KvBackend, KvTransaction};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};

/// Row in an in-memory table.
#[derive(Debug, Clone)]
struct Row {
    value: KvValue,
    created_at: i64,
    updated_at: i64,
}

impl Row {
    fn new(value: KvValue, now: i64) -> Self {
        Self {
            value,
            created_at: now,
            updated_at: now,
        }
    }

    fn to_entry(&self, key: &str) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: self.value.clone(),
            created_at: timestamp_from_millis(self.created_at),
            updated_at: timestamp_from_millis(self.updated_at),
        }
    }
}

type Rows = BTreeMap<String, Row>;

/// Upsert preserving `created_at` of an existing row.
fn upsert(rows: &mut Rows, key: &str, value: KvValue, now: i64) {
    match rows.get_mut(key) {
        Some(row) => {
            row.value = value;
            row.updated_at = now;
        }
        None => {
            rows.insert(key.to_string(), Row::new(value, now));
        }
    }
}

/// Shared in-memory database: a set of named tables.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<HashMap<String, (ValueKind, Arc<RwLock<Rows>>)>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) `table` holding values of `kind`.
    ///
    /// ## Returns
    /// - `Err(KVError::ConfigError)` if the table exists with another kind
    /// - `Err(KVError::PoolClosed)` after [`MemoryDatabase::close`]
    pub async fn open_table(&self, table: &str, kind: ValueKind) -> KVResult<MemoryTable> {
        if self.is_closed() {
            return Err(KVError::PoolClosed);
        }
        let mut tables = self.tables.lock().await;
        let (existing_kind, rows) = tables
            .entry(table.to_string())
            .or_insert_with(|| (kind, Arc::new(RwLock::new(BTreeMap::new()))));
        if *existing_kind != kind {
            return Err(KVError::ConfigError(format!(
                "table {} already holds {} values, cannot open as {}",
                table, existing_kind, kind
            )));
        }
        Ok(MemoryTable {
            name: table.to_string(),
            kind,
            rows: rows.clone(),
        })
    }

    /// Mark the database closed; existing tables keep working, new opens fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`MemoryDatabase::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One in-memory table.
#[derive(Clone)]
pub struct MemoryTable {
    name: String,
    kind: ValueKind,
    rows: Arc<RwLock<Rows>>,
}

impl MemoryTable {
    fn bounds(query: &ScanQuery) -> (Bound<String>, Bound<String>) {
        match &query.range {
            Some(range) => (
                Bound::Included(range.start.clone()),
                range
                    .end
                    .clone()
                    .map_or(Bound::Unbounded, Bound::Excluded),
            ),
            None => (Bound::Unbounded, Bound::Unbounded),
        }
    }
}

#[async_trait]
impl KvBackend for MemoryTable {
    fn table(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ValueKind {
        self.kind
    }

    fn backend_type(&self) -> &'static str {
        "InMemory"
    }

    async fn get(&self, key: &str) -> KVResult<Option<KvEntry>> {
        let rows = self.rows.read().await;
        Ok(rows.get(key).map(|row| row.to_entry(key)))
    }

    async fn get_many(&self, keys: &[String]) -> KVResult<Vec<KvEntry>> {
        let rows = self.rows.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(key).map(|row| row.to_entry(key)))
            .collect())
    }

    async fn put(&self, key: &str, value: &KvValue) -> KVResult<()> {
        let mut rows = self.rows.write().await;
        upsert(&mut rows, key, value.clone(), now_millis());
        Ok(())
    }

    async fn insert(&self, key: &str, value: &KvValue) -> KVResult<bool> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(key) {
            return Ok(false);
        }
        rows.insert(key.to_string(), Row::new(value.clone(), now_millis()));
        Ok(true)
    }

    async fn delete_many(&self, keys: &[String]) -> KVResult<u64> {
        let mut rows = self.rows.write().await;
        Ok(keys.iter().filter(|key| rows.remove(key.as_str()).is_some()).count() as u64)
    }

    async fn clear(&self) -> KVResult<u64> {
        let mut rows = self.rows.write().await;
        let count = rows.len() as u64;
        rows.clear();
        Ok(count)
    }

    async fn count(&self) -> KVResult<u64> {
        Ok(self.rows.read().await.len() as u64)
    }

    async fn scan(&self, query: &ScanQuery) -> KVResult<Vec<KvEntry>> {
        if let Some(range) = &query.range {
            if range.end.as_deref().is_some_and(|end| end <= range.start.as_str()) {
                return Ok(Vec::new());
            }
        }
        let rows = self.rows.read().await;
        let mut matched: Vec<KvEntry> = rows
            .range(Self::bounds(query))
            .map(|(key, row)| row.to_entry(key))
            .filter(|entry| query.matches(entry))
            .collect();
        if query.order == ScanOrder::Descending {
            matched.reverse();
        }
        Ok(page(matched, query.offset, query.limit))
    }

    async fn merge_json(&self, key: &str, partial: &serde_json::Value) -> KVResult<()> {
        let mut rows = self.rows.write().await;
        let now = now_millis();
        match rows.get_mut(key) {
            Some(row) => {
                match &mut row.value {
                    KvValue::Json(doc) => deep_merge_into(doc, partial.clone()),
                    other => *other = KvValue::Json(partial.clone()),
                }
                row.updated_at = now;
            }
            None => {
                rows.insert(key.to_string(), Row::new(KvValue::Json(partial.clone()), now));
            }
        }
        Ok(())
    }

    async fn begin(&self) -> KVResult<Box<dyn KvTransaction>> {
        let guard = self.rows.clone().write_owned().await;
        Ok(Box::new(MemoryTransaction {
            rows: guard,
            staged: BTreeMap::new(),
        }))
    }
}

/// Transaction over one in-memory table.
///
/// Writes are staged and applied on commit; the table's write lock is held
/// for the transaction's lifetime.
pub struct MemoryTransaction {
    rows: OwnedRwLockWriteGuard<Rows>,
    staged: BTreeMap<String, Option<KvValue>>,
}

impl MemoryTransaction {
    fn lookup(&self, key: &str) -> Option<KvValue> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.rows.get(key).map(|row| row.value.clone()),
        }
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &str) -> KVResult<Option<KvValue>> {
        Ok(self.lookup(key))
    }

    async fn get_many(&mut self, keys: &[String]) -> KVResult<Vec<(String, KvValue)>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.lookup(key).map(|value| (key.clone(), value)))
            .collect())
    }

    async fn put(&mut self, key: &str, value: &KvValue) -> KVResult<()> {
        self.staged.insert(key.to_string(), Some(value.clone()));
        Ok(())
    }

    async fn delete_many(&mut self, keys: &[String]) -> KVResult<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.lookup(key).is_some() {
                deleted += 1;
            }
            self.staged.insert(key.clone(), None);
        }
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> KVResult<()> {
        let MemoryTransaction { mut rows, staged } = *self;
        let now = now_millis();
        for (key, value) in staged {
            match value {
                Some(value) => upsert(&mut rows, &key, value, now),
                None => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> KVResult<()> {
        Ok(())
    }
}
