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

//! Chunked arrays: ordered sequences split across fixed-size chunk rows.
//!
//! ## Physical Layout
//! A logical array with base key `nums` is stored as:
//! - `nums_meta`: [`ArrayMeta`] (`batch_count`, `total_items`, `batch_size`,
//!   `last_updated`)
//! - `nums_0 .. nums_{batch_count-1}`: JSON arrays of up to `batch_size` items
//!
//! Every chunk but the last holds exactly `batch_size` items and the chunk
//! lengths sum to `total_items`. The stored `batch_size` decides addressing;
//! changing it requires a rebuild.
//!
//! ## Writes
//! [`ChunkedArrayStore::save`] runs in a single transaction and takes one of
//! four paths:
//!
//! | stored metadata | options                           | path        |
//! |-----------------|-----------------------------------|-------------|
//! | none            | any                               | `Created`   |
//! | present         | `overwrite`                       | `Overwritten` |
//! | present         | other batch size, `force_rebatch` | `Rebuilt`   |
//! | present         | otherwise                         | `Appended`  |
//!
//! When the requested batch size differs from the stored one and
//! `force_rebatch` is not set, the stored size wins and the summary carries a
//! warning. Any failure rolls the whole transaction back; no partial chunk or
//! metadata write is ever committed.
//!
//! ## Concurrency
//! Nothing serializes writers of the same base key. Two concurrent saves can
//! both read the same last chunk and metadata row and overwrite each other.
//! Callers must keep at most one writer per base key.

use crate::codec::{KvValue, StoreOperation, ValueCodec};
use crate::{begin_transaction, finish_transaction, KVError, KVResult, KvBackend, KvTransaction};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Default number of items per chunk.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Metadata row of a chunked array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    /// Number of chunk rows
    pub batch_count: u64,
    /// Number of items across all chunks
    pub total_items: u64,
    /// Items per full chunk
    pub batch_size: u64,
    /// Time of the last successful write
    pub last_updated: DateTime<Utc>,
}

/// Options for [`ChunkedArrayStore::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveArrayOptions {
    /// Requested items per chunk
    pub batch_size: usize,
    /// Rebuild the array when `batch_size` differs from the stored size
    pub force_rebatch: bool,
    /// Replace the array instead of appending
    pub overwrite: bool,
}

impl Default for SaveArrayOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            force_rebatch: false,
            overwrite: false,
        }
    }
}

impl SaveArrayOptions {
    /// Append with the given batch size.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Set `force_rebatch`.
    pub fn force_rebatch(mut self, force: bool) -> Self {
        self.force_rebatch = force;
        self
    }

    /// Set `overwrite`.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Which write path a save took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayWriteMode {
    /// No array existed; a fresh one was built
    Created,
    /// Items were appended to the existing chunks
    Appended,
    /// The array was rebuilt with a new batch size
    Rebuilt,
    /// The previous array was deleted and replaced
    Overwritten,
}

impl ArrayWriteMode {
    /// Lowercase label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArrayWriteMode::Created => "created",
            ArrayWriteMode::Appended => "appended",
            ArrayWriteMode::Rebuilt => "rebuilt",
            ArrayWriteMode::Overwritten => "overwritten",
        }
    }
}

impl fmt::Display for ArrayWriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayWriteSummary {
    /// Metadata as committed
    pub meta: ArrayMeta,
    /// Path taken
    pub mode: ArrayWriteMode,
    /// Non-fatal warning (requested batch size ignored)
    pub warning: Option<String>,
}

fn meta_key(base: &str) -> String {
    format!("{}_meta", base)
}

fn chunk_key(base: &str, index: u64) -> String {
    format!("{}_{}", base, index)
}

fn chunk_keys(base: &str, indices: Range<u64>) -> Vec<String> {
    indices.map(|i| chunk_key(base, i)).collect()
}

fn all_keys(base: &str, meta: &ArrayMeta) -> Vec<String> {
    let mut keys = chunk_keys(base, 0..meta.batch_count);
    keys.push(meta_key(base));
    keys
}

fn decode_meta(base: &str, value: KvValue) -> KVResult<ArrayMeta> {
    let doc = value
        .into_json()
        .ok_or_else(|| KVError::corrupt(base, "metadata is not a JSON document"))?;
    let meta: ArrayMeta = serde_json::from_value(doc)
        .map_err(|e| KVError::corrupt(base, format!("unreadable metadata: {}", e)))?;
    if meta.batch_size == 0 {
        return Err(KVError::corrupt(base, "metadata has batch_size 0"));
    }
    Ok(meta)
}

fn decode_chunk(base: &str, index: u64, value: KvValue) -> KVResult<Vec<Value>> {
    match value.into_json() {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(KVError::corrupt(
            base,
            format!("chunk {} is not a JSON array", index),
        )),
    }
}

/// Place fetched `(key, value)` pairs at their numeric chunk index.
///
/// `indices` is the requested range; a key missing from `found` means a gap
/// in the chunk sequence.
fn assemble(
    base: &str,
    indices: Range<u64>,
    found: Vec<(String, KvValue)>,
) -> KVResult<Vec<Vec<Value>>> {
    let positions: HashMap<String, u64> = indices.clone().map(|i| (chunk_key(base, i), i)).collect();
    let mut slots: Vec<Option<Vec<Value>>> = vec![None; (indices.end - indices.start) as usize];
    for (key, value) in found {
        if let Some(&index) = positions.get(&key) {
            slots[(index - indices.start) as usize] = Some(decode_chunk(base, index, value)?);
        }
    }
    slots
        .into_iter()
        .zip(indices)
        .map(|(slot, index)| {
            slot.ok_or_else(|| KVError::corrupt(base, format!("chunk {} is missing", index)))
        })
        .collect()
}

fn concat(chunks: Vec<Vec<Value>>) -> Vec<Value> {
    chunks.into_iter().flatten().collect()
}

fn to_values<T: Serialize>(items: &[T]) -> KVResult<Vec<Value>> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(KVError::from))
        .collect()
}

fn from_values<T: DeserializeOwned>(values: Vec<Value>) -> KVResult<Vec<T>> {
    values
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(KVError::from))
        .collect()
}

/// Chunked-array operations over one JSON table.
#[derive(Clone)]
pub struct ChunkedArrayStore {
    backend: Arc<dyn KvBackend>,
    codec: ValueCodec,
}

impl ChunkedArrayStore {
    /// Array store over `backend`.
    ///
    /// ## Returns
    /// `Err(KVError::TypeUnsupported)` unless `backend` holds JSON values.
    pub fn new(backend: Arc<dyn KvBackend>) -> KVResult<Self> {
        let codec = ValueCodec::new(backend.kind());
        codec.ensure_supports(StoreOperation::ChunkedArray)?;
        Ok(Self { backend, codec })
    }

    /// Append `items` to the array at `base` (or create, overwrite, rebuild
    /// it; see the module docs).
    #[instrument(
        skip(self, items, options),
        fields(table = %self.backend.table(), items = items.len())
    )]
    pub async fn save<T: Serialize>(
        &self,
        base: &str,
        items: &[T],
        options: SaveArrayOptions,
    ) -> KVResult<ArrayWriteSummary> {
        validate_base_key(base)?;
        if options.batch_size == 0 {
            return Err(KVError::InvalidArgument(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        let items = to_values(items)?;

        let started = Instant::now();
        let mut tx = begin_transaction(self.backend.as_ref(), "save_array", base).await?;
        let result = Self::save_in(tx.as_mut(), base, items, options).await;
        let summary = finish_transaction(self.backend.as_ref(), tx, "save_array", base, result).await?;

        counter!("tablekv_array_writes_total", "mode" => summary.mode.as_str()).increment(1);
        histogram!("tablekv_array_write_duration_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            base = %base,
            mode = %summary.mode,
            batch_count = summary.meta.batch_count,
            total_items = summary.meta.total_items,
            "Array saved"
        );
        Ok(summary)
    }

    async fn save_in(
        tx: &mut dyn KvTransaction,
        base: &str,
        items: Vec<Value>,
        options: SaveArrayOptions,
    ) -> KVResult<ArrayWriteSummary> {
        let requested = options.batch_size as u64;
        let existing = match tx.get(&meta_key(base)).await? {
            Some(value) => Some(decode_meta(base, value)?),
            None => None,
        };

        let (meta, mode, warning) = match existing {
            None => (
                Self::write_fresh(tx, base, items, requested).await?,
                ArrayWriteMode::Created,
                None,
            ),
            Some(old) if options.overwrite => {
                tx.delete_many(&all_keys(base, &old)).await?;
                (
                    Self::write_fresh(tx, base, items, requested).await?,
                    ArrayWriteMode::Overwritten,
                    None,
                )
            }
            Some(old) if old.batch_size != requested && options.force_rebatch => (
                Self::rebuild(tx, base, old, items, requested).await?,
                ArrayWriteMode::Rebuilt,
                None,
            ),
            Some(old) if old.batch_size != requested => {
                let warning = format!(
                    "requested batch_size {} ignored for {}; array keeps stored batch_size {} (set force_rebatch to rebuild)",
                    requested, base, old.batch_size
                );
                warn!(base = %base, requested, stored = old.batch_size, "Batch size mismatch, using stored size");
                (
                    Self::append(tx, base, old, items).await?,
                    ArrayWriteMode::Appended,
                    Some(warning),
                )
            }
            Some(old) => (
                Self::append(tx, base, old, items).await?,
                ArrayWriteMode::Appended,
                None,
            ),
        };

        Ok(ArrayWriteSummary {
            meta,
            mode,
            warning,
        })
    }

    /// Write `items` as chunks `0..` plus metadata. Assumes no chunk rows exist.
    async fn write_fresh(
        tx: &mut dyn KvTransaction,
        base: &str,
        items: Vec<Value>,
        batch_size: u64,
    ) -> KVResult<ArrayMeta> {
        let total_items = items.len() as u64;
        let mut batch_count = 0;
        for chunk in items.chunks(batch_size as usize) {
            tx.put(
                &chunk_key(base, batch_count),
                &KvValue::Json(Value::Array(chunk.to_vec())),
            )
            .await?;
            batch_count += 1;
        }

        let meta = ArrayMeta {
            batch_count,
            total_items,
            batch_size,
            last_updated: Utc::now(),
        };
        Self::write_meta(tx, base, &meta).await?;
        Ok(meta)
    }

    /// Read the whole array, delete it, and write it back with `new_batch_size`
    /// followed by `new_items`.
    async fn rebuild(
        tx: &mut dyn KvTransaction,
        base: &str,
        old: ArrayMeta,
        new_items: Vec<Value>,
        new_batch_size: u64,
    ) -> KVResult<ArrayMeta> {
        let indices = 0..old.batch_count;
        let found = tx.get_many(&chunk_keys(base, indices.clone())).await?;
        let mut items = concat(assemble(base, indices, found)?);
        if items.len() as u64 != old.total_items {
            return Err(KVError::corrupt(
                base,
                format!(
                    "chunks hold {} items, metadata says {}",
                    items.len(),
                    old.total_items
                ),
            ));
        }

        tx.delete_many(&all_keys(base, &old)).await?;
        debug!(
            base = %base,
            from = old.batch_size,
            to = new_batch_size,
            items = items.len(),
            "Rebuilding array"
        );
        items.extend(new_items);
        Self::write_fresh(tx, base, items, new_batch_size).await
    }

    /// Fill the last chunk, then add new chunks after it.
    async fn append(
        tx: &mut dyn KvTransaction,
        base: &str,
        mut meta: ArrayMeta,
        items: Vec<Value>,
    ) -> KVResult<ArrayMeta> {
        if items.is_empty() {
            return Ok(meta);
        }
        let batch_size = meta.batch_size as usize;
        let added = items.len() as u64;
        let mut incoming = items.into_iter();

        if meta.batch_count > 0 {
            let last_index = meta.batch_count - 1;
            let last_key = chunk_key(base, last_index);
            let mut last = match tx.get(&last_key).await? {
                Some(value) => decode_chunk(base, last_index, value)?,
                None => {
                    return Err(KVError::corrupt(
                        base,
                        format!("chunk {} is missing", last_index),
                    ))
                }
            };
            let room = batch_size.saturating_sub(last.len());
            if room > 0 {
                last.extend(incoming.by_ref().take(room));
                tx.put(&last_key, &KvValue::Json(Value::Array(last))).await?;
            }
        }

        let leftover: Vec<Value> = incoming.collect();
        for chunk in leftover.chunks(batch_size) {
            tx.put(
                &chunk_key(base, meta.batch_count),
                &KvValue::Json(Value::Array(chunk.to_vec())),
            )
            .await?;
            meta.batch_count += 1;
        }

        meta.total_items += added;
        meta.last_updated = Utc::now();
        Self::write_meta(tx, base, &meta).await?;
        Ok(meta)
    }

    async fn write_meta(tx: &mut dyn KvTransaction, base: &str, meta: &ArrayMeta) -> KVResult<()> {
        let doc = serde_json::to_value(meta)?;
        tx.put(&meta_key(base), &KvValue::Json(doc)).await
    }

    /// Metadata of the array at `base`, if it exists.
    pub async fn get_meta(&self, base: &str) -> KVResult<Option<ArrayMeta>> {
        match self.backend.get(&meta_key(base)).await? {
            Some(entry) => Ok(Some(decode_meta(base, self.codec.decode(entry.value)?)?)),
            None => Ok(None),
        }
    }

    async fn fetch_chunks(&self, base: &str, indices: Range<u64>) -> KVResult<Vec<Vec<Value>>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self
            .backend
            .get_many(&chunk_keys(base, indices.clone()))
            .await?;
        let found = entries.into_iter().map(|e| (e.key, e.value)).collect();
        assemble(base, indices, found)
    }

    async fn read_all_values(&self, base: &str, meta: &ArrayMeta) -> KVResult<Vec<Value>> {
        let items = concat(self.fetch_chunks(base, 0..meta.batch_count).await?);
        if items.len() as u64 != meta.total_items {
            return Err(KVError::corrupt(
                base,
                format!(
                    "chunks hold {} items, metadata says {}",
                    items.len(),
                    meta.total_items
                ),
            ));
        }
        Ok(items)
    }

    /// Every item, in insertion order. Empty if the array does not exist.
    #[instrument(skip(self), fields(table = %self.backend.table()))]
    pub async fn read_all<T: DeserializeOwned>(&self, base: &str) -> KVResult<Vec<T>> {
        match self.get_meta(base).await? {
            Some(meta) => from_values(self.read_all_values(base, &meta).await?),
            None => Ok(Vec::new()),
        }
    }

    /// The last `count` items before the final `offset` items, in insertion
    /// order.
    #[instrument(skip(self), fields(table = %self.backend.table()))]
    pub async fn read_tail<T: DeserializeOwned>(
        &self,
        base: &str,
        count: usize,
        offset: usize,
    ) -> KVResult<Vec<T>> {
        let Some(meta) = self.get_meta(base).await? else {
            return Ok(Vec::new());
        };
        let total = meta.total_items as usize;
        if count == 0 || offset >= total {
            return Ok(Vec::new());
        }
        let needed = count.saturating_add(offset);

        if needed >= total {
            let mut all = self.read_all_values(base, &meta).await?;
            let end = total - offset;
            let start = end.saturating_sub(count);
            all.truncate(end);
            return from_values(all.split_off(start));
        }

        // Chunks holding the last `needed` items, walked newest first
        let batch_size = meta.batch_size as usize;
        let first = ((total - needed) / batch_size) as u64;
        let chunks = self.fetch_chunks(base, first..meta.batch_count).await?;

        let mut parts: Vec<Vec<Value>> = Vec::new();
        let mut collected = 0;
        for mut chunk in chunks.into_iter().rev() {
            let want = needed - collected;
            if chunk.len() > want {
                chunk = chunk.split_off(chunk.len() - want);
            }
            collected += chunk.len();
            parts.push(chunk);
            if collected == needed {
                break;
            }
        }
        if collected != needed {
            return Err(KVError::corrupt(
                base,
                format!("tail holds {} items, expected {}", collected, needed),
            ));
        }

        parts.reverse();
        let mut tail = concat(parts);
        tail.truncate(count);
        from_values(tail)
    }

    /// Items at positions `[start, end)`; `end` is clamped to the array length.
    #[instrument(skip(self), fields(table = %self.backend.table()))]
    pub async fn read_range<T: DeserializeOwned>(
        &self,
        base: &str,
        start: usize,
        end: usize,
    ) -> KVResult<Vec<T>> {
        let Some(meta) = self.get_meta(base).await? else {
            return Ok(Vec::new());
        };
        let total = meta.total_items as usize;
        if start >= total || end <= start {
            return Ok(Vec::new());
        }
        let end = end.min(total);

        let batch_size = meta.batch_size as usize;
        let start_batch = start / batch_size;
        let end_batch = (end - 1) / batch_size;
        let chunks = self
            .fetch_chunks(base, start_batch as u64..end_batch as u64 + 1)
            .await?;

        let mut items = Vec::with_capacity(end - start);
        for (index, chunk) in (start_batch..).zip(chunks) {
            let chunk_base = index * batch_size;
            let lo = start.saturating_sub(chunk_base);
            let hi = chunk.len().min(end - chunk_base);
            if lo < hi {
                items.extend(chunk.into_iter().skip(lo).take(hi - lo));
            }
        }
        from_values(items)
    }

    /// Delete the metadata key and every chunk key of the array.
    ///
    /// ## Returns
    /// `false` if no array existed at `base`.
    #[instrument(skip(self), fields(table = %self.backend.table()))]
    pub async fn delete(&self, base: &str) -> KVResult<bool> {
        let mut tx = begin_transaction(self.backend.as_ref(), "delete_array", base).await?;
        let result = Self::delete_in(tx.as_mut(), base).await;
        finish_transaction(self.backend.as_ref(), tx, "delete_array", base, result).await
    }

    async fn delete_in(tx: &mut dyn KvTransaction, base: &str) -> KVResult<bool> {
        match tx.get(&meta_key(base)).await? {
            Some(value) => {
                let meta = decode_meta(base, value)?;
                tx.delete_many(&all_keys(base, &meta)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn validate_base_key(base: &str) -> KVResult<()> {
    if base.is_empty() {
        return Err(KVError::InvalidKey("array base key must not be empty".to_string()));
    }
    Ok(())
}
