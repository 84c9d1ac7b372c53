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

//! Key-ordered scans: prefix ranges, key patterns and value predicates.
//!
//! ## Prefix Scans
//! A prefix query becomes the half-open key range
//! `[prefix, prefix + MAX_KEY_CHAR)`. Both SQL backends keep the primary key
//! in byte order, so the range is answered from the primary-key index without
//! touching unrelated keys.
//!
//! Optional post-filters (key substring, creation-time bounds) run in this
//! process after the range fetch. When one is present, `limit`/`offset` are
//! applied after filtering as well, so the storage fetch may return more rows
//! than the final page.
//!
//! ## Pattern Scans
//! [`PrefixRangeScanner::get_with_contains`] and
//! [`PrefixRangeScanner::get_with_suffix`] are `LIKE`-style scans over the
//! whole table: O(n) in the table size, no index assistance.

use crate::codec::{KvEntry, KvValue};
use crate::{KVResult, KvBackend};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, instrument};

/// Largest Unicode scalar value; appended to a prefix to bound its range.
pub const MAX_KEY_CHAR: char = '\u{10FFFF}';

/// Half-open key range `[start, end)`; `end = None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub start: String,
    /// Exclusive upper bound
    pub end: Option<String>,
}

impl KeyRange {
    /// Range covering every key that starts with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        if prefix.is_empty() {
            return Self::default();
        }
        Self {
            start: prefix.to_string(),
            end: Some(format!("{}{}", prefix, MAX_KEY_CHAR)),
        }
    }

    /// Whether `key` lies in the range.
    pub fn contains(&self, key: &str) -> bool {
        key >= self.start.as_str() && self.end.as_deref().map_or(true, |end| key < end)
    }
}

/// Server-side key pattern (`LIKE` / `ILIKE` equivalents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// Key contains the substring
    Contains {
        /// Substring to look for
        needle: String,
        /// Compare with ASCII letters lowercased
        case_insensitive: bool,
    },
    /// Key ends with the suffix
    Suffix {
        /// Required suffix
        suffix: String,
        /// Compare with ASCII letters lowercased
        case_insensitive: bool,
    },
}

impl KeyPattern {
    /// Whether `key` matches the pattern. Case-insensitive patterns fold
    /// ASCII letters only, the same as SQL `lower()` on every backend.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Contains { needle, case_insensitive: false } => key.contains(needle.as_str()),
            KeyPattern::Contains { needle, case_insensitive: true } => {
                key.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
            KeyPattern::Suffix { suffix, case_insensitive: false } => key.ends_with(suffix.as_str()),
            KeyPattern::Suffix { suffix, case_insensitive: true } => {
                key.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
            }
        }
    }
}

/// Inclusive creation-time bounds; `None` leaves a side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeBounds {
    /// Earliest creation time
    pub from: Option<DateTime<Utc>>,
    /// Latest creation time
    pub to: Option<DateTime<Utc>>,
}

impl TimeBounds {
    /// Bounds from optional endpoints.
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }

    /// True when neither side is bounded.
    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// Whether `ts` lies within the bounds.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}

/// Predicate on the stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueFilter {
    /// JSON field at `path` equals `value`
    JsonEquals {
        /// Object field names from the document root
        path: Vec<String>,
        /// Expected value
        value: Value,
    },
    /// Boolean value equals the flag
    BoolEquals(bool),
}

impl ValueFilter {
    /// Whether `value` satisfies the predicate.
    pub fn matches(&self, value: &KvValue) -> bool {
        match (self, value) {
            (ValueFilter::JsonEquals { path, value: expected }, KvValue::Json(doc)) => {
                let mut node = doc;
                for field in path {
                    match node.get(field.as_str()) {
                        Some(child) => node = child,
                        None => return false,
                    }
                }
                node == expected
            }
            (ValueFilter::BoolEquals(flag), KvValue::Boolean(b)) => flag == b,
            _ => false,
        }
    }

    /// True when the expected value is an object or array.
    pub fn compares_container(&self) -> bool {
        matches!(self, ValueFilter::JsonEquals { value, .. } if value.is_object() || value.is_array())
    }
}

/// Key order of scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    /// Ascending key order
    #[default]
    Ascending,
    /// Descending key order
    Descending,
}

/// Everything a backend scan can be asked to evaluate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanQuery {
    /// Key range
    pub range: Option<KeyRange>,
    /// Key pattern
    pub pattern: Option<KeyPattern>,
    /// Creation-time bounds
    pub created: TimeBounds,
    /// Value predicate
    pub value_filter: Option<ValueFilter>,
    /// Result order
    pub order: ScanOrder,
    /// Maximum number of rows
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: usize,
}

impl ScanQuery {
    /// Scan of the whole table in ascending key order.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a key range.
    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Restrict to a key pattern.
    pub fn with_pattern(mut self, pattern: KeyPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Restrict to creation-time bounds.
    pub fn with_created(mut self, created: TimeBounds) -> Self {
        self.created = created;
        self
    }

    /// Restrict by value.
    pub fn with_value_filter(mut self, filter: ValueFilter) -> Self {
        self.value_filter = Some(filter);
        self
    }

    /// Set order.
    pub fn with_order(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }

    /// Set paging.
    pub fn with_page(mut self, limit: Option<usize>, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether an entry passes every predicate (paging excluded).
    pub fn matches(&self, entry: &KvEntry) -> bool {
        self.range.as_ref().map_or(true, |r| r.contains(&entry.key))
            && self.pattern.as_ref().map_or(true, |p| p.matches(&entry.key))
            && self.created.contains(entry.created_at)
            && self.value_filter.as_ref().map_or(true, |f| f.matches(&entry.value))
    }
}

/// Apply `offset` then `limit` to an already ordered result.
pub(crate) fn page<T>(rows: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Options for [`PrefixRangeScanner::get_with_prefix`].
#[derive(Debug, Clone, Default)]
pub struct PrefixScanOptions {
    /// Post-filter: key must contain this substring
    pub contains: Option<String>,
    /// Post-filter: creation-time bounds
    pub created: TimeBounds,
    /// Result order
    pub order: ScanOrder,
    /// Maximum number of rows returned
    pub limit: Option<usize>,
    /// Rows skipped
    pub offset: usize,
}

impl PrefixScanOptions {
    fn has_post_filter(&self) -> bool {
        self.contains.is_some() || !self.created.is_open()
    }
}

/// Options for the `LIKE`-style pattern scans.
#[derive(Debug, Clone, Default)]
pub struct PatternScanOptions {
    /// `ILIKE` instead of `LIKE`
    pub case_insensitive: bool,
    /// Result order
    pub order: ScanOrder,
    /// Maximum number of rows returned
    pub limit: Option<usize>,
    /// Rows skipped
    pub offset: usize,
}

/// Prefix and pattern queries over one table.
#[derive(Clone)]
pub struct PrefixRangeScanner {
    backend: Arc<dyn KvBackend>,
}

impl PrefixRangeScanner {
    /// Scanner over `backend`.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Entries whose key starts with `prefix`.
    #[instrument(skip(self, options), fields(table = %self.backend.table()))]
    pub async fn get_with_prefix(
        &self,
        prefix: &str,
        options: &PrefixScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        let post_filter = options.has_post_filter();
        let mut query = ScanQuery::all()
            .with_range(KeyRange::prefix(prefix))
            .with_order(options.order);
        if !post_filter {
            query = query.with_page(options.limit, options.offset);
        }

        let rows = self.backend.scan(&query).await.map_err(|e| {
            error!(error = %e, prefix = %prefix, "Prefix range scan failed");
            e
        })?;
        if !post_filter {
            return Ok(rows);
        }

        let filtered = rows
            .into_iter()
            .filter(|entry| {
                options
                    .contains
                    .as_deref()
                    .map_or(true, |needle| entry.key.contains(needle))
                    && options.created.contains(entry.created_at)
            })
            .collect();
        Ok(page(filtered, options.offset, options.limit))
    }

    /// Entries whose key contains `needle` (full table scan).
    #[instrument(skip(self, options), fields(table = %self.backend.table()))]
    pub async fn get_with_contains(
        &self,
        needle: &str,
        options: &PatternScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        let pattern = KeyPattern::Contains {
            needle: needle.to_string(),
            case_insensitive: options.case_insensitive,
        };
        self.pattern_scan(pattern, options).await
    }

    /// Entries whose key ends with `suffix` (full table scan).
    #[instrument(skip(self, options), fields(table = %self.backend.table()))]
    pub async fn get_with_suffix(
        &self,
        suffix: &str,
        options: &PatternScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        let pattern = KeyPattern::Suffix {
            suffix: suffix.to_string(),
            case_insensitive: options.case_insensitive,
        };
        self.pattern_scan(pattern, options).await
    }

    async fn pattern_scan(
        &self,
        pattern: KeyPattern,
        options: &PatternScanOptions,
    ) -> KVResult<Vec<KvEntry>> {
        let query = ScanQuery::all()
            .with_pattern(pattern)
            .with_order(options.order)
            .with_page(options.limit, options.offset);
        self.backend.scan(&query).await.map_err(|e| {
            error!(error = %e, pattern = ?query.pattern, "Key pattern scan failed");
            e
        })
    }
}
