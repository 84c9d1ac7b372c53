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

//! Value kinds and the per-store value codec.
//!
//! ## Purpose
//! Every [`KvStore`](crate::KvStore) is opened with exactly one [`ValueKind`].
//! The kind decides the native column type of the table, which values may be
//! written, and which operations are legal. [`ValueCodec`] is built once from
//! that kind and checked on every call, before any I/O happens.
//!
//! ## Operation Support
//! | operation                         | Json | Text | Binary | Number | Boolean |
//! |-----------------------------------|------|------|--------|--------|---------|
//! | basic KV, key patterns, by-time   | yes  | yes  | yes    | yes    | yes     |
//! | merge, search_json, arrays        | yes  |      |        |        |         |
//! | find_bool_values                  |      |      |        |        | yes     |

use crate::{KVError, KVResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Kind of value held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Structured JSON documents (supports merge and JSON predicates)
    Json,
    /// UTF-8 text
    Text,
    /// Raw bytes
    Binary,
    /// Finite floating point numbers
    Number,
    /// Booleans
    Boolean,
}

impl ValueKind {
    /// Lowercase name used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Json => "json",
            ValueKind::Text => "text",
            ValueKind::Binary => "binary",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
        }
    }

    /// Parse a kind name (case-insensitive).
    pub fn parse(name: &str) -> KVResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" | "structured" => Ok(ValueKind::Json),
            "text" | "string" => Ok(ValueKind::Text),
            "binary" | "bytes" => Ok(ValueKind::Binary),
            "number" | "numeric" => Ok(ValueKind::Number),
            "boolean" | "bool" => Ok(ValueKind::Boolean),
            other => Err(KVError::ConfigError(format!(
                "Unknown value kind: {}. Valid options: json, text, binary, number, boolean",
                other
            ))),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store operations whose legality depends on the value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Deep merge of a partial document
    Merge,
    /// JSON field equality search
    SearchJson,
    /// JSON field equality search bounded by creation time
    SearchJsonByTime,
    /// Boolean value search
    FindBoolValues,
    /// Any chunked-array operation
    ChunkedArray,
}

impl StoreOperation {
    fn required_kind(&self) -> ValueKind {
        match self {
            StoreOperation::Merge
            | StoreOperation::SearchJson
            | StoreOperation::SearchJsonByTime
            | StoreOperation::ChunkedArray => ValueKind::Json,
            StoreOperation::FindBoolValues => ValueKind::Boolean,
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Merge => "merge",
            StoreOperation::SearchJson => "search_json",
            StoreOperation::SearchJsonByTime => "search_json_by_time",
            StoreOperation::FindBoolValues => "find_bool_values",
            StoreOperation::ChunkedArray => "chunked_array",
        };
        f.write_str(name)
    }
}

/// A value tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    /// JSON document
    Json(serde_json::Value),
    /// Text
    Text(String),
    /// Bytes
    Binary(Vec<u8>),
    /// Number
    Number(f64),
    /// Boolean
    Boolean(bool),
}

impl KvValue {
    /// Kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            KvValue::Json(_) => ValueKind::Json,
            KvValue::Text(_) => ValueKind::Text,
            KvValue::Binary(_) => ValueKind::Binary,
            KvValue::Number(_) => ValueKind::Number,
            KvValue::Boolean(_) => ValueKind::Boolean,
        }
    }

    /// Borrow the JSON document, if this is one.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            KvValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Consume into a JSON document, if this is one.
    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            KvValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            KvValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the bytes, if this is binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            KvValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// The number, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KvValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            KvValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Approximate encoded size in bytes.
    pub fn size_hint(&self) -> usize {
        match self {
            KvValue::Json(v) => v.to_string().len(),
            KvValue::Text(s) => s.len(),
            KvValue::Binary(b) => b.len(),
            KvValue::Number(_) => 8,
            KvValue::Boolean(_) => 1,
        }
    }
}

impl From<serde_json::Value> for KvValue {
    fn from(v: serde_json::Value) -> Self {
        KvValue::Json(v)
    }
}

impl From<String> for KvValue {
    fn from(v: String) -> Self {
        KvValue::Text(v)
    }
}

impl From<&str> for KvValue {
    fn from(v: &str) -> Self {
        KvValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for KvValue {
    fn from(v: Vec<u8>) -> Self {
        KvValue::Binary(v)
    }
}

impl From<&[u8]> for KvValue {
    fn from(v: &[u8]) -> Self {
        KvValue::Binary(v.to_vec())
    }
}

impl From<f64> for KvValue {
    fn from(v: f64) -> Self {
        KvValue::Number(v)
    }
}

impl From<i64> for KvValue {
    fn from(v: i64) -> Self {
        KvValue::Number(v as f64)
    }
}

impl From<bool> for KvValue {
    fn from(v: bool) -> Self {
        KvValue::Boolean(v)
    }
}

/// A stored row: key, value and its timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    /// Unique key
    pub key: String,
    /// Decoded value
    pub value: KvValue,
    /// First write to the key
    pub created_at: DateTime<Utc>,
    /// Most recent write to the key
    pub updated_at: DateTime<Utc>,
}

/// Serializer/validator bound to one [`ValueKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCodec {
    kind: ValueKind,
}

impl ValueCodec {
    /// Create a codec for `kind`.
    pub fn new(kind: ValueKind) -> Self {
        Self { kind }
    }

    /// Configured kind.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Reject `operation` unless the configured kind supports it.
    pub fn ensure_supports(&self, operation: StoreOperation) -> KVResult<()> {
        if operation.required_kind() == self.kind {
            Ok(())
        } else {
            Err(KVError::TypeUnsupported {
                kind: self.kind,
                operation,
            })
        }
    }

    /// Validate a value before it is written.
    pub fn encode(&self, value: KvValue) -> KVResult<KvValue> {
        match (self.kind, value) {
            (ValueKind::Number, KvValue::Number(n)) if !n.is_finite() => Err(
                KVError::InvalidValue(format!("number store cannot hold non-finite value {}", n)),
            ),
            (ValueKind::Json, KvValue::Json(v)) => Ok(KvValue::Json(v)),
            (ValueKind::Text, KvValue::Text(v)) => Ok(KvValue::Text(v)),
            (ValueKind::Binary, KvValue::Binary(v)) => Ok(KvValue::Binary(v)),
            (ValueKind::Number, KvValue::Number(v)) => Ok(KvValue::Number(v)),
            (ValueKind::Boolean, KvValue::Boolean(v)) => Ok(KvValue::Boolean(v)),
            // JSON scalars that fit the configured kind
            (ValueKind::Text, KvValue::Json(serde_json::Value::String(s))) => Ok(KvValue::Text(s)),
            (ValueKind::Number, KvValue::Json(serde_json::Value::Number(n))) => n
                .as_f64()
                .map(KvValue::Number)
                .ok_or_else(|| KVError::InvalidValue(format!("number {} is not representable", n))),
            (ValueKind::Boolean, KvValue::Json(serde_json::Value::Bool(b))) => Ok(KvValue::Boolean(b)),
            (kind, other) => Err(KVError::InvalidValue(format!(
                "{} store cannot hold a {} value",
                kind,
                other.kind()
            ))),
        }
    }

    /// Check a value read back from storage.
    pub fn decode(&self, value: KvValue) -> KVResult<KvValue> {
        if value.kind() == self.kind {
            Ok(value)
        } else {
            Err(KVError::InvalidValue(format!(
                "{} store returned a {} value",
                self.kind,
                value.kind()
            )))
        }
    }

    /// Serialize a typed value into a JSON document.
    pub fn to_json<T: Serialize + ?Sized>(&self, value: &T) -> KVResult<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Deserialize a JSON document into a typed value.
    pub fn from_json<T: DeserializeOwned>(&self, value: serde_json::Value) -> KVResult<T> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Current time as Unix epoch milliseconds (the stored timestamp resolution).
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stored epoch milliseconds back to a timestamp.
pub(crate) fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}
