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

//! SQL-based KeyValue tables (SQLite and PostgreSQL).
//!
//! ## Purpose
//! Provides persistent, transactional tables using relational databases. The
//! two backends share every statement shape; only placeholders and column
//! types differ, and those are decided here per [`Dialect`]. PostgreSQL merges
//! JSON server-side; SQLite merges inside a `BEGIN IMMEDIATE` transaction.
//!
//! ## Schema
//! ```sql
//! -- SQLite schema (value type depends on the store's ValueKind)
//! CREATE TABLE settings (
//!     key TEXT PRIMARY KEY,           -- Clustered index (automatic)
//!     value TEXT NOT NULL,
//!     created_at BIGINT NOT NULL,     -- Unix epoch milliseconds
//!     updated_at BIGINT NOT NULL
//! );
//! CREATE INDEX idx_settings_created_at ON settings(created_at);
//! ```
//!
//! **PostgreSQL schema**: Same table structure; `key TEXT COLLATE "C"` so the
//! primary key orders bytewise, and native `JSONB` / `BYTEA` / `DOUBLE
//! PRECISION` / `BOOLEAN` value columns.
//!
//! **Performance Characteristics**:
//! - Point lookup: O(log n) via PRIMARY KEY
//! - Prefix query: O(k log n) where k = matching keys (range on PRIMARY KEY)
//! - Contains / suffix query: O(n), no index assistance

mod postgres;
mod sqlite;

pub use postgres::{PostgresTable, PostgresTransaction};
pub use sqlite::{SqliteTable, SqliteTransaction};

use crate::codec::{KvValue, ValueKind};
use crate::scan::{KeyPattern, ScanOrder, ScanQuery, ValueFilter};
use crate::{KVError, KVResult};

/// Keys per `IN (...)` list; larger requests are split.
pub(crate) const IN_LIST_CHUNK: usize = 500;

/// Longest accepted table name (PostgreSQL identifier limit).
const MAX_TABLE_NAME_LEN: usize = 63;

/// SQL flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", index),
        }
    }

    /// `count` placeholders starting at 1-based `first`, comma separated.
    fn placeholders(&self, first: usize, count: usize) -> String {
        (first..first + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn value_column(&self, kind: ValueKind) -> &'static str {
        match (self, kind) {
            (Dialect::Sqlite, ValueKind::Json) => "TEXT",
            (Dialect::Sqlite, ValueKind::Text) => "TEXT",
            (Dialect::Sqlite, ValueKind::Binary) => "BLOB",
            (Dialect::Sqlite, ValueKind::Number) => "REAL",
            (Dialect::Sqlite, ValueKind::Boolean) => "INTEGER",
            (Dialect::Postgres, ValueKind::Json) => "JSONB",
            (Dialect::Postgres, ValueKind::Text) => "TEXT",
            (Dialect::Postgres, ValueKind::Binary) => "BYTEA",
            (Dialect::Postgres, ValueKind::Number) => "DOUBLE PRECISION",
            (Dialect::Postgres, ValueKind::Boolean) => "BOOLEAN",
        }
    }

    fn key_column(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "key TEXT PRIMARY KEY",
            Dialect::Postgres => "key TEXT COLLATE \"C\" PRIMARY KEY",
        }
    }
}

/// Reject anything that is not a plain SQL identifier.
///
/// Table names are interpolated into statements, so this is the only thing
/// standing between a caller-supplied name and the SQL text.
pub(crate) fn validate_table_name(name: &str) -> KVResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_TABLE_NAME_LEN {
        return Err(KVError::InvalidArgument(format!(
            "table name must match [A-Za-z_][A-Za-z0-9_]* and be at most {} bytes: {:?}",
            MAX_TABLE_NAME_LEN, name
        )));
    }
    Ok(())
}

/// Fixed statements for one table.
///
/// Bind order for `upsert`, `insert_new` and `merge`: key, value, created_at,
/// updated_at. `merge` exists only for PostgreSQL; SQLite merges client-side
/// inside an immediate transaction.
#[derive(Debug, Clone)]
pub(crate) struct Statements {
    pub dialect: Dialect,
    pub table: String,
    pub create: Vec<String>,
    pub select_one: String,
    pub upsert: String,
    pub insert_new: String,
    pub merge: Option<String>,
    pub clear: String,
    pub count: String,
}

impl Statements {
    pub(crate) fn new(dialect: Dialect, table: &str, kind: ValueKind) -> Self {
        let p = |i| dialect.placeholder(i);
        let insert_head = format!(
            "INSERT INTO {t} (key, value, created_at, updated_at) VALUES ({}, {}, {}, {})",
            p(1),
            p(2),
            p(3),
            p(4),
            t = table
        );
        let merge = match dialect {
            Dialect::Sqlite => None,
            Dialect::Postgres => Some(format!(
                "{} ON CONFLICT(key) DO UPDATE SET value = tablekv_jsonb_deep_merge({}.value, excluded.value), updated_at = excluded.updated_at",
                insert_head, table
            )),
        };

        Self {
            dialect,
            table: table.to_string(),
            create: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({}, value {} NOT NULL, created_at BIGINT NOT NULL, updated_at BIGINT NOT NULL)",
                    table,
                    dialect.key_column(),
                    dialect.value_column(kind)
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_created_at ON {t}(created_at)",
                    t = table
                ),
            ],
            select_one: format!(
                "SELECT key, value, created_at, updated_at FROM {} WHERE key = {}",
                table,
                p(1)
            ),
            upsert: format!(
                "{} ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                insert_head
            ),
            insert_new: format!("{} ON CONFLICT(key) DO NOTHING", insert_head),
            merge,
            clear: format!("DELETE FROM {}", table),
            count: format!("SELECT COUNT(*) FROM {}", table),
        }
    }

    pub(crate) fn select_many(&self, count: usize) -> String {
        format!(
            "SELECT key, value, created_at, updated_at FROM {} WHERE key IN ({})",
            self.table,
            self.dialect.placeholders(1, count)
        )
    }

    pub(crate) fn delete_many(&self, count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE key IN ({})",
            self.table,
            self.dialect.placeholders(1, count)
        )
    }

    /// Translate a [`ScanQuery`] into SQL plus its parameters.
    pub(crate) fn scan(&self, query: &ScanQuery) -> KVResult<(String, Vec<SqlParam>)> {
        let mut builder = WhereBuilder::new(self.dialect);

        if let Some(range) = &query.range {
            let start = builder.bind(SqlParam::Text(range.start.clone()));
            builder.push(format!("key >= {}", start));
            if let Some(end) = &range.end {
                let end = builder.bind(SqlParam::Text(end.clone()));
                builder.push(format!("key < {}", end));
            }
        }

        if let Some(pattern) = &query.pattern {
            builder.pattern(pattern);
        }

        if let Some(from) = query.created.from {
            let from = builder.bind(SqlParam::Int(from.timestamp_millis()));
            builder.push(format!("created_at >= {}", from));
        }
        if let Some(to) = query.created.to {
            let to = builder.bind(SqlParam::Int(to.timestamp_millis()));
            builder.push(format!("created_at <= {}", to));
        }

        if let Some(filter) = &query.value_filter {
            builder.value_filter(filter)?;
        }

        let mut sql = format!(
            "SELECT key, value, created_at, updated_at FROM {}{}",
            self.table,
            builder.where_clause()
        );
        sql.push_str(match query.order {
            ScanOrder::Ascending => " ORDER BY key ASC",
            ScanOrder::Descending => " ORDER BY key DESC",
        });
        match (query.limit, query.offset, self.dialect) {
            (Some(limit), offset, _) => {
                sql.push_str(&format!(" LIMIT {}", limit));
                if offset > 0 {
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
            }
            (None, 0, _) => {}
            // SQLite only accepts OFFSET after a LIMIT
            (None, offset, Dialect::Sqlite) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, offset, Dialect::Postgres) => sql.push_str(&format!(" OFFSET {}", offset)),
        }

        Ok((sql, builder.params))
    }
}

/// Query parameter, bound by each backend in its own way.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Text(String),
    Int(i64),
    TextArray(Vec<String>),
    Value(KvValue),
}

struct WhereBuilder {
    dialect: Dialect,
    clauses: Vec<String>,
    params: Vec<SqlParam>,
}

impl WhereBuilder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            clauses: Vec::new(),
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn pattern(&mut self, pattern: &KeyPattern) {
        let (text, case_insensitive, is_suffix) = match pattern {
            KeyPattern::Contains {
                needle,
                case_insensitive,
            } => (needle, *case_insensitive, false),
            KeyPattern::Suffix {
                suffix,
                case_insensitive,
            } => (suffix, *case_insensitive, true),
        };
        if text.is_empty() {
            return;
        }
        // lower() folds ASCII only on both dialects (SQLite without ICU, key COLLATE "C")
        let (key, text) = if case_insensitive {
            ("lower(key)", text.to_ascii_lowercase())
        } else {
            ("key", text.clone())
        };
        let clause = match (is_suffix, self.dialect) {
            (false, Dialect::Sqlite) => {
                let needle = self.bind(SqlParam::Text(text));
                format!("instr({}, {}) > 0", key, needle)
            }
            (false, Dialect::Postgres) => {
                let needle = self.bind(SqlParam::Text(text));
                format!("strpos({}, {}) > 0", key, needle)
            }
            (true, Dialect::Sqlite) => {
                let len = self.bind(SqlParam::Text(text.clone()));
                let suffix = self.bind(SqlParam::Text(text));
                format!("substr({}, -length({})) = {}", key, len, suffix)
            }
            (true, Dialect::Postgres) => {
                let len = self.bind(SqlParam::Text(text.clone()));
                let suffix = self.bind(SqlParam::Text(text));
                format!("right({}, char_length({})) = {}", key, len, suffix)
            }
        };
        self.push(clause);
    }

    fn value_filter(&mut self, filter: &ValueFilter) -> KVResult<()> {
        match filter {
            ValueFilter::JsonEquals { path, value } => match self.dialect {
                // json_extract returns containers as text in stored key order,
                // so the backend compares them after decoding
                Dialect::Sqlite if filter.compares_container() => {
                    let path = self.bind(SqlParam::Text(sqlite_json_path(path)?));
                    let json_type = if value.is_array() { "array" } else { "object" };
                    self.push(format!("json_type(value, {}) = '{}'", path, json_type));
                }
                Dialect::Sqlite => {
                    let path = self.bind(SqlParam::Text(sqlite_json_path(path)?));
                    let expected = self.bind(SqlParam::Text(value.to_string()));
                    self.push(format!(
                        "json_extract(value, {}) = json_extract({}, '$')",
                        path, expected
                    ));
                }
                Dialect::Postgres => {
                    let path = self.bind(SqlParam::TextArray(path.clone()));
                    let expected = self.bind(SqlParam::Value(KvValue::Json(value.clone())));
                    self.push(format!("value #> {} = {}", path, expected));
                }
            },
            ValueFilter::BoolEquals(flag) => {
                let flag = self.bind(SqlParam::Value(KvValue::Boolean(*flag)));
                self.push(format!("value = {}", flag));
            }
        }
        Ok(())
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// `["a", "b"]` -> `$."a"."b"`
fn sqlite_json_path(path: &[String]) -> KVResult<String> {
    let mut out = String::from("$");
    for field in path {
        if field.contains('"') {
            return Err(KVError::InvalidArgument(format!(
                "JSON path field may not contain '\"': {}",
                field
            )));
        }
        out.push_str(&format!(".\"{}\"", field));
    }
    Ok(out)
}
