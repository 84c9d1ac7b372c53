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

//! PostgreSQL table backend.
//!
//! JSON tables merge through `tablekv_jsonb_deep_merge`, a PL/pgSQL function
//! installed when the first JSON table is opened. Objects merge key-wise,
//! everything else is replaced by the incoming value (including `null`).

use super::{validate_table_name, Dialect, SqlParam, Statements, IN_LIST_CHUNK};
use crate::codec::{now_millis, timestamp_from_millis, KvEntry, KvValue, ValueKind};
use crate::scan::ScanQuery;
use crate::{KVError, KVResult, KvBackend, KvTransaction};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{debug, instrument};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const MERGE_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION tablekv_jsonb_deep_merge(target jsonb, patch jsonb)
RETURNS jsonb
LANGUAGE plpgsql
IMMUTABLE
AS $merge$
DECLARE
    merged jsonb;
    field text;
    incoming jsonb;
BEGIN
    IF jsonb_typeof(target) IS DISTINCT FROM 'object'
       OR jsonb_typeof(patch) IS DISTINCT FROM 'object' THEN
        RETURN patch;
    END IF;
    merged := target;
    FOR field, incoming IN SELECT key, value FROM jsonb_each(patch) LOOP
        IF jsonb_typeof(merged -> field) = 'object' AND jsonb_typeof(incoming) = 'object' THEN
            merged := merged || jsonb_build_object(field, tablekv_jsonb_deep_merge(merged -> field, incoming));
        ELSE
            merged := merged || jsonb_build_object(field, incoming);
        END IF;
    END LOOP;
    RETURN merged;
END;
$merge$
"#;

fn bind_value<'q>(query: PgQuery<'q>, value: &KvValue) -> PgQuery<'q> {
    match value {
        KvValue::Json(v) => query.bind(Json(v.clone())),
        KvValue::Text(s) => query.bind(s.clone()),
        KvValue::Binary(b) => query.bind(b.clone()),
        KvValue::Number(n) => query.bind(*n),
        KvValue::Boolean(b) => query.bind(*b),
    }
}

fn bind_param<'q>(query: PgQuery<'q>, param: &SqlParam) -> PgQuery<'q> {
    match param {
        SqlParam::Text(s) => query.bind(s.clone()),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::TextArray(items) => query.bind(items.clone()),
        SqlParam::Value(value) => bind_value(query, value),
    }
}

fn decode_value(kind: ValueKind, row: &PgRow) -> KVResult<KvValue> {
    Ok(match kind {
        ValueKind::Json => {
            let Json(doc): Json<serde_json::Value> = row.try_get("value")?;
            KvValue::Json(doc)
        }
        ValueKind::Text => KvValue::Text(row.try_get("value")?),
        ValueKind::Binary => KvValue::Binary(row.try_get("value")?),
        ValueKind::Number => KvValue::Number(row.try_get("value")?),
        ValueKind::Boolean => KvValue::Boolean(row.try_get("value")?),
    })
}

fn decode_entry(kind: ValueKind, row: &PgRow) -> KVResult<KvEntry> {
    Ok(KvEntry {
        key: row.try_get("key")?,
        value: decode_value(kind, row)?,
        created_at: timestamp_from_millis(row.try_get("created_at")?),
        updated_at: timestamp_from_millis(row.try_get("updated_at")?),
    })
}

/// PostgreSQL-backed table.
///
/// ## Example
/// ```rust,no_run
/// use tablekv_keyvalue::{KvBackend, PostgresTable, ValueKind};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = sqlx::PgPool::connect("postgres://localhost/tablekv").await?;
/// let table = PostgresTable::open(pool, "docs", ValueKind::Json).await?;
///
/// table.merge_json("cfg", &serde_json::json!({"a": {"x": 1}})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresTable {
    pool: Pool<Postgres>,
    kind: ValueKind,
    statements: Arc<Statements>,
}

impl PostgresTable {
    /// Open `table` on `pool`, creating it (and the merge function for JSON
    /// tables) if needed.
    pub async fn open(pool: Pool<Postgres>, table: &str, kind: ValueKind) -> KVResult<Self> {
        validate_table_name(table)?;
        let statements = Statements::new(Dialect::Postgres, table, kind);
        if kind == ValueKind::Json {
            sqlx::raw_sql(MERGE_FUNCTION).execute(&pool).await?;
        }
        for ddl in &statements.create {
            sqlx::query(ddl).execute(&pool).await?;
        }
        debug!(table = %table, kind = %kind, "Opened PostgreSQL table");

        Ok(Self {
            pool,
            kind,
            statements: Arc::new(statements),
        })
    }

    async fn write(&self, sql: &str, key: &str, value: &KvValue) -> KVResult<u64> {
        let now = now_millis();
        let result = bind_value(sqlx::query(sql).bind(key.to_string()), value)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl KvBackend for PostgresTable {
    fn table(&self) -> &str {
        &self.statements.table
    }

    fn kind(&self) -> ValueKind {
        self.kind
    }

    fn backend_type(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn get(&self, key: &str) -> KVResult<Option<KvEntry>> {
        let row = sqlx::query(&self.statements.select_one)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_entry(self.kind, &row)).transpose()
    }

    async fn get_many(&self, keys: &[String]) -> KVResult<Vec<KvEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(IN_LIST_CHUNK) {
            let sql = self.statements.select_many(chunk.len());
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key.clone());
            }
            for row in query.fetch_all(&self.pool).await? {
                entries.push(decode_entry(self.kind, &row)?);
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self, value), fields(table = %self.statements.table))]
    async fn put(&self, key: &str, value: &KvValue) -> KVResult<()> {
        self.write(&self.statements.upsert, key, value).await?;
        Ok(())
    }

    async fn insert(&self, key: &str, value: &KvValue) -> KVResult<bool> {
        Ok(self.write(&self.statements.insert_new, key, value).await? == 1)
    }

    async fn delete_many(&self, keys: &[String]) -> KVResult<u64> {
        let mut deleted = 0;
        for chunk in keys.chunks(IN_LIST_CHUNK) {
            let sql = self.statements.delete_many(chunk.len());
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key.clone());
            }
            deleted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    async fn clear(&self) -> KVResult<u64> {
        Ok(sqlx::query(&self.statements.clear)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn count(&self) -> KVResult<u64> {
        let count: i64 = sqlx::query_scalar(&self.statements.count)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn scan(&self, query: &ScanQuery) -> KVResult<Vec<KvEntry>> {
        let (sql, params) = self.statements.scan(query)?;
        let mut sql_query = sqlx::query(&sql);
        for param in &params {
            sql_query = bind_param(sql_query, param);
        }
        let rows = sql_query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_entry(self.kind, row)).collect()
    }

    #[instrument(skip(self, partial), fields(table = %self.statements.table))]
    async fn merge_json(&self, key: &str, partial: &serde_json::Value) -> KVResult<()> {
        let sql = self.statements.merge.as_deref().ok_or_else(|| {
            KVError::BackendError("PostgreSQL merge statement was not prepared".to_string())
        })?;
        self.write(sql, key, &KvValue::Json(partial.clone())).await?;
        Ok(())
    }

    async fn begin(&self) -> KVResult<Box<dyn KvTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction {
            tx,
            kind: self.kind,
            statements: self.statements.clone(),
        }))
    }
}

/// Transaction over one PostgreSQL table. Dropping it without commit rolls back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    kind: ValueKind,
    statements: Arc<Statements>,
}

#[async_trait]
impl KvTransaction for PostgresTransaction {
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

    #[test]
    fn test_merge_function_is_recursive() {
        assert!(MERGE_FUNCTION.contains("CREATE OR REPLACE FUNCTION tablekv_jsonb_deep_merge"));
        assert!(MERGE_FUNCTION.contains("tablekv_jsonb_deep_merge(merged -> field, incoming)"));
    }

    #[test]
    fn test_postgres_statements() {
        let stmts = Statements::new(Dialect::Postgres, "flags", ValueKind::Boolean);
        assert!(stmts.create[0].contains("value BOOLEAN NOT NULL"));
        assert_eq!(
            stmts.insert_new,
            "INSERT INTO flags (key, value, created_at, updated_at) VALUES ($1, $2, $3, $4) ON CONFLICT(key) DO NOTHING"
        );
    }
}
