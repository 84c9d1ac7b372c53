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

//! Shared connection pool with an explicit open/close lifecycle.
//!
//! One [`ConnectionPool`] is opened per process (or per test) and passed by
//! reference to every [`KvStore::open`](crate::KvStore::open). All tables and
//! all array operations share its connections. After [`ConnectionPool::close`]
//! new tables cannot be opened and in-flight SQL handles fail with
//! [`KVError::PoolClosed`].

use crate::config::{BackendType, KVConfig};
use crate::memory::MemoryDatabase;
use crate::{KVError, KVResult, KvBackend, ValueKind};
use std::sync::Arc;
use tracing::{info, instrument};

#[cfg(feature = "sql-backend")]
use crate::config::{PostgresConnection, RetryPolicy};
#[cfg(feature = "sql-backend")]
use crate::sql::{PostgresTable, SqliteTable};
#[cfg(feature = "sql-backend")]
use sqlx::{PgPool, SqlitePool};

/// Connections shared by every store opened from it.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub enum ConnectionPool {
    /// In-memory tables
    InMemory(MemoryDatabase),
    /// SQLite connections
    #[cfg(feature = "sql-backend")]
    Sqlite {
        /// Underlying pool
        pool: SqlitePool,
        /// Busy retry policy applied to every table
        retry: RetryPolicy,
    },
    /// PostgreSQL connections
    #[cfg(feature = "sql-backend")]
    Postgres(PgPool),
}

impl ConnectionPool {
    /// Open a pool for the configured backend.
    ///
    /// ## Returns
    /// `Err(KVError::ConfigError)` when the backend is not compiled in or the
    /// connection parameters are unusable.
    #[instrument(skip(config), fields(backend = ?config.backend))]
    pub async fn open(config: &KVConfig) -> KVResult<Self> {
        let pool = match &config.backend {
            BackendType::InMemory => ConnectionPool::InMemory(MemoryDatabase::new()),

            #[cfg(feature = "sql-backend")]
            BackendType::Sqlite { path } => ConnectionPool::Sqlite {
                pool: Self::open_sqlite(path, config).await?,
                retry: config.retry,
            },

            #[cfg(feature = "sql-backend")]
            BackendType::PostgreSQL {
                connection,
                pool_size,
            } => ConnectionPool::Postgres(Self::open_postgres(connection, *pool_size, config).await?),

            #[cfg(not(feature = "sql-backend"))]
            other => {
                return Err(KVError::ConfigError(format!(
                    "{:?} requires the sql-backend feature",
                    other
                )));
            }
        };
        info!(backend = pool.backend_type(), "Connection pool opened");
        Ok(pool)
    }

    #[cfg(feature = "sql-backend")]
    async fn open_sqlite(path: &str, config: &KVConfig) -> KVResult<SqlitePool> {
        use sqlx::sqlite::{
            SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
        };
        use std::str::FromStr;

        let in_memory = path == ":memory:" || path.is_empty();
        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        // Every connection to ":memory:" is a separate database, so an
        // in-memory pool keeps exactly one connection alive for its lifetime.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        Ok(pool_options
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?)
    }

    #[cfg(feature = "sql-backend")]
    async fn open_postgres(
        connection: &PostgresConnection,
        pool_size: u32,
        config: &KVConfig,
    ) -> KVResult<PgPool> {
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use std::str::FromStr;

        let options = match connection {
            PostgresConnection::Url(url) => PgConnectOptions::from_str(url)
                .map_err(|e| KVError::ConfigError(format!("Invalid PostgreSQL URL: {}", e)))?,
            PostgresConnection::Params {
                host,
                port,
                user,
                password,
                database,
            } => {
                let options = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user)
                    .database(database);
                match password {
                    Some(password) => options.password(password),
                    None => options,
                }
            }
        };

        Ok(PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?)
    }

    /// Open (creating if needed) one table on this pool.
    pub async fn open_table(&self, table: &str, kind: ValueKind) -> KVResult<Arc<dyn KvBackend>> {
        if self.is_closed() {
            return Err(KVError::PoolClosed);
        }
        match self {
            ConnectionPool::InMemory(db) => Ok(Arc::new(db.open_table(table, kind).await?)),
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Sqlite { pool, retry } => {
                Ok(Arc::new(SqliteTable::open(pool.clone(), table, kind, *retry).await?))
            }
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Postgres(pool) => {
                Ok(Arc::new(PostgresTable::open(pool.clone(), table, kind).await?))
            }
        }
    }

    /// Close every connection. Idempotent.
    pub async fn close(&self) {
        match self {
            ConnectionPool::InMemory(db) => db.close(),
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Sqlite { pool, .. } => pool.close().await,
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Postgres(pool) => pool.close().await,
        }
        info!(backend = self.backend_type(), "Connection pool closed");
    }

    /// Whether [`ConnectionPool::close`] was called.
    pub fn is_closed(&self) -> bool {
        match self {
            ConnectionPool::InMemory(db) => db.is_closed(),
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Sqlite { pool, .. } => pool.is_closed(),
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Postgres(pool) => pool.is_closed(),
        }
    }

    /// Backend name (e.g., "InMemory", "SQLite", "PostgreSQL").
    pub fn backend_type(&self) -> &'static str {
        match self {
            ConnectionPool::InMemory(_) => "InMemory",
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Sqlite { .. } => "SQLite",
            #[cfg(feature = "sql-backend")]
            ConnectionPool::Postgres(_) => "PostgreSQL",
        }
    }
}
