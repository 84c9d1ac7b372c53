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

//! Error types for KeyValue operations.

use crate::codec::{StoreOperation, ValueKind};
use thiserror::Error;

/// Result type for KeyValue operations.
pub type KVResult<T> = Result<T, KVError>;

/// Errors that can occur during KeyValue operations.
#[derive(Error, Debug)]
pub enum KVError {
    /// Missing or invalid connection parameters
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation not valid for the store's configured value kind
    #[error("Operation {operation} is not supported for {kind} stores")]
    TypeUnsupported {
        /// Configured value kind of the store
        kind: ValueKind,
        /// Rejected operation
        operation: StoreOperation,
    },

    /// Add-only write hit an existing key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A multi-write operation failed and was rolled back
    #[error("Transaction failed during {operation}: {source}")]
    Transaction {
        /// Operation that opened the transaction
        operation: String,
        /// Underlying failure
        #[source]
        source: Box<KVError>,
    },

    /// Contention that is worth retrying (database busy/locked)
    #[error("Transient error: {0}")]
    Transient(String),

    /// Backend error (database, driver, etc.)
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Value does not match the configured kind
    #[error("Invalid value format: {0}")]
    InvalidValue(String),

    /// Invalid argument to an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stored chunks disagree with the array metadata
    #[error("Corrupt array {key}: {reason}")]
    CorruptArray {
        /// Base key of the array
        key: String,
        /// What did not add up
        reason: String,
    },

    /// The connection pool was closed
    #[error("Connection pool is closed")]
    PoolClosed,
}

impl KVError {
    /// True when retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            KVError::Transient(_) => true,
            KVError::Transaction { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        KVError::CorruptArray {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for KVError {
    fn from(err: serde_json::Error) -> Self {
        KVError::SerializationError(err.to_string())
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
#[cfg(feature = "sql-backend")]
fn is_sqlite_busy_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}

#[cfg(feature = "sql-backend")]
impl From<sqlx::Error> for KVError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // Numeric codes are only SQLite result codes; PostgreSQL reports SQLSTATEs
            if db_err.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
                let busy = db_err.code().is_some_and(|code| is_sqlite_busy_code(&code));
                if busy || db_err.message().contains("database is locked") {
                    return KVError::Transient(format!("SQL error: {}", err));
                }
            }
        }
        if matches!(err, sqlx::Error::PoolClosed) {
            return KVError::PoolClosed;
        }
        KVError::BackendError(format!("SQL error: {}", err))
    }
}
