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

//! Bounded retry with a fixed backoff for transient contention.
//!
//! SQLite reports `SQLITE_BUSY` / `SQLITE_LOCKED` when another connection
//! holds the write lock. Those errors map to [`KVError::Transient`] and are
//! retried here; every other error is returned on the first attempt.

use crate::config::RetryPolicy;
use crate::{KVError, KVResult};
use backon::{ConstantBuilder, Retryable};
use metrics::counter;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `operation`, retrying transient failures according to `policy`.
///
/// When attempts are exhausted the last [`KVError::Transient`] is returned.
pub async fn with_busy_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> KVResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KVResult<T>>,
{
    // max_times counts retries, not attempts
    let retries = policy.max_attempts.saturating_sub(1) as usize;
    let backoff = ConstantBuilder::default()
        .with_delay(policy.backoff)
        .with_max_times(retries);

    operation
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(KVError::is_transient)
        .notify(|err: &KVError, delay: Duration| {
            counter!("tablekv_busy_retries_total").increment(1);
            warn!(
                operation = operation_name,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Database busy, retrying"
            );
        })
        .await
}
