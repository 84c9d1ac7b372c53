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

//! Recursive merge of JSON documents.
//!
//! Objects merge key-wise; everything else (scalars, arrays, type
//! mismatches) is replaced by the partial value. The SQL backends evaluate
//! the same rule inside the database so concurrent merges do not lose
//! updates; this function is the in-process rendition used by the in-memory
//! backend.

use serde_json::Value;

/// Merge `partial` into `target` in place.
pub fn deep_merge_into(target: &mut Value, partial: Value) {
    match (target, partial) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (field, value) in incoming {
                let nested = value.is_object() && existing.get(&field).is_some_and(Value::is_object);
                if !nested {
                    existing.insert(field, value);
                } else if let Some(slot) = existing.get_mut(&field) {
                    deep_merge_into(slot, value);
                }
            }
        }
        (slot, partial) => *slot = partial,
    }
}

/// Return `existing` merged with `partial`.
pub fn deep_merge(existing: &Value, partial: &Value) -> Value {
    let mut merged = existing.clone();
    deep_merge_into(&mut merged, partial.clone());
    merged
}
