// SPDX-License-Identifier: AGPL-3.0-or-later
// EmberKV - Eventually-Persistent Partitioned Key-Value Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Operation status codes.
//!
//! Client-visible outcomes are values, not errors: a CAS mismatch or a
//! not-yet-resident value is a normal result of running the protocol, so
//! the engine surfaces them as [`EngineStatus`] rather than `Err`.
//! [`EmberError`](crate::EmberError) is reserved for environmental
//! failures (I/O, misconfiguration).

/// Status surfaced to the front end for every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    /// Operation completed.
    Success,
    /// No such key in the addressed vbucket.
    KeyNotFound,
    /// Key already present, or CAS mismatch on a guarded mutation.
    KeyExists,
    /// The addressed vbucket is not in a state that serves this op.
    NotMyVbucket,
    /// Accepted, but the answer will arrive asynchronously; re-drive later.
    WouldBlock,
    /// Transient resource shortage; retrying is expected to succeed.
    TempFail,
    /// The value is locked and the supplied CAS did not open it.
    Locked,
    /// Supplied CAS does not match the stored one.
    InvalidCas,
    /// Memory budget exhausted.
    NoMem,
    /// The connection should be dropped.
    Disconnect,
}

impl EngineStatus {
    pub fn is_success(self) -> bool {
        self == EngineStatus::Success
    }

    /// True for outcomes a client is expected to retry verbatim.
    pub fn is_transient(self) -> bool {
        matches!(self, EngineStatus::WouldBlock | EngineStatus::TempFail)
    }
}

/// Outcome of a hash-table mutation, before engine-level mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Key was absent. On a CAS-carrying set this is a rejection; on a
    /// CAS-less set the value has been freshly inserted.
    NotFound,
    /// Updated a value whose previous mutation was already persisted.
    WasClean,
    /// Updated a value that still had a persistence entry outstanding.
    WasDirty,
    /// The value is locked and the mutation did not carry the opening CAS.
    IsLocked,
    /// Non-zero CAS supplied and it did not match.
    InvalidCas,
    /// Memory budget exhausted; nothing was stored.
    NoMem,
}

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    Success,
    Exists,
    NoMem,
}
