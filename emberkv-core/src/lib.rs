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

//! EmberKV core vocabulary.
//!
//! Shared types spoken on both sides of the engine boundary: the [`Item`]
//! wire record and its shared [`Blob`], operation status codes, the error
//! type, and the engine-relative [`Clock`].

pub mod error;
pub mod item;
pub mod status;
pub mod time;

pub use error::{EmberError, Result};
pub use item::{next_cas, Blob, Item, ItemMetadata, MAX_KEY_LEN, NO_ROWID};
pub use status::{AddStatus, EngineStatus, MutationStatus};
pub use time::{is_expired, Clock, RelTime};
