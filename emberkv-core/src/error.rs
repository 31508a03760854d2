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

//! Error types for EmberKV

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("vbucket {vbid} out of range (capacity {capacity})")]
    VbucketOutOfRange { vbid: u16, capacity: usize },

    #[error("engine is shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EmberError>;
