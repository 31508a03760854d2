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

//! Engine configuration.
//!
//! Parsing config files is the embedder's business; the engine takes a
//! plain struct.

use crate::stored_value::StoredValueType;

/// Longest artificial delay a background fetch may be configured with.
pub const MAX_BG_FETCH_DELAY: u32 = 900;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backend plug: `memory` or `blackhole`.
    pub backend: String,
    /// Memory budget for all resident data, bytes.
    pub max_size: usize,
    /// Fraction of `max_size` above which the pager starts evicting.
    pub mem_high_watermark: f64,
    /// Fraction of `max_size` the pager evicts down to.
    pub mem_low_watermark: f64,
    /// Hash-table buckets per partition; 0 selects the default.
    pub ht_size: usize,
    /// Lock stripes per partition table; 0 selects the default.
    pub ht_locks: usize,
    /// Record shape allocated by the tables.
    pub stored_val_type: StoredValueType,
    /// Fixed partition-map capacity.
    pub max_vbuckets: usize,
    /// Items per flusher transaction.
    pub transaction_size: usize,
    /// Artificial delay before background fetches, seconds; capped at
    /// [`MAX_BG_FETCH_DELAY`].
    pub bg_fetch_delay: u32,
    /// Items expiring within this many seconds are not worth persisting.
    pub item_expiry_window: u32,
    /// Seconds between expiry-pager sweeps; 0 disables the pager.
    pub expiry_pager_sleeptime: u64,
    /// Seconds between access-pattern scans, biasing pager phase choice.
    pub access_scanner_sleeptime: u64,
    /// Buckets erased per chunk during partition deletion.
    pub vb_del_chunk_size: usize,
    /// Budget in milliseconds before a deletion chunk yields.
    pub vb_chunk_del_threshold_time: u64,
    /// Run reads on their own dispatcher, separate from the flusher's.
    pub concurrent_db: bool,
    /// Rebuild memory state from the backend at startup.
    pub warmup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backend: "memory".to_string(),
            max_size: 256 * 1024 * 1024,
            mem_high_watermark: 0.75,
            mem_low_watermark: 0.60,
            ht_size: 0,
            ht_locks: 0,
            stored_val_type: StoredValueType::Featured,
            max_vbuckets: 1024,
            transaction_size: 250,
            bg_fetch_delay: 0,
            item_expiry_window: 3,
            expiry_pager_sleeptime: 3600,
            access_scanner_sleeptime: 86400,
            vb_del_chunk_size: 100,
            vb_chunk_del_threshold_time: 500,
            concurrent_db: true,
            warmup: true,
        }
    }
}

impl EngineConfig {
    /// Byte threshold above which the pager starts working.
    pub fn high_watermark(&self) -> usize {
        (self.max_size as f64 * self.mem_high_watermark) as usize
    }

    /// Byte threshold the pager drives usage down to.
    pub fn low_watermark(&self) -> usize {
        (self.max_size as f64 * self.mem_low_watermark) as usize
    }
}
