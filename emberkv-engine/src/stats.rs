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

//! Engine-wide counters and latency histograms.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

const HISTO_BUCKETS: usize = 20;

/// Power-of-two microsecond latency histogram.
#[derive(Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; HISTO_BUCKETS],
}

impl LatencyHistogram {
    pub fn new() -> Self {
        LatencyHistogram::default()
    }

    pub fn add(&self, micros: u64) {
        let idx = if micros == 0 {
            0
        } else {
            (64 - micros.leading_zeros() as usize).min(HISTO_BUCKETS - 1)
        };
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Counts per bucket; bucket `i` covers latencies below 2^i µs.
    pub fn counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Counters the engine updates on the hot and background paths.
#[derive(Default)]
pub struct EngineStats {
    /// Background fetch requests enqueued but not yet completed.
    pub num_remaining_bg_jobs: AtomicUsize,
    /// Fetches completed (delivered to waiters).
    pub bg_fetched: AtomicU64,
    /// Fetches put back on a partition for retry.
    pub bg_requeued: AtomicU64,
    /// Fetches surfaced to clients as failures after the retry cap.
    pub bg_failed: AtomicU64,
    /// Records reaped by the expiry pager.
    pub expired_pager: AtomicU64,
    /// Records reaped on access (lookup or eviction sweep).
    pub expired_access: AtomicU64,
    /// Successful flusher transactions.
    pub flusher_commits: AtomicU64,
    /// Flusher transactions that failed and went to the reject queue.
    pub flusher_commit_failures: AtomicU64,
    /// Mutations refused with a transient out-of-memory condition.
    pub tmp_oom_errors: AtomicU64,
    /// Values ejected by the pager or an explicit evict.
    pub num_values_ejected: AtomicU64,
    /// Records currently resident as metadata shells only.
    pub num_non_resident: AtomicUsize,
    /// Entries sitting on dirty queues, engine-wide.
    pub disk_queue_size: AtomicUsize,
    /// A whole-store flush is pending in the persistence path.
    pub disk_flush_all: AtomicBool,
    /// Records loaded at warmup.
    pub warmed_up: AtomicU64,
    /// EMA of per-item flusher transaction time, nanoseconds.
    pub last_trans_time_per_item_ns: AtomicU64,
    /// Cached resident ratios (percent), refreshed by the pager sweep.
    pub active_resident_ratio: AtomicUsize,
    pub replica_resident_ratio: AtomicUsize,
    /// Latency of batched backend fetches.
    pub get_multi_histo: LatencyHistogram,
    /// Time fetch requests wait before their batch starts.
    pub bg_wait_histo: LatencyHistogram,
    /// Time the backend takes to serve a batch.
    pub bg_load_histo: LatencyHistogram,
}

impl EngineStats {
    pub fn new() -> Self {
        EngineStats {
            active_resident_ratio: AtomicUsize::new(100),
            replica_resident_ratio: AtomicUsize::new(100),
            ..EngineStats::default()
        }
    }

    /// Fold a new per-item transaction time into the running average.
    pub fn update_trans_time_per_item(&self, nanos: u64) {
        let old = self.last_trans_time_per_item_ns.load(Ordering::Relaxed);
        let next = if old == 0 { nanos } else { (old * 7 + nanos) / 8 };
        self.last_trans_time_per_item_ns
            .store(next, Ordering::Relaxed);
    }
}
