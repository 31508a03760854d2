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

//! Memory-pressure eviction and TTL reaping.
//!
//! The item pager watches the quota against the configured watermarks
//! and, when usage crosses the high mark, schedules an eviction sweep
//! that runs partition by partition. Sweeps alternate between two
//! phases: first eject only values whose reference bit is clear
//! (clearing the bit on survivors), then, if pressure persists, eject by
//! biased coin flip, with replicas drawn on a heavier coin. Dirty, locked
//! and non-resident records are never touched; an ejected record keeps
//! its metadata shell so a later read can fetch the value back.
//!
//! The expiry pager is an independent periodic sweep that collects
//! expired records and replays them through the store as deletes, so
//! TTL reaping feeds the same persistence queue as client deletes.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use emberkv_core::time::RelTime;

use crate::dispatcher::{Dispatcher, DispatcherCallback, Priority, TaskHandle};
use crate::stats::EngineStats;
use crate::store::{EmberStore, VBucketVisitor};
use crate::stored_value::{MemoryQuota, StoredValue};
use crate::vbucket::{VBucket, VBucketState};

/// Seconds between item-pager pressure checks.
pub(crate) const ITEM_PAGER_SLEEP: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PagingPhase {
    /// Eject only records not referenced since the last sweep.
    Unreferenced,
    /// Eject by biased coin flip.
    Random,
}

/// One eviction sweep across the partitions.
pub(crate) struct PagingVisitor {
    store: Weak<EmberStore>,
    quota: Arc<MemoryQuota>,
    stats: Arc<EngineStats>,
    phase: PagingPhase,
    low_watermark: usize,
    bias: f64,
    now: RelTime,
    current_vb: u16,
    current_state: VBucketState,
    ejected: usize,
    expired: Vec<(u16, Vec<u8>)>,
    active_total: usize,
    active_resident: usize,
    replica_total: usize,
    replica_resident: usize,
    finalizer: Arc<AtomicBool>,
}

impl PagingVisitor {
    pub(crate) fn new(
        store: Weak<EmberStore>,
        quota: Arc<MemoryQuota>,
        stats: Arc<EngineStats>,
        phase: PagingPhase,
        low_watermark: usize,
        finalizer: Arc<AtomicBool>,
    ) -> Self {
        PagingVisitor {
            store,
            quota,
            stats,
            phase,
            low_watermark,
            bias: 0.0,
            now: 0,
            current_vb: 0,
            current_state: VBucketState::Active,
            ejected: 0,
            expired: Vec::new(),
            active_total: 0,
            active_resident: 0,
            replica_total: 0,
            replica_resident: 0,
            finalizer,
        }
    }
}

impl VBucketVisitor for PagingVisitor {
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool {
        let state = vb.state();
        self.current_vb = vb.id();
        self.current_state = state;
        if let Some(store) = self.store.upgrade() {
            self.now = store.now();
            let biased = store.pager_biased();
            // Replicas are pushed out ahead of active data.
            self.bias = match (state, biased) {
                (VBucketState::Replica, true) => 0.60,
                (VBucketState::Replica, false) => 0.50,
                (_, true) => 0.35,
                (_, false) => 0.50,
            };
        }
        matches!(state, VBucketState::Active | VBucketState::Replica)
    }

    fn visit(&mut self, v: &mut StoredValue) {
        match self.current_state {
            VBucketState::Active => {
                self.active_total += 1;
                if v.is_resident() {
                    self.active_resident += 1;
                }
            }
            VBucketState::Replica => {
                self.replica_total += 1;
                if v.is_resident() {
                    self.replica_resident += 1;
                }
            }
            _ => {}
        }
        if v.is_expired(self.now) {
            self.expired.push((self.current_vb, v.key().to_vec()));
            return;
        }
        if self.quota.current() <= self.low_watermark {
            return;
        }
        let eject = match self.phase {
            PagingPhase::Unreferenced => !v.take_referenced(),
            PagingPhase::Random => rand::random::<f64>() < self.bias,
        };
        if eject && v.eject(self.now, &self.quota) {
            self.ejected += 1;
            self.stats.num_values_ejected.fetch_add(1, Ordering::Relaxed);
            self.stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn complete(&mut self) {
        if let Some(store) = self.store.upgrade() {
            let expired = mem::take(&mut self.expired);
            if !expired.is_empty() {
                store.delete_expired_items(expired, true);
            }
            let active_pct = if self.active_total > 0 {
                self.active_resident * 100 / self.active_total
            } else {
                100
            };
            let replica_pct = if self.replica_total > 0 {
                self.replica_resident * 100 / self.replica_total
            } else {
                100
            };
            store.update_cached_resident_ratio(active_pct, replica_pct);
        }
        debug!(
            ejected = self.ejected,
            phase = ?self.phase,
            remaining_bytes = self.quota.current(),
            "eviction sweep complete"
        );
        self.finalizer.store(true, Ordering::SeqCst);
    }
}

/// Periodic pressure check that launches [`PagingVisitor`] sweeps.
pub(crate) struct ItemPager {
    store: Weak<EmberStore>,
    phase: PagingPhase,
    available: Arc<AtomicBool>,
}

impl ItemPager {
    pub(crate) fn new(store: Weak<EmberStore>) -> Self {
        ItemPager {
            store,
            phase: PagingPhase::Unreferenced,
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl DispatcherCallback for ItemPager {
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let current = store.quota().current();
        let high_watermark = store.config().high_watermark();
        if current > high_watermark && self.available.swap(false, Ordering::SeqCst) {
            info!(
                current,
                high_watermark,
                phase = ?self.phase,
                "memory pressure; scheduling eviction sweep"
            );
            let visitor = PagingVisitor::new(
                self.store.clone(),
                store.quota().clone(),
                store.stats().clone(),
                self.phase,
                store.config().low_watermark(),
                self.available.clone(),
            );
            store.visit_async(
                Box::new(visitor),
                "Item pager",
                store.non_io_dispatcher(),
                Priority::ITEM_PAGER,
                0.0,
            );
            self.phase = match self.phase {
                PagingPhase::Unreferenced => PagingPhase::Random,
                PagingPhase::Random => PagingPhase::Unreferenced,
            };
        }
        dispatcher.snooze(task, ITEM_PAGER_SLEEP);
        true
    }

    fn description(&self) -> String {
        "Paging out items.".to_string()
    }
}

/// Collects expired records across all partitions.
struct ExpirySweepVisitor {
    store: Weak<EmberStore>,
    now: RelTime,
    current_vb: u16,
    expired: Vec<(u16, Vec<u8>)>,
}

impl VBucketVisitor for ExpirySweepVisitor {
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool {
        self.current_vb = vb.id();
        if let Some(store) = self.store.upgrade() {
            self.now = store.now();
        }
        vb.state() != VBucketState::Dead
    }

    fn visit(&mut self, v: &mut StoredValue) {
        if v.is_expired(self.now) {
            self.expired.push((self.current_vb, v.key().to_vec()));
        }
    }

    fn complete(&mut self) {
        if let Some(store) = self.store.upgrade() {
            let expired = mem::take(&mut self.expired);
            if !expired.is_empty() {
                debug!(reaped = expired.len(), "expiry sweep complete");
                store.delete_expired_items(expired, true);
            }
        }
    }
}

/// Periodic TTL sweep; its cadence is retuned at runtime through
/// [`EmberStore::set_expiry_pager_sleeptime`].
pub(crate) struct ExpiredItemPager {
    store: Weak<EmberStore>,
}

impl ExpiredItemPager {
    pub(crate) fn new(store: Weak<EmberStore>) -> Self {
        ExpiredItemPager { store }
    }
}

impl DispatcherCallback for ExpiredItemPager {
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let sleeptime = store.expiry_pager_sleeptime();
        if sleeptime == 0 {
            return false;
        }
        let visitor = ExpirySweepVisitor {
            store: self.store.clone(),
            now: 0,
            current_vb: 0,
            expired: Vec::new(),
        };
        store.visit_async(
            Box::new(visitor),
            "Expired item remover",
            store.non_io_dispatcher(),
            Priority::EXPIRY_PAGER,
            0.0,
        );
        dispatcher.snooze(task, sleeptime as f64);
        true
    }

    fn description(&self) -> String {
        "Paging expired items.".to_string()
    }
}
