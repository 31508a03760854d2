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

//! Warmup: rebuild memory state from the backend after a restart.
//!
//! Partitions are recreated with their persisted states, then the
//! backend replays its records and each lands in its hash table as a
//! clean, resident value carrying its rowid. Records that no longer fit
//! the memory budget are skipped; traffic is enabled once the replay
//! finishes.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{info, warn};

use emberkv_core::Result;

use crate::store::EmberStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct WarmupStats {
    pub estimated: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub(crate) fn run(store: &EmberStore) -> Result<WarmupStats> {
    let start = Instant::now();
    let states = store.ro_underlying().list_persisted_vbuckets();
    for (&vbid, &state) in &states {
        store.set_vbucket_state(vbid, state)?;
    }

    let mut stats = WarmupStats::default();
    let mut estimated = 0usize;
    store.ro_underlying().warmup(
        &states,
        &mut |gv| match gv.item {
            Some(item) => {
                let Some(vb) = store.vbuckets().get_bucket(item.vbucket) else {
                    stats.skipped += 1;
                    return;
                };
                let now = store.now();
                let mut guard = vb.ht.lock_bucket(item.key());
                if guard.find(item.key()).is_some() {
                    stats.skipped += 1;
                    return;
                }
                if !vb.ht.factory().has_space_for(&item) {
                    stats.skipped += 1;
                    return;
                }
                guard.insert(&item, false, now);
                stats.loaded += 1;
            }
            None => {
                warn!(status = ?gv.status, "warmup failed to load a record");
                stats.errors += 1;
            }
        },
        &mut |count| estimated = count,
    )?;
    stats.estimated = estimated;
    store
        .stats()
        .warmed_up
        .store(stats.loaded as u64, Ordering::Relaxed);
    info!(
        estimated = stats.estimated,
        loaded = stats.loaded,
        skipped = stats.skipped,
        errors = stats.errors,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "warmup replay finished"
    );
    Ok(stats)
}
