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

//! The background fetcher: one task on the read-only dispatcher serving
//! every partition's pending fetches.
//!
//! Each run it drains the per-partition fetch maps, issues one batched
//! backend read per partition, hands completed items to the store's
//! completion path, and puts failed-but-retryable items back on their
//! partition with a bumped retry count. Backend trouble is soft: only
//! when an item exhausts its retries does the client see the failure.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, DispatcherCallback, Priority, TaskHandle};
use crate::stats::EngineStats;
use crate::store::EmberStore;
use crate::vbucket::{FetchQueue, VBucket};

/// Floor for the idle sleep between fetch rounds, seconds.
pub const SLEEP_INTERVAL: f64 = 1.0;

pub struct BgFetcher {
    store: Weak<EmberStore>,
    dispatcher: Dispatcher,
    stats: Arc<EngineStats>,
    task: Mutex<Option<TaskHandle>>,
}

impl BgFetcher {
    pub(crate) fn new(
        store: Weak<EmberStore>,
        dispatcher: Dispatcher,
        stats: Arc<EngineStats>,
    ) -> Self {
        BgFetcher {
            store,
            dispatcher,
            stats,
            task: Mutex::new(None),
        }
    }

    pub(crate) fn start(self: Arc<Self>) {
        let callback = BgFetcherCallback {
            fetcher: self.clone(),
        };
        let task = self
            .dispatcher
            .schedule(Box::new(callback), Priority::BG_FETCHER, 0.0);
        *self.task.lock() = Some(task);
    }

    pub(crate) fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            self.dispatcher.cancel(&task);
        }
    }

    /// A fetch request just landed; pull the task out of its sleep.
    pub(crate) fn notify(&self) {
        if let Some(task) = &*self.task.lock() {
            self.dispatcher.wake(task);
        }
    }

    /// True when any partition still has queued fetch requests.
    pub fn pending_job(&self) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        store
            .vbuckets()
            .ids()
            .into_iter()
            .filter_map(|vbid| store.vbuckets().get_bucket(vbid))
            .any(|vb| vb.has_pending_bg_fetch_items())
    }

    fn run(&self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let mut total_fetched = 0usize;
        if self.stats.num_remaining_bg_jobs.load(Ordering::SeqCst) > 0 {
            for vbid in store.vbuckets().ids() {
                let Some(vb) = store.vbuckets().get_bucket(vbid) else {
                    continue;
                };
                let items = vb.get_bg_fetch_items();
                if !items.is_empty() {
                    total_fetched += self.do_fetch(&store, &vb, items);
                }
            }
            if total_fetched > 0 {
                self.stats
                    .num_remaining_bg_jobs
                    .fetch_sub(total_fetched, Ordering::SeqCst);
            }
        }
        if self.stats.num_remaining_bg_jobs.load(Ordering::SeqCst) == 0 {
            let sleep = store.bg_fetch_delay_secs().max(SLEEP_INTERVAL);
            dispatcher.snooze(task, sleep);
            // A request may have arrived between the check and the
            // snooze; if so, run again at once.
            if self.stats.num_remaining_bg_jobs.load(Ordering::SeqCst) > 0 {
                dispatcher.snooze(task, 0.0);
            }
        }
        true
    }

    /// Fetch one partition's batch. Returns the number of completed
    /// items; retryable failures go back on the partition.
    fn do_fetch(&self, store: &EmberStore, vb: &Arc<VBucket>, mut items: FetchQueue) -> usize {
        let start = Instant::now();
        debug!(
            vbucket = vb.id(),
            rows = items.len(),
            "background fetch batch"
        );
        store.ro_underlying().get_multi(vb.id(), &mut items);

        let mut completed = Vec::new();
        let mut requeued = 0usize;
        for (rowid, waiters) in items {
            for mut item in waiters {
                if !item.value.is_success() && item.can_retry() {
                    item.incr_retry_count();
                    warn!(
                        vbucket = vb.id(),
                        rowid,
                        retry = item.retry_count,
                        "backend failed to fetch; requeueing"
                    );
                    vb.queue_bg_fetch(rowid, item, false);
                    requeued += 1;
                } else {
                    completed.push(item);
                }
            }
        }
        if requeued > 0 {
            self.stats.bg_requeued.fetch_add(requeued as u64, Ordering::Relaxed);
        }
        let total = completed.len();
        if total > 0 {
            self.stats
                .get_multi_histo
                .add(start.elapsed().as_micros() as u64);
            store.complete_bg_fetch_multi(vb.id(), completed, start);
        }
        total
    }
}

struct BgFetcherCallback {
    fetcher: Arc<BgFetcher>,
}

impl DispatcherCallback for BgFetcherCallback {
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        self.fetcher.run(dispatcher, task)
    }

    fn description(&self) -> String {
        "Batching background fetch".to_string()
    }
}
