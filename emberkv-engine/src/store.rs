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

//! The store façade: everything between the front end and the backend.
//!
//! Requests are routed to a partition, answered from its hash table when
//! possible, and otherwise turned into asynchronous work: misses on
//! non-resident values enqueue background fetches and return
//! `WouldBlock` with a [`FetchHandle`], mutations are acknowledged once
//! the table is updated and persist later through the flusher.
//!
//! Lock order, outermost first: partition-set mutex, then a partition's
//! state lock, then a bucket stripe, then that partition's queues.
//! Never the other way around.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use emberkv_core::time::RelTime;
use emberkv_core::{
    AddStatus, Clock, EngineStatus, Item, ItemMetadata, MutationStatus, Result, NO_ROWID,
};

use crate::bg_fetcher::BgFetcher;
use crate::config::{EngineConfig, MAX_BG_FETCH_DELAY};
use crate::dispatcher::{Dispatcher, DispatcherCallback, Priority, TaskHandle};
use crate::flusher::Flusher;
use crate::hash_table::{HashTable, HashTableVisitor};
use crate::kvstore::{KVStore, KVStoreFactory, StorageProperties};
use crate::pager::{ExpiredItemPager, ItemPager, ITEM_PAGER_SLEEP};
use crate::stats::EngineStats;
use crate::stored_value::{MemoryQuota, StoredValue, StoredValueFactory};
use crate::vbucket::{BgFetchItem, BgFetchType, QueueOp, QueuedItem, VBucket, VBucketState};
use crate::vbucket_map::VBucketMap;
use crate::warmup;

/// Completion side of a would-block operation. The engine resolves it
/// once the background fetch lands; the client then re-drives its
/// request.
pub struct FetchHandle {
    receiver: Receiver<EngineStatus>,
}

impl FetchHandle {
    pub fn wait(&self) -> EngineStatus {
        self.receiver.recv().unwrap_or(EngineStatus::Disconnect)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineStatus> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// Outcome of a read.
pub struct GetResult {
    pub status: EngineStatus,
    pub item: Option<Item>,
    pub handle: Option<FetchHandle>,
}

impl GetResult {
    fn ready(item: Item) -> Self {
        GetResult {
            status: EngineStatus::Success,
            item: Some(item),
            handle: None,
        }
    }

    fn pending(handle: Option<FetchHandle>) -> Self {
        GetResult {
            status: EngineStatus::WouldBlock,
            item: None,
            handle,
        }
    }

    fn miss(status: EngineStatus) -> Self {
        GetResult {
            status,
            item: None,
            handle: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Outcome of a metadata read.
pub struct MetaResult {
    pub status: EngineStatus,
    pub metadata: Option<ItemMetadata>,
    pub handle: Option<FetchHandle>,
}

/// Per-key introspection, for the stats surface.
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub dirty: bool,
    pub resident: bool,
    pub cas: u64,
    pub flags: u32,
    pub exptime: RelTime,
    pub data_age: RelTime,
    pub vb_state: VBucketState,
}

/// Walks partitions, and optionally each partition's hash table.
pub trait VBucketVisitor: Send {
    /// Begin a partition; return true to walk its table.
    fn visit_bucket(&mut self, vb: &Arc<VBucket>) -> bool;

    /// One record, under its bucket lock.
    fn visit(&mut self, value: &mut StoredValue);

    fn should_continue(&self) -> bool {
        true
    }

    /// Called once after the last partition.
    fn complete(&mut self) {}
}

struct HtVisitAdapter<'a>(&'a mut dyn VBucketVisitor);

impl HashTableVisitor for HtVisitAdapter<'_> {
    fn visit(&mut self, value: &mut StoredValue) {
        self.0.visit(value);
    }

    fn should_continue(&self) -> bool {
        self.0.should_continue()
    }
}

/// Runs a [`VBucketVisitor`] as a background task, one partition per
/// callback invocation so long sweeps yield to their peers.
pub(crate) struct VBCBAdaptor {
    store: Weak<EmberStore>,
    visitor: Box<dyn VBucketVisitor>,
    vb_list: VecDeque<u16>,
    label: &'static str,
    sleep_time: f64,
    current_vb: u16,
}

impl VBCBAdaptor {
    pub(crate) fn new(
        store: Weak<EmberStore>,
        visitor: Box<dyn VBucketVisitor>,
        vb_list: VecDeque<u16>,
        label: &'static str,
        sleep_time: f64,
    ) -> Self {
        VBCBAdaptor {
            store,
            visitor,
            vb_list,
            label,
            sleep_time,
            current_vb: 0,
        }
    }
}

impl DispatcherCallback for VBCBAdaptor {
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        if let Some(vbid) = self.vb_list.pop_front() {
            self.current_vb = vbid;
            if let Some(vb) = store.vbuckets.get_bucket(vbid) {
                if self.visitor.visit_bucket(&vb) {
                    vb.ht.visit(&mut HtVisitAdapter(self.visitor.as_mut()));
                }
            }
        }
        if self.vb_list.is_empty() {
            self.visitor.complete();
            return false;
        }
        dispatcher.snooze(task, self.sleep_time);
        true
    }

    fn description(&self) -> String {
        format!("{} on vb {}", self.label, self.current_vb)
    }
}

/// One-shot backend read for engines without the batched fetch path.
struct SingleFetchCallback {
    store: Weak<EmberStore>,
    vbucket: u16,
    rowid: i64,
    item: Option<BgFetchItem>,
}

impl DispatcherCallback for SingleFetchCallback {
    fn run(&mut self, _dispatcher: &Dispatcher, _task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let Some(mut item) = self.item.take() else {
            return false;
        };
        let start = Instant::now();
        item.value = store.ro_underlying.get(&item.key, self.rowid, self.vbucket);
        store.complete_bg_fetch_multi(self.vbucket, vec![item], start);
        false
    }

    fn description(&self) -> String {
        "Fetching item from disk".to_string()
    }
}

/// Persists the partition-state snapshot; deduplicated through the map's
/// priority flags.
struct VBSnapshotCallback {
    store: Weak<EmberStore>,
    high_priority: bool,
}

impl DispatcherCallback for VBSnapshotCallback {
    fn run(&mut self, _dispatcher: &Dispatcher, _task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        // Release the scheduling slot before writing, so a state change
        // racing with the write schedules a fresh snapshot.
        if self.high_priority {
            store.vbuckets.set_high_priority_vb_snapshot_flag(false);
        } else {
            store.vbuckets.set_low_priority_vb_snapshot_flag(false);
        }
        let states = store.vbuckets.states();
        if !store.rw_underlying.snapshot_vbuckets(&states) {
            warn!("vbucket state snapshot failed");
        }
        for (&vbid, _) in &states {
            store.vbuckets.set_bucket_creation(vbid, false);
        }
        false
    }

    fn description(&self) -> String {
        "Snapshotting vbucket states".to_string()
    }
}

/// Two-phase partition drop: the in-memory table is erased in bounded
/// chunks, then the backend row range goes.
struct VBDeletionCallback {
    store: Weak<EmberStore>,
    vb: Arc<VBucket>,
    recreate: bool,
    next_bucket: usize,
    chunk_size: usize,
    threshold: Duration,
}

impl DispatcherCallback for VBDeletionCallback {
    fn run(&mut self, dispatcher: &Dispatcher, task: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let start = Instant::now();
        while self.next_bucket < self.vb.ht.num_buckets() {
            self.vb.ht.clear_buckets(self.next_bucket, self.chunk_size);
            self.next_bucket += self.chunk_size;
            if start.elapsed() > self.threshold {
                dispatcher.snooze(task, 0.0);
                return true;
            }
        }
        store.complete_vbucket_deletion(&self.vb, self.recreate);
        false
    }

    fn description(&self) -> String {
        format!("Removing vbucket {} from memory and disk", self.vb.id())
    }
}

struct ExpiryPagerState {
    sleeptime: u64,
    task: Option<TaskHandle>,
}

/// What one flusher visit to a partition produced.
#[derive(Default)]
pub(crate) struct FlushResult {
    /// Items committed (or consumed as no-ops).
    pub flushed: usize,
    /// Items to retry after a failed transaction.
    pub rejects: Vec<QueuedItem>,
}

enum PlannedOp {
    Set { item: Item, cas: u64 },
    Del { key: Vec<u8>, rowid: i64 },
    DeleteAll,
}

/// The eventually-persistent store.
pub struct EmberStore {
    self_weak: Weak<EmberStore>,
    config: EngineConfig,
    clock: Arc<Clock>,
    stats: Arc<EngineStats>,
    quota: Arc<MemoryQuota>,
    vbuckets: VBucketMap,
    rw_underlying: Arc<dyn KVStore>,
    ro_underlying: Arc<dyn KVStore>,
    storage_properties: StorageProperties,
    dispatcher: Dispatcher,
    ro_dispatcher: Dispatcher,
    aux_io_dispatcher: Dispatcher,
    non_io_dispatcher: Dispatcher,
    flusher: Arc<Flusher>,
    bg_fetcher: Arc<BgFetcher>,
    vbset_mutex: Mutex<()>,
    bg_fetch_delay: AtomicU32,
    access_scanner_sleeptime: AtomicU64,
    pager_biased: AtomicBool,
    expiry_pager: Mutex<ExpiryPagerState>,
    item_pager_task: Mutex<Option<TaskHandle>>,
    shut_down: AtomicBool,
}

impl EmberStore {
    /// Build and start a store with the configured backend.
    pub fn new(config: EngineConfig) -> Result<Arc<EmberStore>> {
        let backend = KVStoreFactory::create(&config.backend)?;
        EmberStore::with_backend(config, backend)
    }

    /// Build and start a store around an explicit backend instance.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn KVStore>) -> Result<Arc<EmberStore>> {
        let quota = Arc::new(MemoryQuota::new(config.max_size));
        let stats = Arc::new(EngineStats::new());
        let dispatcher = Dispatcher::new("rw_io");
        let ro_dispatcher = if config.concurrent_db {
            Dispatcher::new("ro_io")
        } else {
            dispatcher.clone()
        };
        let storage_properties = backend.storage_properties();
        let expiry_sleeptime = config.expiry_pager_sleeptime;
        let access_scanner_sleeptime = config.access_scanner_sleeptime;
        let bg_fetch_delay = config.bg_fetch_delay.min(MAX_BG_FETCH_DELAY);
        let max_vbuckets = config.max_vbuckets;

        let store = Arc::new_cyclic(|weak: &Weak<EmberStore>| EmberStore {
            self_weak: weak.clone(),
            clock: Arc::new(Clock::new()),
            stats: stats.clone(),
            quota,
            vbuckets: VBucketMap::new(max_vbuckets),
            rw_underlying: backend.clone(),
            ro_underlying: backend,
            storage_properties,
            flusher: Arc::new(Flusher::new(weak.clone(), dispatcher.clone())),
            bg_fetcher: Arc::new(BgFetcher::new(
                weak.clone(),
                ro_dispatcher.clone(),
                stats.clone(),
            )),
            dispatcher,
            ro_dispatcher,
            aux_io_dispatcher: Dispatcher::new("aux_io"),
            non_io_dispatcher: Dispatcher::new("non_io"),
            vbset_mutex: Mutex::new(()),
            bg_fetch_delay: AtomicU32::new(bg_fetch_delay),
            access_scanner_sleeptime: AtomicU64::new(access_scanner_sleeptime),
            pager_biased: AtomicBool::new(true),
            expiry_pager: Mutex::new(ExpiryPagerState {
                sleeptime: expiry_sleeptime,
                task: None,
            }),
            item_pager_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            config,
        });
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        if self.config.warmup {
            let stats = warmup::run(self)?;
            info!(
                loaded = stats.loaded,
                skipped = stats.skipped,
                errors = stats.errors,
                "warmup complete"
            );
        }
        self.flusher.clone().start();
        self.flusher.enable_traffic();
        if self.multi_bg_fetch_enabled() {
            self.bg_fetcher.clone().start();
        }

        let item_pager = ItemPager::new(self.self_weak.clone());
        let task =
            self.non_io_dispatcher
                .schedule(Box::new(item_pager), Priority::ITEM_PAGER, ITEM_PAGER_SLEEP);
        *self.item_pager_task.lock() = Some(task);

        let sleeptime = self.expiry_pager.lock().sleeptime;
        if sleeptime > 0 {
            self.schedule_expiry_pager(sleeptime);
        }
        Ok(())
    }

    fn schedule_expiry_pager(&self, sleeptime: u64) {
        let pager = ExpiredItemPager::new(self.self_weak.clone());
        let task = self.non_io_dispatcher.schedule(
            Box::new(pager),
            Priority::EXPIRY_PAGER,
            sleeptime as f64,
        );
        self.expiry_pager.lock().task = Some(task);
    }

    /// Stop background work and join the dispatcher threads. The flusher
    /// drains what it can first.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down store");
        {
            let mut pager = self.expiry_pager.lock();
            if let Some(task) = pager.task.take() {
                self.non_io_dispatcher.cancel(&task);
            }
        }
        if let Some(task) = self.item_pager_task.lock().take() {
            self.non_io_dispatcher.cancel(&task);
        }
        self.bg_fetcher.stop();
        self.flusher.stop();
        self.flusher
            .wait_for_state(crate::flusher::FlusherState::Stopped, Duration::from_secs(10));
        self.snapshot_engine_stats();
        self.non_io_dispatcher.shutdown();
        self.aux_io_dispatcher.shutdown();
        if self.has_separate_ro_dispatcher() {
            self.ro_dispatcher.shutdown();
        }
        self.dispatcher.shutdown();
    }

    /// Persist a snapshot of the engine counters so the next warmup can
    /// report the previous generation's numbers.
    fn snapshot_engine_stats(&self) {
        let mut snapshot = HashMap::new();
        let pairs: [(&str, u64); 8] = [
            ("ep_warmup_count", self.stats.warmed_up.load(Ordering::Relaxed)),
            ("ep_bg_fetched", self.stats.bg_fetched.load(Ordering::Relaxed)),
            ("ep_bg_requeued", self.stats.bg_requeued.load(Ordering::Relaxed)),
            ("ep_expired_pager", self.stats.expired_pager.load(Ordering::Relaxed)),
            ("ep_expired_access", self.stats.expired_access.load(Ordering::Relaxed)),
            ("ep_commits", self.stats.flusher_commits.load(Ordering::Relaxed)),
            ("ep_tmp_oom_errors", self.stats.tmp_oom_errors.load(Ordering::Relaxed)),
            (
                "ep_num_values_ejected",
                self.stats.num_values_ejected.load(Ordering::Relaxed),
            ),
        ];
        for (key, value) in pairs {
            snapshot.insert(key.to_string(), value.to_string());
        }
        if !self.rw_underlying.snapshot_stats(&snapshot) {
            warn!("stats snapshot failed");
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn quota(&self) -> &Arc<MemoryQuota> {
        &self.quota
    }

    pub fn vbuckets(&self) -> &VBucketMap {
        &self.vbuckets
    }

    pub fn flusher(&self) -> &Arc<Flusher> {
        &self.flusher
    }

    pub fn bg_fetcher(&self) -> &Arc<BgFetcher> {
        &self.bg_fetcher
    }

    pub fn storage_properties(&self) -> StorageProperties {
        self.storage_properties
    }

    pub(crate) fn rw_underlying(&self) -> &Arc<dyn KVStore> {
        &self.rw_underlying
    }

    pub(crate) fn ro_underlying(&self) -> &Arc<dyn KVStore> {
        &self.ro_underlying
    }

    pub(crate) fn non_io_dispatcher(&self) -> &Dispatcher {
        &self.non_io_dispatcher
    }

    pub fn has_separate_ro_dispatcher(&self) -> bool {
        !Dispatcher::ptr_eq(&self.dispatcher, &self.ro_dispatcher)
    }

    /// Misses take the batched fetch path only when reads have their own
    /// dispatcher and the backend serves batched point reads cheaply.
    pub fn multi_bg_fetch_enabled(&self) -> bool {
        self.has_separate_ro_dispatcher() && self.storage_properties.has_efficient_get
    }

    pub fn set_bg_fetch_delay(&self, seconds: u32) {
        self.bg_fetch_delay
            .store(seconds.min(MAX_BG_FETCH_DELAY), Ordering::Relaxed);
    }

    pub fn bg_fetch_delay_secs(&self) -> f64 {
        f64::from(self.bg_fetch_delay.load(Ordering::Relaxed))
    }

    pub fn expiry_pager_sleeptime(&self) -> u64 {
        self.expiry_pager.lock().sleeptime
    }

    /// Retune the expiry pager at runtime; applied through a snooze, and
    /// zero parks it entirely.
    pub fn set_expiry_pager_sleeptime(&self, seconds: u64) {
        enum Action {
            Nothing,
            Snooze(TaskHandle),
            Cancel(TaskHandle),
            Schedule,
        }
        let action = {
            let mut pager = self.expiry_pager.lock();
            pager.sleeptime = seconds;
            if seconds == 0 {
                match pager.task.take() {
                    Some(task) => Action::Cancel(task),
                    None => Action::Nothing,
                }
            } else {
                match &pager.task {
                    Some(task) => Action::Snooze(task.clone()),
                    None => Action::Schedule,
                }
            }
        };
        match action {
            Action::Snooze(task) => self.non_io_dispatcher.snooze(&task, seconds as f64),
            Action::Cancel(task) => self.non_io_dispatcher.cancel(&task),
            Action::Schedule => self.schedule_expiry_pager(seconds),
            Action::Nothing => {}
        }
    }

    pub fn access_scanner_sleeptime(&self) -> u64 {
        self.access_scanner_sleeptime.load(Ordering::Relaxed)
    }

    pub fn set_access_scanner_sleeptime(&self, seconds: u64) {
        self.access_scanner_sleeptime
            .store(seconds, Ordering::Relaxed);
        // A rescheduled scanner means fresh reference bits; let the pager
        // trust them again.
        self.pager_biased.store(false, Ordering::Relaxed);
    }

    pub(crate) fn pager_biased(&self) -> bool {
        self.pager_biased.load(Ordering::Relaxed)
    }

    pub(crate) fn update_cached_resident_ratio(&self, active_pct: usize, replica_pct: usize) {
        self.stats
            .active_resident_ratio
            .store(active_pct, Ordering::Relaxed);
        self.stats
            .replica_resident_ratio
            .store(replica_pct, Ordering::Relaxed);
    }

    pub(crate) fn now(&self) -> RelTime {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn vbucket_for_write(
        &self,
        vbid: u16,
        force: bool,
    ) -> std::result::Result<Arc<VBucket>, EngineStatus> {
        let Some(vb) = self.vbuckets.get_bucket(vbid) else {
            return Err(EngineStatus::NotMyVbucket);
        };
        let state = vb.state();
        if state == VBucketState::Active || force {
            if state == VBucketState::Dead {
                return Err(EngineStatus::NotMyVbucket);
            }
            Ok(vb)
        } else if state == VBucketState::Pending {
            Err(EngineStatus::WouldBlock)
        } else {
            Err(EngineStatus::NotMyVbucket)
        }
    }

    fn vbucket_for_read(
        &self,
        vbid: u16,
        allowed: VBucketState,
        honor_states: bool,
    ) -> std::result::Result<Arc<VBucket>, EngineStatus> {
        let Some(vb) = self.vbuckets.get_bucket(vbid) else {
            return Err(EngineStatus::NotMyVbucket);
        };
        if !honor_states {
            return Ok(vb);
        }
        let state = vb.state();
        if state == VBucketState::Dead {
            Err(EngineStatus::NotMyVbucket)
        } else if state == allowed {
            Ok(vb)
        } else if state == VBucketState::Pending {
            Err(EngineStatus::WouldBlock)
        } else {
            Err(EngineStatus::NotMyVbucket)
        }
    }

    /// Enqueue a persistence entry. Safe under a bucket stripe: the dirty
    /// queue is a leaf lock.
    fn queue_dirty(&self, vb: &VBucket, key: &[u8], op: QueueOp) -> u64 {
        let seqno = vb.queue_dirty(key, op);
        self.stats.disk_queue_size.fetch_add(1, Ordering::Relaxed);
        self.flusher.notify();
        seqno
    }

    fn wake_item_pager(&self) {
        if let Some(task) = &*self.item_pager_task.lock() {
            self.non_io_dispatcher.wake(task);
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Store an item. On success `item.cas` carries the freshly minted
    /// version.
    pub fn set(&self, item: &mut Item, force: bool) -> EngineStatus {
        let vb = match self.vbucket_for_write(item.vbucket, force) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        let had_cas = item.cas != 0;
        let now = self.now();
        match vb.ht.set(item, now) {
            MutationStatus::NoMem => {
                self.stats.tmp_oom_errors.fetch_add(1, Ordering::Relaxed);
                self.wake_item_pager();
                EngineStatus::TempFail
            }
            MutationStatus::InvalidCas => EngineStatus::KeyExists,
            MutationStatus::IsLocked => EngineStatus::Locked,
            MutationStatus::NotFound => {
                if had_cas {
                    EngineStatus::KeyNotFound
                } else {
                    self.queue_dirty(&vb, item.key(), QueueOp::Set);
                    EngineStatus::Success
                }
            }
            MutationStatus::WasClean | MutationStatus::WasDirty => {
                self.queue_dirty(&vb, item.key(), QueueOp::Set);
                EngineStatus::Success
            }
        }
    }

    /// Store only if absent.
    pub fn add(&self, item: &mut Item) -> EngineStatus {
        let vb = match self.vbucket_for_write(item.vbucket, false) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        let now = self.now();
        match vb.ht.add(item, true, now) {
            AddStatus::Success => {
                self.queue_dirty(&vb, item.key(), QueueOp::Set);
                EngineStatus::Success
            }
            AddStatus::Exists => EngineStatus::KeyExists,
            AddStatus::NoMem => {
                self.stats.tmp_oom_errors.fetch_add(1, Ordering::Relaxed);
                self.wake_item_pager();
                EngineStatus::TempFail
            }
        }
    }

    /// Backfill write from a replication stream; partition state checks
    /// are bypassed (the stream owns the partition).
    pub fn add_backfill_item(&self, item: &mut Item) -> EngineStatus {
        self.set(item, true)
    }

    /// Store with externally supplied metadata: the item's own CAS is
    /// kept rather than minted, and `expected_cas` guards the swap.
    pub fn set_with_meta(
        &self,
        item: &mut Item,
        expected_cas: u64,
        force: bool,
        allow_replace: bool,
    ) -> EngineStatus {
        let vb = match self.vbucket_for_write(item.vbucket, force) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        let now = self.now();
        let quota = self.quota.clone();
        let mut guard = vb.ht.lock_bucket(item.key());
        let _ = guard.take_expired(item.key(), now);
        if guard.find(item.key()).is_some() {
            if !allow_replace {
                return EngineStatus::KeyExists;
            }
            let v = guard.find(item.key()).expect("present under bucket lock");
            if v.is_locked(now) {
                if expected_cas != v.cas() {
                    return EngineStatus::Locked;
                }
                v.unlock();
            } else if expected_cas != 0 && expected_cas != v.cas() {
                return EngineStatus::KeyExists;
            }
            v.set_value(
                item.value().clone(),
                item.flags,
                item.exptime,
                item.cas,
                now,
                &quota,
            );
        } else {
            if expected_cas != 0 {
                return EngineStatus::KeyNotFound;
            }
            if !vb.ht.factory().has_space_for(item) {
                self.stats.tmp_oom_errors.fetch_add(1, Ordering::Relaxed);
                self.wake_item_pager();
                return EngineStatus::TempFail;
            }
            guard.insert(item, true, now);
        }
        self.queue_dirty(&vb, item.key(), QueueOp::Set);
        EngineStatus::Success
    }

    /// CAS-checked delete. With `meta`, the tombstone carries the
    /// supplied version instead of the stored one. `backfill` bypasses
    /// partition state checks like [`add_backfill_item`](Self::add_backfill_item).
    pub fn delete_item(
        &self,
        key: &[u8],
        cas: u64,
        vbucket: u16,
        force: bool,
        meta: Option<&ItemMetadata>,
        backfill: bool,
    ) -> EngineStatus {
        let vb = match self.vbucket_for_write(vbucket, force || backfill) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        let now = self.now();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return EngineStatus::KeyNotFound;
        }
        {
            let Some(v) = guard.find(key) else {
                return EngineStatus::KeyNotFound;
            };
            if v.is_locked(now) {
                if cas != v.cas() {
                    return EngineStatus::Locked;
                }
                v.unlock();
            } else if cas != 0 && cas != v.cas() {
                return EngineStatus::KeyExists;
            }
            if let Some(meta) = meta {
                v.set_cas(meta.cas);
            }
        }
        if guard.remove(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            EngineStatus::Success
        } else {
            EngineStatus::KeyNotFound
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read from an active partition. A non-resident hit enqueues a
    /// background fetch and returns `WouldBlock` with the handle to wait
    /// on.
    pub fn get(&self, key: &[u8], vbucket: u16) -> GetResult {
        self.get_internal(key, vbucket, true, true, VBucketState::Active, true)
    }

    /// Read without queueing a background fetch on a non-resident hit.
    pub fn get_no_fetch(&self, key: &[u8], vbucket: u16) -> GetResult {
        self.get_internal(key, vbucket, false, true, VBucketState::Active, true)
    }

    /// Read from a replica partition.
    pub fn get_replica(&self, key: &[u8], vbucket: u16) -> GetResult {
        self.get_internal(key, vbucket, true, true, VBucketState::Replica, true)
    }

    fn get_internal(
        &self,
        key: &[u8],
        vbucket: u16,
        queue_bg: bool,
        honor_states: bool,
        allowed: VBucketState,
        track_reference: bool,
    ) -> GetResult {
        let vb = match self.vbucket_for_read(vbucket, allowed, honor_states) {
            Ok(vb) => vb,
            Err(EngineStatus::WouldBlock) => return GetResult::pending(None),
            Err(status) => return GetResult::miss(status),
        };
        let now = self.now();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return GetResult::miss(EngineStatus::KeyNotFound);
        }
        let (resident, rowid, item) = {
            let Some(v) = guard.find(key) else {
                return GetResult::miss(EngineStatus::KeyNotFound);
            };
            if v.is_resident() && track_reference {
                v.set_referenced();
            }
            (v.is_resident(), v.id(), value_to_item(key, v, vbucket))
        };
        if !resident {
            drop(guard);
            if queue_bg {
                let handle = self.bg_fetch(key, vbucket, rowid, BgFetchType::Value);
                return GetResult::pending(Some(handle));
            }
            return GetResult::pending(None);
        }
        match item {
            Some(item) => GetResult::ready(item),
            None => GetResult::miss(EngineStatus::KeyNotFound),
        }
    }

    /// Metadata-only read. Served from the shell when the key is known;
    /// otherwise, when the backend supports cheap point reads, a
    /// metadata-only background fetch is queued.
    pub fn get_metadata(&self, key: &[u8], vbucket: u16) -> MetaResult {
        let vb = match self.vbucket_for_read(vbucket, VBucketState::Active, true) {
            Ok(vb) => vb,
            Err(status) => {
                return MetaResult {
                    status,
                    metadata: None,
                    handle: None,
                }
            }
        };
        let now = self.now();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return MetaResult {
                status: EngineStatus::KeyNotFound,
                metadata: None,
                handle: None,
            };
        }
        if let Some(v) = guard.find(key) {
            return MetaResult {
                status: EngineStatus::Success,
                metadata: Some(v.metadata()),
                handle: None,
            };
        }
        drop(guard);
        if self.storage_properties.has_efficient_get {
            let handle = self.bg_fetch(key, vbucket, NO_ROWID, BgFetchType::Metadata);
            MetaResult {
                status: EngineStatus::WouldBlock,
                metadata: None,
                handle: Some(handle),
            }
        } else {
            MetaResult {
                status: EngineStatus::KeyNotFound,
                metadata: None,
                handle: None,
            }
        }
    }

    /// Read and refresh the TTL in one step; the new expiry is queued
    /// for persistence.
    pub fn get_and_update_ttl(&self, key: &[u8], vbucket: u16, exptime: RelTime) -> GetResult {
        let vb = match self.vbucket_for_read(vbucket, VBucketState::Active, true) {
            Ok(vb) => vb,
            Err(EngineStatus::WouldBlock) => return GetResult::pending(None),
            Err(status) => return GetResult::miss(status),
        };
        let now = self.now();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return GetResult::miss(EngineStatus::KeyNotFound);
        }
        let (resident, rowid, item) = {
            let Some(v) = guard.find(key) else {
                return GetResult::miss(EngineStatus::KeyNotFound);
            };
            if !v.is_resident() {
                (false, v.id(), None)
            } else {
                v.set_exptime(exptime);
                v.mark_dirty(now);
                v.set_referenced();
                (true, v.id(), value_to_item(key, v, vbucket))
            }
        };
        if !resident {
            drop(guard);
            let handle = self.bg_fetch(key, vbucket, rowid, BgFetchType::Value);
            return GetResult::pending(Some(handle));
        }
        self.queue_dirty(&vb, key, QueueOp::Set);
        match item {
            Some(item) => GetResult::ready(item),
            None => GetResult::miss(EngineStatus::KeyNotFound),
        }
    }

    /// Read and lock. Further mutations need the returned CAS until the
    /// lock times out.
    pub fn get_locked(&self, key: &[u8], vbucket: u16, lock_timeout: u32) -> GetResult {
        const DEFAULT_LOCK_TIMEOUT: u32 = 15;
        const MAX_LOCK_TIMEOUT: u32 = 30;
        let timeout = if lock_timeout == 0 || lock_timeout > MAX_LOCK_TIMEOUT {
            DEFAULT_LOCK_TIMEOUT
        } else {
            lock_timeout
        };
        let vb = match self.vbucket_for_read(vbucket, VBucketState::Active, true) {
            Ok(vb) => vb,
            Err(EngineStatus::WouldBlock) => return GetResult::pending(None),
            Err(status) => return GetResult::miss(status),
        };
        let now = self.now();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return GetResult::miss(EngineStatus::KeyNotFound);
        }
        let (outcome, rowid) = {
            let Some(v) = guard.find(key) else {
                return GetResult::miss(EngineStatus::KeyNotFound);
            };
            if v.is_locked(now) {
                return GetResult::miss(EngineStatus::Locked);
            }
            if !v.is_resident() {
                (None, v.id())
            } else {
                v.lock(now + timeout);
                v.set_referenced();
                (value_to_item(key, v, vbucket), v.id())
            }
        };
        match outcome {
            Some(item) => GetResult::ready(item),
            None => {
                drop(guard);
                let handle = self.bg_fetch(key, vbucket, rowid, BgFetchType::Value);
                GetResult::pending(Some(handle))
            }
        }
    }

    /// CAS-matched unlock.
    pub fn unlock_key(&self, key: &[u8], vbucket: u16, cas: u64) -> EngineStatus {
        let vb = match self.vbucket_for_read(vbucket, VBucketState::Active, true) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        let now = self.now();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return EngineStatus::KeyNotFound;
        }
        let Some(v) = guard.find(key) else {
            return EngineStatus::KeyNotFound;
        };
        if !v.is_locked(now) {
            return EngineStatus::TempFail;
        }
        if v.cas() == cas {
            v.unlock();
            EngineStatus::Success
        } else {
            EngineStatus::InvalidCas
        }
    }

    /// Manually push a value out of memory, keeping its shell.
    pub fn evict_key(&self, key: &[u8], vbucket: u16) -> (EngineStatus, &'static str) {
        let vb = match self.vbucket_for_read(vbucket, VBucketState::Active, true) {
            Ok(vb) => vb,
            Err(status) => return (status, "Not my vbucket."),
        };
        let now = self.now();
        let quota = self.quota.clone();
        let mut guard = vb.ht.lock_bucket(key);
        if guard.take_expired(key, now) {
            self.queue_dirty(&vb, key, QueueOp::Del);
            vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            return (EngineStatus::KeyNotFound, "Not found.");
        }
        let Some(v) = guard.find(key) else {
            return (EngineStatus::KeyNotFound, "Not found.");
        };
        if !v.is_resident() {
            return (EngineStatus::KeyExists, "Already ejected.");
        }
        if v.eject(now, &quota) {
            self.stats.num_values_ejected.fetch_add(1, Ordering::Relaxed);
            self.stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
            (EngineStatus::Success, "Ejected.")
        } else {
            (EngineStatus::KeyExists, "Can't eject: dirty or unpersisted object.")
        }
    }

    /// Per-key stats surface.
    pub fn get_key_stats(&self, key: &[u8], vbucket: u16) -> (EngineStatus, Option<KeyStats>) {
        let vb = match self.vbucket_for_read(vbucket, VBucketState::Active, true) {
            Ok(vb) => vb,
            Err(status) => return (status, None),
        };
        let now = self.now();
        let state = vb.state();
        let stats = vb.ht.find(key, now, |v| KeyStats {
            dirty: v.is_dirty(),
            resident: v.is_resident(),
            cas: v.cas(),
            flags: v.flags(),
            exptime: v.exptime(),
            data_age: v.data_age(),
            vb_state: state,
        });
        match stats {
            Some(stats) => (EngineStatus::Success, Some(stats)),
            None => (EngineStatus::KeyNotFound, None),
        }
    }

    // ------------------------------------------------------------------
    // Background fetch pipeline
    // ------------------------------------------------------------------

    /// Enqueue a background fetch and hand back the completion handle.
    pub(crate) fn bg_fetch(
        &self,
        key: &[u8],
        vbucket: u16,
        rowid: i64,
        fetch_type: BgFetchType,
    ) -> FetchHandle {
        let (tx, rx) = bounded(1);
        let item = BgFetchItem::new(key.to_vec(), fetch_type, tx);
        if self.multi_bg_fetch_enabled() {
            // The batched fetcher owns the remaining-jobs counter; the
            // one-shot path below completes inline on its own task.
            match self.vbuckets.get_bucket(vbucket) {
                Some(vb) => {
                    self.stats
                        .num_remaining_bg_jobs
                        .fetch_add(1, Ordering::SeqCst);
                    vb.queue_bg_fetch(rowid, item, false);
                    self.bg_fetcher.notify();
                }
                None => {
                    item.notify(EngineStatus::NotMyVbucket);
                }
            }
        } else {
            let callback = SingleFetchCallback {
                store: self.self_weak.clone(),
                vbucket,
                rowid,
                item: Some(item),
            };
            self.ro_dispatcher.schedule(
                Box::new(callback),
                Priority::BG_FETCHER,
                self.bg_fetch_delay_secs(),
            );
        }
        FetchHandle { receiver: rx }
    }

    /// Land a batch of completed fetches: restore values (or install
    /// metadata shells), then release every waiter.
    pub(crate) fn complete_bg_fetch_multi(
        &self,
        vbucket: u16,
        fetched: Vec<BgFetchItem>,
        start: Instant,
    ) {
        let vb = self.vbuckets.get_bucket(vbucket);
        let now = self.now();
        let stop = Instant::now();
        for item in fetched {
            let status = item.value.status;
            let delivered = match (&vb, status) {
                (Some(vb), EngineStatus::Success) => {
                    self.land_fetched_value(vb, &item, now);
                    EngineStatus::Success
                }
                (None, _) => EngineStatus::NotMyVbucket,
                (_, EngineStatus::KeyNotFound) => EngineStatus::KeyNotFound,
                (_, _) => {
                    self.stats.bg_failed.fetch_add(1, Ordering::Relaxed);
                    EngineStatus::TempFail
                }
            };
            item.notify(delivered);
            self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bg_wait_histo
                .add(start.saturating_duration_since(item.enqueued).as_micros() as u64);
            self.stats
                .bg_load_histo
                .add(stop.saturating_duration_since(start).as_micros() as u64);
        }
    }

    fn land_fetched_value(&self, vb: &Arc<VBucket>, item: &BgFetchItem, now: RelTime) {
        let Some(fetched) = &item.value.item else {
            return;
        };
        let mut guard = vb.ht.lock_bucket(&item.key);
        match item.fetch_type {
            BgFetchType::Value => {
                let restored = {
                    match guard.find(&item.key) {
                        Some(v) => {
                            if !v.is_resident() && v.is_clean() {
                                v.restore(fetched.value().clone(), &self.quota);
                                true
                            } else {
                                // A newer mutation beat the fetch; its
                                // copy wins.
                                false
                            }
                        }
                        None => {
                            // The shell is gone; re-admit the disk copy
                            // when the budget allows.
                            if vb.ht.factory().has_space_for(fetched) {
                                guard.insert(fetched, false, now);
                            }
                            return;
                        }
                    }
                };
                if restored {
                    self.stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
                }
            }
            BgFetchType::Metadata => {
                if guard.find(&item.key).is_none() && vb.ht.factory().has_space_for(fetched) {
                    guard.insert(fetched, false, now);
                    if let Some(v) = guard.find(&item.key) {
                        if v.eject(now, &self.quota) {
                            self.stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Partition lifecycle
    // ------------------------------------------------------------------

    fn make_hash_table(&self) -> HashTable {
        HashTable::new(
            self.config.ht_size,
            self.config.ht_locks,
            StoredValueFactory::new(self.config.stored_val_type, self.quota.clone()),
        )
    }

    /// Create a partition in `state`, or transition an existing one.
    pub fn set_vbucket_state(&self, vbid: u16, state: VBucketState) -> Result<()> {
        {
            let _vbset = self.vbset_mutex.lock();
            match self.vbuckets.get_bucket(vbid) {
                Some(vb) => vb.set_state(state),
                None => {
                    let vb = Arc::new(VBucket::new(vbid, state, self.make_hash_table()));
                    self.vbuckets.add_bucket(vb)?;
                    self.vbuckets.set_bucket_creation(vbid, true);
                }
            }
        }
        self.schedule_vb_snapshot(false);
        Ok(())
    }

    /// Mark a partition dead and schedule its two-phase erase.
    pub fn delete_vbucket(&self, vbid: u16) -> EngineStatus {
        let _vbset = self.vbset_mutex.lock();
        let Some(vb) = self.vbuckets.get_bucket(vbid) else {
            return EngineStatus::NotMyVbucket;
        };
        vb.set_state(VBucketState::Dead);
        let pending = vb.dirty_queue_len();
        vb.clear_dirty_queue();
        if pending > 0 {
            self.stats.disk_queue_size.fetch_sub(pending, Ordering::Relaxed);
        }
        // Waiters on this partition will never be served; release them
        // and give their jobs back to the counter.
        let orphaned = vb.get_bg_fetch_items();
        let waiters: usize = orphaned.values().map(|w| w.len()).sum();
        if waiters > 0 {
            for (_, items) in orphaned {
                for item in items {
                    item.notify(EngineStatus::NotMyVbucket);
                }
            }
            self.stats
                .num_remaining_bg_jobs
                .fetch_sub(waiters, Ordering::SeqCst);
        }
        if self.vbuckets.set_bucket_deletion(vbid, true) {
            let callback = VBDeletionCallback {
                store: self.self_weak.clone(),
                vb,
                recreate: false,
                next_bucket: 0,
                chunk_size: self.config.vb_del_chunk_size.max(1),
                threshold: Duration::from_millis(self.config.vb_chunk_del_threshold_time),
            };
            self.dispatcher
                .schedule(Box::new(callback), Priority::VB_DELETION, 0.0);
        }
        EngineStatus::Success
    }

    pub(crate) fn complete_vbucket_deletion(&self, vb: &Arc<VBucket>, recreate: bool) {
        if let Err(error) = self.rw_underlying.del_vbucket(vb.id(), recreate) {
            warn!(vbucket = vb.id(), %error, "backend vbucket erase failed");
        }
        self.vbuckets.remove_bucket(vb.id());
        self.vbuckets.reset_persistence_checkpoint_id(vb.id());
        self.vbuckets.set_bucket_deletion(vb.id(), false);
        info!(vbucket = vb.id(), "vbucket deleted");
    }

    /// Deduplicated snapshot scheduling through the map's priority flags.
    pub fn schedule_vb_snapshot(&self, high_priority: bool) {
        let claimed = if high_priority {
            self.vbuckets.set_high_priority_vb_snapshot_flag(true)
        } else {
            self.vbuckets.set_low_priority_vb_snapshot_flag(true)
        };
        if claimed {
            let callback = VBSnapshotCallback {
                store: self.self_weak.clone(),
                high_priority,
            };
            let priority = if high_priority {
                Priority::VB_SNAPSHOT_HIGH
            } else {
                Priority::VB_SNAPSHOT_LOW
            };
            self.dispatcher.schedule(Box::new(callback), priority, 0.0);
        }
    }

    /// Flush-all: drop every record from memory and queue a whole-store
    /// erase for the persistence path.
    pub fn reset(&self) {
        let ids = self.vbuckets.ids();
        for &vbid in &ids {
            if let Some(vb) = self.vbuckets.get_bucket(vbid) {
                vb.ht.clear(false);
                vb.clear_dirty_queue();
            }
        }
        self.stats.disk_queue_size.store(0, Ordering::Relaxed);
        self.stats.num_non_resident.store(0, Ordering::Relaxed);
        self.stats.disk_flush_all.store(true, Ordering::Relaxed);
        match ids.first().and_then(|&id| self.vbuckets.get_bucket(id)) {
            Some(vb) => {
                self.queue_dirty(&vb, b"", QueueOp::Empty);
            }
            None => {
                // No partition to carry the marker; erase inline.
                if self.rw_underlying.reset().is_ok() {
                    self.stats.disk_flush_all.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn is_flush_all_scheduled(&self) -> bool {
        self.stats.disk_flush_all.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Persistence (called from the flusher)
    // ------------------------------------------------------------------

    /// Flush one partition: take a bounded batch off its dirty queue
    /// (rejects first), run one backend transaction, and on commit clear
    /// the dirty bits and advance the persisted checkpoint.
    pub(crate) fn flush_vbucket(&self, vbid: u16, mut items: Vec<QueuedItem>) -> FlushResult {
        let Some(vb) = self.vbuckets.get_bucket(vbid) else {
            self.stats
                .disk_queue_size
                .fetch_sub(items.len(), Ordering::Relaxed);
            return FlushResult::default();
        };
        if vb.state() == VBucketState::Dead {
            self.stats
                .disk_queue_size
                .fetch_sub(items.len(), Ordering::Relaxed);
            return FlushResult::default();
        }
        let room = self.config.transaction_size.saturating_sub(items.len());
        items.extend(vb.drain_dirty(room));
        if items.is_empty() {
            return FlushResult::default();
        }

        let now = self.now();
        let start = Instant::now();
        let mut planned = Vec::new();
        for qi in &items {
            match qi.op {
                QueueOp::Set => {
                    let mut guard = vb.ht.lock_bucket(&qi.key);
                    if let Some(v) = guard.find(&qi.key) {
                        if v.is_dirty() {
                            let exptime = v.exptime();
                            if exptime != 0 && exptime < now + self.config.item_expiry_window {
                                // Not worth persisting something about to
                                // expire; reap the row if it ever hit disk.
                                if v.has_id() {
                                    planned.push(PlannedOp::Del {
                                        key: qi.key.clone(),
                                        rowid: v.id(),
                                    });
                                }
                                v.mark_clean();
                            } else if let Some(blob) = v.value() {
                                let mut item = Item::with_cas(
                                    &qi.key,
                                    blob.clone(),
                                    v.flags(),
                                    exptime,
                                    v.cas(),
                                    vbid,
                                );
                                item.rowid = v.id();
                                planned.push(PlannedOp::Set {
                                    cas: v.cas(),
                                    item,
                                });
                            }
                        }
                    }
                }
                QueueOp::Del => planned.push(PlannedOp::Del {
                    key: qi.key.clone(),
                    rowid: NO_ROWID,
                }),
                QueueOp::Empty => planned.push(PlannedOp::DeleteAll),
            }
        }

        if planned.is_empty() {
            self.stats
                .disk_queue_size
                .fetch_sub(items.len(), Ordering::Relaxed);
            return FlushResult {
                flushed: items.len(),
                rejects: Vec::new(),
            };
        }

        let committed = self.run_flush_transaction(vbid, &mut planned);
        if !committed {
            self.rw_underlying.rollback();
            self.stats
                .flusher_commit_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(vbucket = vbid, items = items.len(), "flush transaction failed; rejecting batch");
            return FlushResult {
                flushed: 0,
                rejects: items,
            };
        }

        // Post-commit bookkeeping.
        for op in &planned {
            match op {
                PlannedOp::Set { item, cas } => {
                    let mut guard = vb.ht.lock_bucket(item.key());
                    if let Some(v) = guard.find(item.key()) {
                        if !v.has_id() && item.rowid > 0 {
                            v.set_id(item.rowid);
                        }
                        // Only the persisted mutation is clean; a newer
                        // one keeps its queue entry.
                        if v.cas() == *cas {
                            v.mark_clean();
                        }
                    }
                }
                PlannedOp::DeleteAll => {
                    self.stats.disk_flush_all.store(false, Ordering::Relaxed);
                }
                PlannedOp::Del { .. } => {}
            }
        }
        if let Some(max_seqno) = items.iter().map(|qi| qi.seqno).max() {
            self.vbuckets.set_persistence_checkpoint_id(vbid, max_seqno);
        }
        self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .disk_queue_size
            .fetch_sub(items.len(), Ordering::Relaxed);
        let per_item = start.elapsed().as_nanos() as u64 / planned.len().max(1) as u64;
        self.stats.update_trans_time_per_item(per_item);
        debug!(
            vbucket = vbid,
            items = items.len(),
            checkpoint = self.vbuckets.persistence_checkpoint_id(vbid),
            "flushed batch"
        );
        FlushResult {
            flushed: items.len(),
            rejects: Vec::new(),
        }
    }

    /// Run the backend transaction for a planned batch. Rowids assigned
    /// by the backend are written back into the planned items so the
    /// post-commit pass can install them.
    fn run_flush_transaction(&self, vbid: u16, planned: &mut [PlannedOp]) -> bool {
        if self.rw_underlying.begin().is_err() {
            return false;
        }
        for op in planned.iter_mut() {
            let ok = match op {
                PlannedOp::Set { item, .. } => match self.rw_underlying.set(item) {
                    Ok(result) => {
                        if !item.has_rowid() {
                            item.rowid = result.rowid;
                        }
                        true
                    }
                    Err(_) => false,
                },
                PlannedOp::Del { key, rowid } => {
                    let tombstone = Item::new(key, Vec::new(), 0, 0, vbid);
                    self.rw_underlying.del(&tombstone, *rowid).is_ok()
                }
                PlannedOp::DeleteAll => self.rw_underlying.reset().is_ok(),
            };
            if !ok {
                return false;
            }
        }
        self.rw_underlying.commit().is_ok()
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Reap a batch of expired keys collected by a sweep: remove the
    /// in-memory records and queue their deletes.
    pub(crate) fn delete_expired_items(&self, expired: Vec<(u16, Vec<u8>)>, by_pager: bool) {
        let now = self.now();
        for (vbid, key) in expired {
            let Some(vb) = self.vbuckets.get_bucket(vbid) else {
                continue;
            };
            let mut guard = vb.ht.lock_bucket(&key);
            let still_expired = guard
                .find(&key)
                .map(|v| v.is_expired(now))
                .unwrap_or(false);
            if still_expired && guard.remove(&key, now) {
                self.queue_dirty(&vb, &key, QueueOp::Del);
                vb.num_expired_items.fetch_add(1, Ordering::Relaxed);
                if by_pager {
                    self.stats.expired_pager.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Visitors
    // ------------------------------------------------------------------

    /// Walk every partition synchronously on the calling thread.
    pub fn visit(&self, visitor: &mut dyn VBucketVisitor) {
        for vbid in self.vbuckets.ids() {
            if !visitor.should_continue() {
                break;
            }
            if let Some(vb) = self.vbuckets.get_bucket(vbid) {
                if visitor.visit_bucket(&vb) {
                    vb.ht.visit(&mut HtVisitAdapter(&mut *visitor));
                }
            }
        }
        visitor.complete();
    }

    /// Walk partitions as a background task, one partition per step.
    pub fn visit_async(
        &self,
        visitor: Box<dyn VBucketVisitor>,
        label: &'static str,
        dispatcher: &Dispatcher,
        priority: Priority,
        sleep_time: f64,
    ) -> TaskHandle {
        let adaptor = VBCBAdaptor::new(
            self.self_weak.clone(),
            visitor,
            self.vbuckets.ids().into(),
            label,
            sleep_time,
        );
        dispatcher.schedule(Box::new(adaptor), priority, 0.0)
    }

    // ------------------------------------------------------------------
    // Flusher control
    // ------------------------------------------------------------------

    pub fn pause_flusher(&self) -> bool {
        self.flusher.pause()
    }

    pub fn resume_flusher(&self) -> bool {
        self.flusher.resume()
    }

    pub fn wake_up_flusher(&self) {
        self.flusher.notify();
    }
}

impl Drop for EmberStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn value_to_item(key: &[u8], v: &StoredValue, vbucket: u16) -> Option<Item> {
    let blob = v.value()?.clone();
    let mut item = Item::with_cas(key, blob, v.flags(), v.exptime(), v.cas(), vbucket);
    item.rowid = v.id();
    Some(item)
}
