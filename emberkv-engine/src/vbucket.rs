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

//! A single partition: its hash table, state, pending background
//! fetches, and the dirty queue feeding the persistence path.
//!
//! Only `Active` and `Replica` partitions serve traffic. Fetch requests
//! for the same backend row coalesce into one list so one disk read can
//! satisfy every waiter; sequence numbers for the dirty queue are minted
//! here and are monotonically non-decreasing per partition.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use emberkv_core::EngineStatus;

use crate::hash_table::HashTable;
use crate::kvstore::GetValue;

/// Attempts a failed background fetch gets before it is surfaced.
pub const MAX_BG_FETCH_RETRY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VBucketState {
    /// Serves reads and writes.
    Active,
    /// Accepts backfill writes and explicit replica reads.
    Replica,
    /// Owned but not yet ready; clients must retry.
    Pending,
    /// Tombstone awaiting deletion.
    Dead,
}

impl VBucketState {
    pub fn parse(name: &str) -> Option<VBucketState> {
        match name {
            "active" => Some(VBucketState::Active),
            "replica" => Some(VBucketState::Replica),
            "pending" => Some(VBucketState::Pending),
            "dead" => Some(VBucketState::Dead),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a dirty-queue entry asks the persistence path to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Set,
    Del,
    /// Whole-store flush marker.
    Empty,
}

/// One entry on a partition's persistence queue.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub key: Vec<u8>,
    pub vbucket: u16,
    pub op: QueueOp,
    pub seqno: u64,
}

/// Whether a background fetch wants the value or only its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgFetchType {
    Value,
    Metadata,
}

/// A waiter for one background fetch. The backend fills `value`; the
/// completion path resolves `notifier` so the front end can re-drive.
pub struct BgFetchItem {
    pub key: Vec<u8>,
    pub fetch_type: BgFetchType,
    pub value: GetValue,
    pub retry_count: u32,
    pub enqueued: Instant,
    notifier: Sender<EngineStatus>,
}

impl BgFetchItem {
    pub fn new(key: Vec<u8>, fetch_type: BgFetchType, notifier: Sender<EngineStatus>) -> Self {
        BgFetchItem {
            key,
            fetch_type,
            value: GetValue::pending(),
            retry_count: 0,
            enqueued: Instant::now(),
            notifier,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < MAX_BG_FETCH_RETRY
    }

    pub fn incr_retry_count(&mut self) {
        self.retry_count += 1;
    }

    /// Resolve the waiter. A gone receiver just means the client stopped
    /// caring.
    pub fn notify(&self, status: EngineStatus) {
        let _ = self.notifier.try_send(status);
    }
}

/// Pending fetches of one partition: backend rowid to its waiters.
/// Rowid [`NO_ROWID`](emberkv_core::NO_ROWID) collects key-only
/// metadata fetches; the backend resolves those per waiter key.
pub type FetchQueue = HashMap<i64, Vec<BgFetchItem>>;

pub struct VBucket {
    id: u16,
    state: RwLock<VBucketState>,
    pub ht: HashTable,
    pending_fetches: Mutex<FetchQueue>,
    dirty_queue: Mutex<VecDeque<QueuedItem>>,
    next_seqno: AtomicU64,
    pub num_expired_items: AtomicUsize,
}

impl VBucket {
    pub fn new(id: u16, state: VBucketState, ht: HashTable) -> Self {
        VBucket {
            id,
            state: RwLock::new(state),
            ht,
            pending_fetches: Mutex::new(FetchQueue::new()),
            dirty_queue: Mutex::new(VecDeque::new()),
            next_seqno: AtomicU64::new(0),
            num_expired_items: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    pub fn set_state(&self, to: VBucketState) {
        let mut state = self.state.write();
        info!(vbucket = self.id, from = %*state, to = %to, "vbucket state change");
        *state = to;
    }

    /// Highest sequence number handed out so far.
    pub fn checkpoint_id(&self) -> u64 {
        self.next_seqno.load(Ordering::Relaxed)
    }

    fn next_seqno(&self) -> u64 {
        self.next_seqno.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueue a waiter for `rowid`, coalescing with any already waiting
    /// on the same row. Returns the number of waiters now sharing the
    /// fetch.
    pub fn queue_bg_fetch(&self, rowid: i64, item: BgFetchItem, front: bool) -> usize {
        let mut fetches = self.pending_fetches.lock();
        let waiters = fetches.entry(rowid).or_default();
        if front {
            waiters.insert(0, item);
        } else {
            waiters.push(item);
        }
        waiters.len()
    }

    /// Atomically hand the whole pending-fetch map to the caller.
    pub fn get_bg_fetch_items(&self) -> FetchQueue {
        mem::take(&mut *self.pending_fetches.lock())
    }

    pub fn has_pending_bg_fetch_items(&self) -> bool {
        !self.pending_fetches.lock().is_empty()
    }

    /// Append to the persistence queue, minting the mutation's sequence
    /// number.
    pub fn queue_dirty(&self, key: &[u8], op: QueueOp) -> u64 {
        let seqno = self.next_seqno();
        self.dirty_queue.lock().push_back(QueuedItem {
            key: key.to_vec(),
            vbucket: self.id,
            op,
            seqno,
        });
        seqno
    }

    /// Take up to `max` entries off the front of the persistence queue.
    pub fn drain_dirty(&self, max: usize) -> Vec<QueuedItem> {
        let mut queue = self.dirty_queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn dirty_queue_len(&self) -> usize {
        self.dirty_queue.lock().len()
    }

    pub fn clear_dirty_queue(&self) {
        self.dirty_queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stored_value::{MemoryQuota, StoredValueFactory, StoredValueType};
    use std::sync::Arc;

    fn vbucket() -> VBucket {
        let quota = Arc::new(MemoryQuota::new(usize::MAX));
        let ht = HashTable::new(
            16,
            4,
            StoredValueFactory::new(StoredValueType::Featured, quota),
        );
        VBucket::new(0, VBucketState::Active, ht)
    }

    fn fetch_item(key: &[u8]) -> BgFetchItem {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        BgFetchItem::new(key.to_vec(), BgFetchType::Value, tx)
    }

    #[test]
    fn test_bg_fetches_coalesce_by_rowid() {
        let vb = vbucket();
        assert_eq!(vb.queue_bg_fetch(7, fetch_item(b"a"), false), 1);
        assert_eq!(vb.queue_bg_fetch(7, fetch_item(b"a"), false), 2);
        assert_eq!(vb.queue_bg_fetch(9, fetch_item(b"b"), false), 1);
        assert!(vb.has_pending_bg_fetch_items());

        let drained = vb.get_bg_fetch_items();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[&7].len(), 2);
        assert_eq!(drained[&9].len(), 1);
        assert!(!vb.has_pending_bg_fetch_items());
    }

    #[test]
    fn test_front_requeue_goes_first() {
        let vb = vbucket();
        vb.queue_bg_fetch(7, fetch_item(b"first"), false);
        vb.queue_bg_fetch(7, fetch_item(b"jumped"), true);
        let drained = vb.get_bg_fetch_items();
        assert_eq!(drained[&7][0].key, b"jumped");
    }

    #[test]
    fn test_dirty_queue_is_fifo_with_monotonic_seqnos() {
        let vb = vbucket();
        let s1 = vb.queue_dirty(b"a", QueueOp::Set);
        let s2 = vb.queue_dirty(b"b", QueueOp::Set);
        let s3 = vb.queue_dirty(b"a", QueueOp::Del);
        assert!(s1 < s2 && s2 < s3);
        assert_eq!(vb.checkpoint_id(), s3);

        let drained = vb.drain_dirty(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].key, b"a");
        assert_eq!(drained[0].op, QueueOp::Set);
        assert_eq!(drained[1].key, b"b");
        assert_eq!(vb.dirty_queue_len(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let vb = vbucket();
        assert_eq!(vb.state(), VBucketState::Active);
        vb.set_state(VBucketState::Dead);
        assert_eq!(vb.state(), VBucketState::Dead);
    }

    #[test]
    fn test_retry_cap() {
        let mut item = fetch_item(b"a");
        for _ in 0..MAX_BG_FETCH_RETRY {
            assert!(item.can_retry());
            item.incr_retry_count();
        }
        assert!(!item.can_retry());
    }
}
