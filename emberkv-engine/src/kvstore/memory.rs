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

//! In-memory backend plug.
//!
//! A real [`KVStore`]: it assigns rowids, buffers mutations per
//! transaction, serves batched fetches, and survives engine "restart"
//! (dropping the memory tiers and warming back up from it). Failure
//! injection hooks let tests drive the flusher's reject path and the
//! fetcher's retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use emberkv_core::{Blob, EmberError, EngineStatus, Item, Result, NO_ROWID};

use crate::kvstore::{GetValue, KVStore, MutationResult, StorageProperties};
use crate::vbucket::{FetchQueue, VBucketState};

#[derive(Clone, Debug)]
struct Row {
    key: Vec<u8>,
    value: Blob,
    flags: u32,
    exptime: u32,
    cas: u64,
}

#[derive(Default, Debug)]
struct VbTable {
    rows: HashMap<i64, Row>,
    by_key: HashMap<Vec<u8>, i64>,
}

#[derive(Debug)]
enum TxnOp {
    Set { vbucket: u16, rowid: i64, row: Row },
    Del { vbucket: u16, rowid: i64, key: Vec<u8> },
    Reset,
}

#[derive(Debug)]
pub struct MemoryKVStore {
    data: Mutex<HashMap<u16, VbTable>>,
    states: Mutex<HashMap<u16, VBucketState>>,
    stats_snapshot: Mutex<HashMap<String, String>>,
    txn: Mutex<Option<Vec<TxnOp>>>,
    next_rowid: AtomicI64,
    commits: AtomicU64,
    get_multi_calls: AtomicU64,
    fail_commits: AtomicUsize,
    fail_fetches: AtomicUsize,
}

impl MemoryKVStore {
    pub fn new() -> Self {
        MemoryKVStore {
            data: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            stats_snapshot: Mutex::new(HashMap::new()),
            txn: Mutex::new(None),
            next_rowid: AtomicI64::new(1),
            commits: AtomicU64::new(0),
            get_multi_calls: AtomicU64::new(0),
            fail_commits: AtomicUsize::new(0),
            fail_fetches: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` commits with a backend error.
    pub fn inject_commit_failures(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Resolve every slot of the next `n` `get_multi` batches with
    /// `TempFail` instead of data.
    pub fn inject_fetch_failures(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn get_multi_calls(&self) -> u64 {
        self.get_multi_calls.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.data.lock().values().map(|t| t.rows.len()).sum()
    }

    fn apply(&self, op: TxnOp) {
        let mut data = self.data.lock();
        match op {
            TxnOp::Set { vbucket, rowid, row } => {
                let table = data.entry(vbucket).or_default();
                if let Some(old) = table.by_key.insert(row.key.clone(), rowid) {
                    if old != rowid {
                        table.rows.remove(&old);
                    }
                }
                table.rows.insert(rowid, row);
            }
            TxnOp::Del { vbucket, rowid, key } => {
                if let Some(table) = data.get_mut(&vbucket) {
                    let rowid = if rowid > 0 {
                        Some(rowid)
                    } else {
                        table.by_key.get(&key).copied()
                    };
                    if let Some(rowid) = rowid {
                        if let Some(row) = table.rows.remove(&rowid) {
                            table.by_key.remove(&row.key);
                        }
                    }
                }
            }
            TxnOp::Reset => {
                data.clear();
            }
        }
    }

    fn enqueue_or_apply(&self, op: TxnOp) {
        let mut txn = self.txn.lock();
        match txn.as_mut() {
            Some(ops) => ops.push(op),
            None => {
                drop(txn);
                self.apply(op);
            }
        }
    }

    fn row_to_value(&self, vbucket: u16, rowid: i64, row: &Row) -> GetValue {
        let mut item = Item::with_cas(&row.key, row.value.clone(), row.flags, row.exptime, row.cas, vbucket);
        item.rowid = rowid;
        GetValue::success(item)
    }
}

impl Default for MemoryKVStore {
    fn default() -> Self {
        MemoryKVStore::new()
    }
}

impl KVStore for MemoryKVStore {
    fn reset(&self) -> Result<()> {
        self.enqueue_or_apply(TxnOp::Reset);
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        if txn.is_none() {
            *txn = Some(Vec::new());
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let ops = self.txn.lock().take();
        let Some(ops) = ops else {
            return Ok(());
        };
        if self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EmberError::Backend("injected commit failure".to_string()));
        }
        for op in ops {
            self.apply(op);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) {
        self.txn.lock().take();
    }

    fn storage_properties(&self) -> StorageProperties {
        StorageProperties {
            has_efficient_get: true,
            has_efficient_vb_deletion: true,
            has_efficient_vb_dump: true,
        }
    }

    fn set(&self, item: &Item) -> Result<MutationResult> {
        let (rowid, inserted) = if item.has_rowid() {
            (item.rowid, false)
        } else {
            (self.next_rowid.fetch_add(1, Ordering::SeqCst), true)
        };
        self.enqueue_or_apply(TxnOp::Set {
            vbucket: item.vbucket,
            rowid,
            row: Row {
                key: item.key().to_vec(),
                value: item.value().clone(),
                flags: item.flags,
                exptime: item.exptime,
                cas: item.cas,
            },
        });
        Ok(MutationResult { inserted, rowid })
    }

    fn get(&self, key: &[u8], rowid: i64, vbucket: u16) -> GetValue {
        let data = self.data.lock();
        let Some(table) = data.get(&vbucket) else {
            return GetValue::missing(EngineStatus::KeyNotFound);
        };
        let rowid = if rowid > 0 {
            Some(rowid)
        } else {
            table.by_key.get(key).copied()
        };
        match rowid.and_then(|id| table.rows.get(&id).map(|row| (id, row))) {
            Some((id, row)) => self.row_to_value(vbucket, id, row),
            None => GetValue::missing(EngineStatus::KeyNotFound),
        }
    }

    fn get_multi(&self, vbucket: u16, fetches: &mut FetchQueue) {
        self.get_multi_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            for waiters in fetches.values_mut() {
                for waiter in waiters.iter_mut() {
                    waiter.value = GetValue::missing(EngineStatus::TempFail);
                }
            }
            return;
        }
        for (&rowid, waiters) in fetches.iter_mut() {
            if rowid > 0 {
                // One resolution serves every coalesced waiter; the
                // value blob is shared, not copied.
                let resolved = {
                    let data = self.data.lock();
                    data.get(&vbucket)
                        .and_then(|table| table.rows.get(&rowid).cloned())
                        .map(|row| self.row_to_value(vbucket, rowid, &row))
                        .unwrap_or_else(|| GetValue::missing(EngineStatus::KeyNotFound))
                };
                for waiter in waiters.iter_mut() {
                    waiter.value = resolved.clone();
                }
            } else {
                for waiter in waiters.iter_mut() {
                    waiter.value = self.get(&waiter.key, NO_ROWID, vbucket);
                }
            }
        }
    }

    fn del(&self, item: &Item, rowid: i64) -> Result<()> {
        self.enqueue_or_apply(TxnOp::Del {
            vbucket: item.vbucket,
            rowid,
            key: item.key().to_vec(),
        });
        Ok(())
    }

    fn del_vbucket(&self, vbucket: u16, recreate: bool) -> Result<()> {
        self.data.lock().remove(&vbucket);
        if !recreate {
            self.states.lock().remove(&vbucket);
        }
        Ok(())
    }

    fn list_persisted_vbuckets(&self) -> HashMap<u16, VBucketState> {
        self.states.lock().clone()
    }

    fn snapshot_vbuckets(&self, map: &HashMap<u16, VBucketState>) -> bool {
        *self.states.lock() = map.clone();
        true
    }

    fn snapshot_stats(&self, map: &HashMap<String, String>) -> bool {
        *self.stats_snapshot.lock() = map.clone();
        true
    }

    fn dump(&self, cb: &mut dyn FnMut(GetValue)) {
        let snapshot: Vec<GetValue> = {
            let data = self.data.lock();
            data.iter()
                .flat_map(|(&vbucket, table)| {
                    table
                        .rows
                        .iter()
                        .map(move |(&rowid, row)| (vbucket, rowid, row.clone()))
                })
                .map(|(vbucket, rowid, row)| self.row_to_value(vbucket, rowid, &row))
                .collect()
        };
        for gv in snapshot {
            cb(gv);
        }
    }

    fn dump_vbucket(&self, vbucket: u16, cb: &mut dyn FnMut(GetValue)) {
        let snapshot: Vec<GetValue> = {
            let data = self.data.lock();
            data.get(&vbucket)
                .map(|table| {
                    table
                        .rows
                        .iter()
                        .map(|(&rowid, row)| self.row_to_value(vbucket, rowid, row))
                        .collect()
                })
                .unwrap_or_default()
        };
        for gv in snapshot {
            cb(gv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbucket::{BgFetchItem, BgFetchType};

    fn stored_item(store: &MemoryKVStore, key: &[u8], value: &[u8]) -> i64 {
        let mut item = Item::new(key, value, 0, 0, 0);
        item.mint_cas();
        let result = store.set(&item).unwrap();
        result.rowid
    }

    #[test]
    fn test_set_assigns_rowids_once() {
        let store = MemoryKVStore::new();
        let rowid = stored_item(&store, b"a", b"1");
        assert!(rowid > 0);
        // Re-persisting the same row keeps its identity.
        let mut item = Item::new(b"a", b"2".as_slice(), 0, 0, 0);
        item.rowid = rowid;
        let result = store.set(&item).unwrap();
        assert_eq!(result.rowid, rowid);
        assert!(!result.inserted);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_get_by_rowid_and_key() {
        let store = MemoryKVStore::new();
        let rowid = stored_item(&store, b"a", b"payload");
        let by_rowid = store.get(b"a", rowid, 0);
        assert!(by_rowid.is_success());
        assert_eq!(by_rowid.item.unwrap().value().as_bytes(), b"payload");
        let by_key = store.get(b"a", NO_ROWID, 0);
        assert!(by_key.is_success());
        let miss = store.get(b"ghost", NO_ROWID, 0);
        assert_eq!(miss.status, EngineStatus::KeyNotFound);
    }

    #[test]
    fn test_transaction_buffers_until_commit() {
        let store = MemoryKVStore::new();
        store.begin().unwrap();
        stored_item(&store, b"a", b"1");
        assert_eq!(store.row_count(), 0);
        store.commit().unwrap();
        assert_eq!(store.row_count(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_failed_commit_drops_buffer() {
        let store = MemoryKVStore::new();
        store.inject_commit_failures(1);
        store.begin().unwrap();
        stored_item(&store, b"a", b"1");
        assert!(store.commit().is_err());
        assert_eq!(store.row_count(), 0);
        // Retry of the same logical write succeeds.
        store.begin().unwrap();
        stored_item(&store, b"a", b"1");
        store.commit().unwrap();
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_get_multi_resolves_coalesced_waiters() {
        let store = MemoryKVStore::new();
        let rowid = stored_item(&store, b"a", b"shared");
        let mut fetches = FetchQueue::new();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        fetches.entry(rowid).or_default().push(BgFetchItem::new(
            b"a".to_vec(),
            BgFetchType::Value,
            tx.clone(),
        ));
        fetches
            .entry(rowid)
            .or_default()
            .push(BgFetchItem::new(b"a".to_vec(), BgFetchType::Value, tx));
        store.get_multi(0, &mut fetches);
        assert_eq!(store.get_multi_calls(), 1);
        let waiters = &fetches[&rowid];
        assert!(waiters.iter().all(|w| w.value.is_success()));
        let first = waiters[0].value.item.as_ref().unwrap().value().clone();
        let second = waiters[1].value.item.as_ref().unwrap().value().clone();
        assert!(Blob::ptr_eq(&first, &second));
    }

    #[test]
    fn test_injected_fetch_failure_marks_tempfail() {
        let store = MemoryKVStore::new();
        let rowid = stored_item(&store, b"a", b"1");
        store.inject_fetch_failures(1);
        let mut fetches = FetchQueue::new();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        fetches
            .entry(rowid)
            .or_default()
            .push(BgFetchItem::new(b"a".to_vec(), BgFetchType::Value, tx));
        store.get_multi(0, &mut fetches);
        assert_eq!(fetches[&rowid][0].value.status, EngineStatus::TempFail);
        // Next batch goes through.
        store.get_multi(0, &mut fetches);
        assert!(fetches[&rowid][0].value.is_success());
    }

    #[test]
    fn test_del_and_dump() {
        let store = MemoryKVStore::new();
        stored_item(&store, b"a", b"1");
        let rowid_b = stored_item(&store, b"b", b"2");
        let item = Item::new(b"b", b"".as_slice(), 0, 0, 0);
        store.del(&item, rowid_b).unwrap();
        let mut seen = Vec::new();
        store.dump(&mut |gv| seen.push(gv.item.unwrap().key().to_vec()));
        assert_eq!(seen, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_vbucket_state_snapshot_round_trip() {
        let store = MemoryKVStore::new();
        let mut map = HashMap::new();
        map.insert(0, VBucketState::Active);
        map.insert(1, VBucketState::Replica);
        assert!(store.snapshot_vbuckets(&map));
        assert_eq!(store.list_persisted_vbuckets(), map);
    }

    #[test]
    fn test_warmup_replays_known_partitions() {
        let store = MemoryKVStore::new();
        stored_item(&store, b"a", b"1");
        let mut other = Item::new(b"b", b"2".as_slice(), 0, 0, 9);
        other.mint_cas();
        store.set(&other).unwrap();

        let mut vbmap = HashMap::new();
        vbmap.insert(0u16, VBucketState::Active);
        let mut estimated = 0;
        let mut keys = Vec::new();
        let loaded = store
            .warmup(
                &vbmap,
                &mut |gv| keys.push(gv.item.unwrap().key().to_vec()),
                &mut |n| estimated = n,
            )
            .unwrap();
        assert_eq!(estimated, 1);
        assert_eq!(loaded, 1);
        assert_eq!(keys, vec![b"a".to_vec()]);
    }
}
