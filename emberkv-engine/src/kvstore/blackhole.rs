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

//! The /dev/null backend: acknowledges everything, stores nothing.
//! Useful for benchmarking the memory tiers without a persistence cost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use emberkv_core::{EngineStatus, Item, Result};

use crate::kvstore::{GetValue, KVStore, MutationResult, StorageProperties};
use crate::vbucket::{FetchQueue, VBucketState};

#[derive(Debug)]
pub struct BlackholeKVStore {
    next_rowid: AtomicI64,
}

impl BlackholeKVStore {
    pub fn new() -> Self {
        BlackholeKVStore {
            next_rowid: AtomicI64::new(1),
        }
    }
}

impl Default for BlackholeKVStore {
    fn default() -> Self {
        BlackholeKVStore::new()
    }
}

impl KVStore for BlackholeKVStore {
    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) {}

    fn storage_properties(&self) -> StorageProperties {
        StorageProperties {
            has_efficient_get: false,
            has_efficient_vb_deletion: true,
            has_efficient_vb_dump: false,
        }
    }

    fn set(&self, item: &Item) -> Result<MutationResult> {
        let (rowid, inserted) = if item.has_rowid() {
            (item.rowid, false)
        } else {
            (self.next_rowid.fetch_add(1, Ordering::SeqCst), true)
        };
        Ok(MutationResult { inserted, rowid })
    }

    fn get(&self, _key: &[u8], _rowid: i64, _vbucket: u16) -> GetValue {
        GetValue::missing(EngineStatus::KeyNotFound)
    }

    fn get_multi(&self, _vbucket: u16, fetches: &mut FetchQueue) {
        for waiters in fetches.values_mut() {
            for waiter in waiters.iter_mut() {
                waiter.value = GetValue::missing(EngineStatus::KeyNotFound);
            }
        }
    }

    fn del(&self, _item: &Item, _rowid: i64) -> Result<()> {
        Ok(())
    }

    fn del_vbucket(&self, _vbucket: u16, _recreate: bool) -> Result<()> {
        Ok(())
    }

    fn list_persisted_vbuckets(&self) -> HashMap<u16, VBucketState> {
        HashMap::new()
    }

    fn snapshot_vbuckets(&self, _map: &HashMap<u16, VBucketState>) -> bool {
        true
    }

    fn snapshot_stats(&self, _map: &HashMap<String, String>) -> bool {
        true
    }

    fn dump(&self, _cb: &mut dyn FnMut(GetValue)) {}

    fn dump_vbucket(&self, _vbucket: u16, _cb: &mut dyn FnMut(GetValue)) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blackhole_acknowledges_and_forgets() {
        let store = BlackholeKVStore::new();
        let mut item = Item::new(b"a", b"1".as_slice(), 0, 0, 0);
        item.mint_cas();
        let result = store.set(&item).unwrap();
        assert!(result.rowid > 0);
        assert!(result.inserted);
        let gv = store.get(b"a", result.rowid, 0);
        assert_eq!(gv.status, EngineStatus::KeyNotFound);
        assert!(store.list_persisted_vbuckets().is_empty());
    }
}
