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

//! Fixed-capacity map of known partitions.
//!
//! Beside the partitions themselves the map carries the coordination
//! flags that keep background work deduplicated: per-slot creation and
//! deletion markers, the last checkpoint id each partition has persisted,
//! and the two snapshot-scheduled flags (one per priority) that stop a
//! second snapshot task from being scheduled while one is in flight.
//! All slot access is bounds-checked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use emberkv_core::{EmberError, Result};

use crate::vbucket::{VBucket, VBucketState};

pub struct VBucketMap {
    buckets: Vec<RwLock<Option<Arc<VBucket>>>>,
    bucket_deletion: Vec<AtomicBool>,
    bucket_creation: Vec<AtomicBool>,
    persistence_checkpoint_ids: Vec<AtomicU64>,
    high_priority_vb_snapshot: AtomicBool,
    low_priority_vb_snapshot: AtomicBool,
}

impl VBucketMap {
    pub fn new(capacity: usize) -> Self {
        VBucketMap {
            buckets: (0..capacity).map(|_| RwLock::new(None)).collect(),
            bucket_deletion: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            bucket_creation: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            persistence_checkpoint_ids: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            high_priority_vb_snapshot: AtomicBool::new(false),
            low_priority_vb_snapshot: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Look up a partition; `None` for empty slots and out-of-range ids.
    pub fn get_bucket(&self, id: u16) -> Option<Arc<VBucket>> {
        self.buckets.get(id as usize)?.read().clone()
    }

    pub fn add_bucket(&self, vb: Arc<VBucket>) -> Result<()> {
        let id = vb.id() as usize;
        match self.buckets.get(id) {
            Some(slot) => {
                *slot.write() = Some(vb);
                Ok(())
            }
            None => Err(EmberError::VbucketOutOfRange {
                vbid: vb.id(),
                capacity: self.capacity(),
            }),
        }
    }

    pub fn remove_bucket(&self, id: u16) {
        if let Some(slot) = self.buckets.get(id as usize) {
            *slot.write() = None;
        }
    }

    /// Ids of every occupied slot.
    pub fn ids(&self) -> Vec<u16> {
        (0..self.capacity() as u16)
            .filter(|&id| self.buckets[id as usize].read().is_some())
            .collect()
    }

    /// Occupied ids ordered active, replica, pending, dead; the order
    /// the flusher services partitions.
    pub fn ids_sorted_by_state(&self) -> Vec<u16> {
        let mut ids = self.ids();
        ids.sort_by_key(|&id| {
            match self.get_bucket(id).map(|vb| vb.state()) {
                Some(VBucketState::Active) => 0,
                Some(VBucketState::Replica) => 1,
                Some(VBucketState::Pending) => 2,
                Some(VBucketState::Dead) => 3,
                None => 4,
            }
        });
        ids
    }

    pub fn is_bucket_deletion(&self, id: u16) -> bool {
        self.bucket_deletion
            .get(id as usize)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Flip the deletion marker; true when the value actually changed,
    /// so only one deletion task gets scheduled per partition.
    pub fn set_bucket_deletion(&self, id: u16, value: bool) -> bool {
        match self.bucket_deletion.get(id as usize) {
            Some(flag) => flag
                .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    pub fn is_bucket_creation(&self, id: u16) -> bool {
        self.bucket_creation
            .get(id as usize)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_bucket_creation(&self, id: u16, value: bool) -> bool {
        match self.bucket_creation.get(id as usize) {
            Some(flag) => flag
                .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    pub fn persistence_checkpoint_id(&self, id: u16) -> u64 {
        self.persistence_checkpoint_ids
            .get(id as usize)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Record a persisted checkpoint. The stored value never moves
    /// backwards.
    pub fn set_persistence_checkpoint_id(&self, id: u16, checkpoint_id: u64) {
        if let Some(slot) = self.persistence_checkpoint_ids.get(id as usize) {
            slot.fetch_max(checkpoint_id, Ordering::AcqRel);
        }
    }

    /// Reset the persisted checkpoint, for partition deletion.
    pub fn reset_persistence_checkpoint_id(&self, id: u16) {
        if let Some(slot) = self.persistence_checkpoint_ids.get(id as usize) {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn is_high_priority_vb_snapshot_scheduled(&self) -> bool {
        self.high_priority_vb_snapshot.load(Ordering::Acquire)
    }

    /// Coordinate high-priority snapshot scheduling: passing `true`
    /// claims the slot (true return means the caller may schedule);
    /// the running task passes `false` to release it.
    pub fn set_high_priority_vb_snapshot_flag(&self, value: bool) -> bool {
        self.high_priority_vb_snapshot
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_low_priority_vb_snapshot_scheduled(&self) -> bool {
        self.low_priority_vb_snapshot.load(Ordering::Acquire)
    }

    /// Low-priority twin of
    /// [`set_high_priority_vb_snapshot_flag`](Self::set_high_priority_vb_snapshot_flag).
    pub fn set_low_priority_vb_snapshot_flag(&self, value: bool) -> bool {
        self.low_priority_vb_snapshot
            .compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current state of every occupied slot, as the snapshot tasks
    /// persist it.
    pub fn states(&self) -> std::collections::HashMap<u16, VBucketState> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.get_bucket(id).map(|vb| (id, vb.state())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_table::HashTable;
    use crate::stored_value::{MemoryQuota, StoredValueFactory, StoredValueType};

    fn make_vb(id: u16, state: VBucketState) -> Arc<VBucket> {
        let quota = Arc::new(MemoryQuota::new(usize::MAX));
        let ht = HashTable::new(
            16,
            4,
            StoredValueFactory::new(StoredValueType::Featured, quota),
        );
        Arc::new(VBucket::new(id, state, ht))
    }

    #[test]
    fn test_out_of_range_is_checked() {
        let map = VBucketMap::new(4);
        assert!(map.get_bucket(100).is_none());
        assert!(!map.set_bucket_deletion(100, true));
        assert_eq!(map.persistence_checkpoint_id(100), 0);
        let err = map.add_bucket(make_vb(100, VBucketState::Active)).unwrap_err();
        assert!(matches!(err, EmberError::VbucketOutOfRange { vbid: 100, capacity: 4 }));
    }

    #[test]
    fn test_add_get_remove() {
        let map = VBucketMap::new(4);
        map.add_bucket(make_vb(2, VBucketState::Active)).unwrap();
        assert!(map.get_bucket(2).is_some());
        assert_eq!(map.ids(), vec![2]);
        map.remove_bucket(2);
        assert!(map.get_bucket(2).is_none());
    }

    #[test]
    fn test_snapshot_flag_dedup() {
        let map = VBucketMap::new(4);
        // First claim wins, second is refused until the task releases.
        assert!(map.set_high_priority_vb_snapshot_flag(true));
        assert!(!map.set_high_priority_vb_snapshot_flag(true));
        assert!(map.is_high_priority_vb_snapshot_scheduled());
        assert!(map.set_high_priority_vb_snapshot_flag(false));
        assert!(map.set_high_priority_vb_snapshot_flag(true));
        // Priorities are independent.
        assert!(map.set_low_priority_vb_snapshot_flag(true));
    }

    #[test]
    fn test_checkpoint_id_is_monotonic() {
        let map = VBucketMap::new(4);
        map.set_persistence_checkpoint_id(1, 10);
        map.set_persistence_checkpoint_id(1, 7);
        assert_eq!(map.persistence_checkpoint_id(1), 10);
        map.set_persistence_checkpoint_id(1, 12);
        assert_eq!(map.persistence_checkpoint_id(1), 12);
        map.reset_persistence_checkpoint_id(1);
        assert_eq!(map.persistence_checkpoint_id(1), 0);
    }

    #[test]
    fn test_ids_sorted_by_state() {
        let map = VBucketMap::new(8);
        map.add_bucket(make_vb(0, VBucketState::Dead)).unwrap();
        map.add_bucket(make_vb(1, VBucketState::Replica)).unwrap();
        map.add_bucket(make_vb(2, VBucketState::Active)).unwrap();
        map.add_bucket(make_vb(3, VBucketState::Pending)).unwrap();
        assert_eq!(map.ids_sorted_by_state(), vec![2, 1, 3, 0]);
    }
}
