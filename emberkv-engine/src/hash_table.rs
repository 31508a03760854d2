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

//! Per-partition keyed index with striped locking.
//!
//! Buckets are chained records; bucket `b` is guarded by stripe mutex
//! `b % n_locks`, so writers on different stripes proceed in parallel
//! while visitors take one bucket at a time. Lookup coalesces expiry:
//! an entry whose TTL has passed is removed under the bucket lock and
//! reported as a miss, so the hot path needs no separate lazy-expire
//! sweep.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use emberkv_core::time::RelTime;
use emberkv_core::{AddStatus, Item, MutationStatus};

use crate::stored_value::{StoredValue, StoredValueFactory};

/// Default bucket count when the configuration leaves it at zero.
pub const DEFAULT_HT_SIZE: usize = 3079;
/// Default stripe count when the configuration leaves it at zero.
pub const DEFAULT_HT_LOCKS: usize = 193;

type Chain = Option<Box<StoredValue>>;

/// Walks every record of a table, one bucket lock at a time.
pub trait HashTableVisitor {
    fn visit(&mut self, value: &mut StoredValue);

    /// Polled between buckets; returning false abandons the walk.
    fn should_continue(&self) -> bool {
        true
    }
}

struct VisitorTracker<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> VisitorTracker<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        VisitorTracker { counter }
    }
}

impl Drop for VisitorTracker<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Stripe {
    chains: Vec<Chain>,
}

pub struct HashTable {
    n_buckets: usize,
    n_locks: usize,
    stripes: Vec<Mutex<Stripe>>,
    factory: StoredValueFactory,
    active: AtomicBool,
    visitors: AtomicUsize,
    num_items: AtomicUsize,
}

impl HashTable {
    /// Build a table; zero sizes select the defaults.
    pub fn new(num_buckets: usize, num_locks: usize, factory: StoredValueFactory) -> Self {
        let n_buckets = if num_buckets == 0 { DEFAULT_HT_SIZE } else { num_buckets };
        let n_locks = if num_locks == 0 { DEFAULT_HT_LOCKS } else { num_locks };
        let stripes = (0..n_locks)
            .map(|i| {
                let chains = (n_buckets.saturating_sub(i) + n_locks - 1) / n_locks;
                Mutex::new(Stripe {
                    chains: (0..chains).map(|_| None).collect(),
                })
            })
            .collect();
        HashTable {
            n_buckets,
            n_locks,
            stripes,
            factory,
            active: AtomicBool::new(true),
            visitors: AtomicUsize::new(0),
            num_items: AtomicUsize::new(0),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.n_buckets
    }

    pub fn num_locks(&self) -> usize {
        self.n_locks
    }

    /// Number of records currently chained, resident or not.
    pub fn len(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn factory(&self) -> &StoredValueFactory {
        &self.factory
    }

    fn hash(&self, key: &[u8]) -> u32 {
        let mut h: u32 = 5381;
        for &b in key {
            h = (h << 5).wrapping_add(h) ^ u32::from(b);
        }
        h
    }

    pub fn bucket_for(&self, key: &[u8]) -> usize {
        self.hash(key) as usize % self.n_buckets
    }

    /// Take the stripe lock covering `key`'s bucket.
    pub fn lock_bucket(&self, key: &[u8]) -> BucketGuard<'_> {
        debug_assert!(self.active());
        self.lock_bucket_index(self.bucket_for(key))
    }

    fn lock_bucket_index(&self, bucket: usize) -> BucketGuard<'_> {
        debug_assert!(bucket < self.n_buckets);
        let stripe = self.stripes[bucket % self.n_locks].lock();
        BucketGuard {
            stripe,
            slot: bucket / self.n_locks,
            table: self,
        }
    }

    /// Expiry-coalesced lookup: applies `f` to the live record, or
    /// returns `None` after silently dropping an expired one.
    pub fn find<T>(
        &self,
        key: &[u8],
        now: RelTime,
        f: impl FnOnce(&mut StoredValue) -> T,
    ) -> Option<T> {
        let mut guard = self.lock_bucket(key);
        if guard.take_expired(key, now) {
            return None;
        }
        guard.find(key).map(f)
    }

    /// Store `item`, minting a fresh CAS on success. See
    /// [`BucketGuard::set`] for the lock/CAS ladder.
    pub fn set(&self, item: &mut Item, now: RelTime) -> MutationStatus {
        self.lock_bucket(item.key()).set(item, now)
    }

    /// Insert-if-absent.
    pub fn add(&self, item: &mut Item, dirty: bool, now: RelTime) -> AddStatus {
        self.lock_bucket(item.key()).add(item, dirty, now)
    }

    /// Remove `key`; refuses when the record is locked.
    pub fn del(&self, key: &[u8], now: RelTime) -> bool {
        self.lock_bucket(key).remove(key, now)
    }

    /// Walk every record, honoring the visitor's `should_continue`.
    pub fn visit<V: HashTableVisitor + ?Sized>(&self, visitor: &mut V) {
        let _tracker = VisitorTracker::new(&self.visitors);
        for bucket in 0..self.n_buckets {
            if !self.active() || !visitor.should_continue() {
                break;
            }
            let mut stripe = self.stripes[bucket % self.n_locks].lock();
            let mut cursor = stripe.chains[bucket / self.n_locks].as_deref_mut();
            while let Some(v) = cursor {
                visitor.visit(v);
                cursor = v.next.as_deref_mut();
            }
        }
    }

    /// Report the depth of every bucket, for stats.
    pub fn visit_depth(&self, f: &mut dyn FnMut(usize, usize)) {
        let _tracker = VisitorTracker::new(&self.visitors);
        for bucket in 0..self.n_buckets {
            if !self.active() {
                break;
            }
            let stripe = self.stripes[bucket % self.n_locks].lock();
            let mut depth = 0;
            let mut cursor = stripe.chains[bucket / self.n_locks].as_deref();
            while let Some(v) = cursor {
                depth += 1;
                cursor = v.next.as_deref();
            }
            f(bucket, depth);
        }
    }

    /// Remove everything, returning the number of records dropped.
    pub fn clear(&self, deactivate: bool) -> usize {
        if deactivate {
            self.active.store(false, Ordering::Release);
        }
        self.clear_buckets(0, self.n_buckets)
    }

    /// Remove the records of buckets `[start, start + count)`; used by
    /// chunked partition deletion.
    pub fn clear_buckets(&self, start: usize, count: usize) -> usize {
        let end = (start + count).min(self.n_buckets);
        let mut removed = 0;
        for bucket in start..end {
            let mut stripe = self.stripes[bucket % self.n_locks].lock();
            let mut node = stripe.chains[bucket / self.n_locks].take();
            while let Some(mut v) = node {
                node = v.next.take();
                self.factory.destroy(v);
                removed += 1;
            }
        }
        self.num_items.fetch_sub(removed, Ordering::Relaxed);
        removed
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        self.clear(true);
        // Wait out any visitor still walking buckets.
        while self.visitors.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_micros(100));
        }
    }
}

fn find_in_chain<'c>(chain: &'c mut Chain, key: &[u8]) -> Option<&'c mut StoredValue> {
    match chain {
        None => None,
        Some(node) => {
            if node.has_key(key) {
                Some(&mut **node)
            } else {
                find_in_chain(&mut node.next, key)
            }
        }
    }
}

fn unlink_from_chain(chain: &mut Chain, key: &[u8]) -> Option<Box<StoredValue>> {
    let head_matches = chain.as_ref().map(|n| n.has_key(key)).unwrap_or(false);
    if head_matches {
        let mut node = chain.take().expect("head checked");
        *chain = node.next.take();
        return Some(node);
    }
    match chain {
        Some(node) => unlink_from_chain(&mut node.next, key),
        None => None,
    }
}

/// Exclusive access to one bucket, held for the duration of a compound
/// operation so reads and updates of the same key cannot interleave.
pub struct BucketGuard<'a> {
    stripe: MutexGuard<'a, Stripe>,
    slot: usize,
    table: &'a HashTable,
}

impl<'a> BucketGuard<'a> {
    fn chain(&mut self) -> &mut Chain {
        &mut self.stripe.chains[self.slot]
    }

    /// Raw lookup; no expiry handling.
    pub fn find(&mut self, key: &[u8]) -> Option<&mut StoredValue> {
        find_in_chain(self.chain(), key)
    }

    /// If an expired record for `key` is present, drop it (when not
    /// locked) and report true: the caller must treat the key as absent.
    pub fn take_expired(&mut self, key: &[u8], now: RelTime) -> bool {
        let expired = match self.find(key) {
            Some(v) => v.is_expired(now),
            None => false,
        };
        if expired {
            self.remove(key, now);
        }
        expired
    }

    /// Insert at the head of the chain, preserving the item's CAS and
    /// rowid. Callers check the memory budget first.
    pub fn insert(&mut self, item: &Item, dirty: bool, now: RelTime) {
        let next = self.chain().take();
        let value = self.table.factory.create(item, next, dirty, now);
        *self.chain() = Some(value);
        self.table.num_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove `key`; refuses when the record is locked.
    pub fn remove(&mut self, key: &[u8], now: RelTime) -> bool {
        let locked = match self.find(key) {
            Some(v) => v.is_locked(now),
            None => return false,
        };
        if locked {
            return false;
        }
        match unlink_from_chain(self.chain(), key) {
            Some(node) => {
                self.table.factory.destroy(node);
                self.table.num_items.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// The store mutation ladder:
    ///
    /// * locked value: the supplied CAS must match (which unlocks), else
    ///   the mutation is refused with `IsLocked`;
    /// * unlocked value with a non-zero CAS: must match, else
    ///   `InvalidCas`;
    /// * absent key: a CAS-carrying set is refused with `NotFound`; a
    ///   CAS-less set inserts when the budget permits, else `NoMem`.
    ///
    /// On success a fresh CAS is minted onto `item` and the previous
    /// dirty state is reported so the caller can decide whether a new
    /// persistence entry is needed. A fresh insert reports `NotFound`
    /// with `item.cas` left non-zero.
    pub fn set(&mut self, item: &mut Item, now: RelTime) -> MutationStatus {
        let _ = self.take_expired(item.key(), now);
        if self.find(item.key()).is_some() {
            let quota = self.table.factory.quota().clone();
            let v = self.find(item.key()).expect("present under bucket lock");
            if v.is_locked(now) {
                if item.cas != v.cas() {
                    return MutationStatus::IsLocked;
                }
                v.unlock();
            } else if item.cas != 0 && item.cas != v.cas() {
                return MutationStatus::InvalidCas;
            }
            let status = if v.is_clean() {
                MutationStatus::WasClean
            } else {
                MutationStatus::WasDirty
            };
            item.mint_cas();
            v.set_value(
                item.value().clone(),
                item.flags,
                item.exptime,
                item.cas,
                now,
                &quota,
            );
            v.set_referenced();
            status
        } else {
            if item.cas != 0 {
                return MutationStatus::NotFound;
            }
            if !self.table.factory.has_space_for(item) {
                return MutationStatus::NoMem;
            }
            item.mint_cas();
            self.insert(item, true, now);
            MutationStatus::NotFound
        }
    }

    /// Insert-if-absent; mints a CAS on success.
    pub fn add(&mut self, item: &mut Item, dirty: bool, now: RelTime) -> AddStatus {
        let _ = self.take_expired(item.key(), now);
        if self.find(item.key()).is_some() {
            return AddStatus::Exists;
        }
        if !self.table.factory.has_space_for(item) {
            return AddStatus::NoMem;
        }
        item.mint_cas();
        self.insert(item, dirty, now);
        AddStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stored_value::{MemoryQuota, StoredValueType};
    use std::sync::Arc;

    fn table_with_quota(max: usize) -> HashTable {
        let quota = Arc::new(MemoryQuota::new(max));
        HashTable::new(
            16,
            4,
            StoredValueFactory::new(StoredValueType::Featured, quota),
        )
    }

    fn table() -> HashTable {
        table_with_quota(usize::MAX)
    }

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item::new(key, value, 0, 0, 0)
    }

    #[test]
    fn test_fresh_set_mints_cas() {
        let ht = table();
        let mut it = item(b"a", b"1");
        assert_eq!(ht.set(&mut it, 0), MutationStatus::NotFound);
        assert_ne!(it.cas, 0);
        assert_eq!(ht.len(), 1);
        let cas = ht.find(b"a", 0, |v| v.cas()).expect("present");
        assert_eq!(cas, it.cas);
    }

    #[test]
    fn test_cas_ladder() {
        let ht = table();
        let mut it = item(b"a", b"1");
        ht.set(&mut it, 0);
        let c1 = it.cas;

        // Stale CAS is refused.
        let mut stale = item(b"a", b"2");
        stale.cas = c1 + 1000;
        assert_eq!(ht.set(&mut stale, 0), MutationStatus::InvalidCas);

        // Matching CAS updates and mints a new one.
        let mut update = item(b"a", b"2");
        update.cas = c1;
        assert_eq!(ht.set(&mut update, 0), MutationStatus::WasClean);
        assert_ne!(update.cas, c1);

        // CAS on an absent key is refused.
        let mut ghost = item(b"ghost", b"x");
        ghost.cas = 5;
        assert_eq!(ht.set(&mut ghost, 0), MutationStatus::NotFound);
        assert!(ht.find(b"ghost", 0, |_| ()).is_none());
    }

    #[test]
    fn test_set_reports_prior_dirty_state() {
        let ht = table();
        let mut it = item(b"a", b"1");
        ht.set(&mut it, 0);
        // First set left the record dirty.
        let mut second = item(b"a", b"2");
        assert_eq!(ht.set(&mut second, 0), MutationStatus::WasDirty);
        ht.find(b"a", 0, |v| {
            v.mark_clean();
        });
        let mut third = item(b"a", b"3");
        assert_eq!(ht.set(&mut third, 0), MutationStatus::WasClean);
    }

    #[test]
    fn test_locked_value_requires_cas() {
        let ht = table();
        let mut it = item(b"a", b"1");
        ht.set(&mut it, 0);
        let cas = it.cas;
        ht.find(b"a", 0, |v| v.lock(100)).expect("present");

        let mut blind = item(b"a", b"2");
        assert_eq!(ht.set(&mut blind, 10), MutationStatus::IsLocked);

        // The right CAS opens the lock and the mutation lands.
        let mut keyed = item(b"a", b"2");
        keyed.cas = cas;
        assert_eq!(ht.set(&mut keyed, 10), MutationStatus::WasDirty);
        let locked = ht.find(b"a", 10, |v| v.is_locked(10)).expect("present");
        assert!(!locked);

        // Past lock expiry a CAS-less set succeeds.
        ht.find(b"a", 10, |v| v.lock(20)).expect("present");
        let mut late = item(b"a", b"3");
        assert_eq!(ht.set(&mut late, 21), MutationStatus::WasDirty);
    }

    #[test]
    fn test_find_reaps_expired() {
        let ht = table();
        let mut it = Item::new(b"a", b"1".as_slice(), 0, 10, 0);
        ht.set(&mut it, 0);
        assert!(ht.find(b"a", 10, |_| ()).is_some());
        // One second past the deadline the entry is gone.
        assert!(ht.find(b"a", 11, |_| ()).is_none());
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_expired_record_invisible_to_cas_set() {
        let ht = table();
        let mut it = Item::new(b"a", b"old".as_slice(), 0, 5, 0);
        ht.set(&mut it, 0);
        // A CAS-carrying set cannot see the expired record.
        let mut guarded = item(b"a", b"new");
        guarded.cas = it.cas;
        assert_eq!(ht.set(&mut guarded, 100), MutationStatus::NotFound);
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_add_semantics() {
        let ht = table();
        let mut it = item(b"a", b"1");
        assert_eq!(ht.add(&mut it, true, 0), AddStatus::Success);
        let mut dup = item(b"a", b"2");
        assert_eq!(ht.add(&mut dup, true, 0), AddStatus::Exists);
    }

    #[test]
    fn test_memory_budget_enforced() {
        let ht = table_with_quota(700);
        let mut small = item(b"a", b"tiny");
        assert_eq!(ht.set(&mut small, 0), MutationStatus::NotFound);
        let mut big = item(b"b", &[0u8; 4096]);
        assert_eq!(ht.set(&mut big, 0), MutationStatus::NoMem);
        assert_eq!(ht.add(&mut big, true, 0), AddStatus::NoMem);
        assert_eq!(ht.len(), 1);
    }

    #[test]
    fn test_del_refuses_locked() {
        let ht = table();
        let mut it = item(b"a", b"1");
        ht.set(&mut it, 0);
        ht.find(b"a", 0, |v| v.lock(100)).expect("present");
        assert!(!ht.del(b"a", 10));
        assert!(ht.del(b"a", 101));
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_clear_releases_quota() {
        let quota = Arc::new(MemoryQuota::new(usize::MAX));
        let ht = HashTable::new(
            8,
            2,
            StoredValueFactory::new(StoredValueType::Featured, quota.clone()),
        );
        for i in 0..20u8 {
            let mut it = item(&[i], b"value");
            ht.set(&mut it, 0);
        }
        assert!(quota.current() > 0);
        assert_eq!(ht.clear(false), 20);
        assert_eq!(quota.current(), 0);
        assert_eq!(ht.len(), 0);
    }

    struct CountingVisitor {
        seen: usize,
        stop_after: usize,
    }

    impl HashTableVisitor for CountingVisitor {
        fn visit(&mut self, _value: &mut StoredValue) {
            self.seen += 1;
        }

        fn should_continue(&self) -> bool {
            self.seen < self.stop_after
        }
    }

    #[test]
    fn test_visit_walks_all_records() {
        let ht = table();
        for i in 0..50u8 {
            let mut it = item(&[i], b"v");
            ht.set(&mut it, 0);
        }
        let mut visitor = CountingVisitor { seen: 0, stop_after: usize::MAX };
        ht.visit(&mut visitor);
        assert_eq!(visitor.seen, 50);

        let mut depths = 0;
        let mut total = 0;
        ht.visit_depth(&mut |_bucket, depth| {
            depths += 1;
            total += depth;
        });
        assert_eq!(depths, ht.num_buckets());
        assert_eq!(total, 50);
    }

    #[test]
    fn test_visitor_stops_early() {
        let ht = table();
        for i in 0..50u8 {
            let mut it = item(&[i], b"v");
            ht.set(&mut it, 0);
        }
        let mut visitor = CountingVisitor { seen: 0, stop_after: 10 };
        ht.visit(&mut visitor);
        assert!(visitor.seen < 50);
    }
}
