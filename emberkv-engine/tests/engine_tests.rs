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

//! End-to-end engine tests: the full path from the store façade through
//! the hash tables, dirty queues, flusher, background fetcher and
//! pagers, against the in-memory backend.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use emberkv_engine::{
    EmberStore, EngineConfig, EngineStatus, FlusherState, Item, KVStore, MemoryKVStore,
    VBucketState,
};

fn test_config() -> EngineConfig {
    EngineConfig {
        warmup: false,
        expiry_pager_sleeptime: 0,
        max_vbuckets: 16,
        ht_size: 64,
        ht_locks: 4,
        ..EngineConfig::default()
    }
}

fn new_store() -> (Arc<EmberStore>, Arc<MemoryKVStore>) {
    let backend = Arc::new(MemoryKVStore::new());
    let store = EmberStore::with_backend(test_config(), backend.clone()).expect("store boots");
    store
        .set_vbucket_state(0, VBucketState::Active)
        .expect("vbucket 0");
    (store, backend)
}

fn item(key: &[u8], value: &[u8]) -> Item {
    Item::new(key, value, 0, 0, 0)
}

fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Persist and eject a key, leaving only its metadata shell in memory.
fn persist_and_evict(store: &Arc<EmberStore>, key: &[u8]) {
    assert!(
        wait_until(
            || store.evict_key(key, 0).0 == EngineStatus::Success,
            Duration::from_secs(10),
        ),
        "value never became clean and persisted"
    );
}

#[test]
fn test_hot_path_cas() {
    let (store, _backend) = new_store();

    let mut first = item(b"a", b"1");
    assert_eq!(store.set(&mut first, false), EngineStatus::Success);
    let c1 = first.cas;
    assert_ne!(c1, 0);

    // A stale CAS is refused.
    let mut stale = item(b"a", b"2");
    stale.cas = c1 + 1000;
    assert_eq!(store.set(&mut stale, false), EngineStatus::KeyExists);

    // The current CAS swaps and mints a new version.
    let mut guarded = item(b"a", b"2");
    guarded.cas = c1;
    assert_eq!(store.set(&mut guarded, false), EngineStatus::Success);
    let c2 = guarded.cas;
    assert_ne!(c2, c1);

    // Reusing the consumed CAS fails.
    let mut replay = item(b"a", b"3");
    replay.cas = c1;
    assert_eq!(store.set(&mut replay, false), EngineStatus::KeyExists);

    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::Success);
    let got = result.item.expect("value present");
    assert_eq!(got.value().as_bytes(), b"2");
    assert_eq!(got.cas, c2);

    store.shutdown();
}

#[test]
fn test_miss_then_fetch_round_trip() {
    let (store, backend) = new_store();

    let mut it = item(b"a", b"1");
    assert_eq!(store.set(&mut it, false), EngineStatus::Success);
    let c1 = it.cas;

    persist_and_evict(&store, b"a");
    assert_eq!(backend.row_count(), 1);

    // The shell is there but the value is not: would-block.
    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::WouldBlock);
    let handle = result.handle.expect("fetch handle");
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(EngineStatus::Success)
    );

    // Re-driving the read now hits the restored value, same version.
    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::Success);
    let got = result.item.expect("restored value");
    assert_eq!(got.value().as_bytes(), b"1");
    assert_eq!(got.cas, c1);

    store.shutdown();
}

#[test]
fn test_concurrent_misses_share_one_row() {
    let (store, backend) = new_store();

    let mut it = item(b"a", b"shared-bytes");
    store.set(&mut it, false);
    persist_and_evict(&store, b"a");
    let calls_before = backend.get_multi_calls();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let result = store.get(b"a", 0);
            match result.status {
                EngineStatus::Success => result.item.expect("value").value().to_vec(),
                EngineStatus::WouldBlock => {
                    let handle = result.handle.expect("fetch handle");
                    assert_eq!(
                        handle.wait_timeout(Duration::from_secs(10)),
                        Some(EngineStatus::Success)
                    );
                    let result = store.get(b"a", 0);
                    assert_eq!(result.status, EngineStatus::Success);
                    result.item.expect("value").value().to_vec()
                }
                other => panic!("unexpected status {:?}", other),
            }
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().expect("reader thread"), b"shared-bytes".to_vec());
    }

    // Coalescing bounds the backend work: at most one batch per reader,
    // typically one total.
    let calls = backend.get_multi_calls() - calls_before;
    assert!((1..=3).contains(&calls), "expected 1..=3 batches, saw {}", calls);

    store.shutdown();
}

#[test]
fn test_bg_fetch_retries_soft_errors() {
    let (store, backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    persist_and_evict(&store, b"a");

    let calls_before = backend.get_multi_calls();
    backend.inject_fetch_failures(2);

    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::WouldBlock);
    let handle = result.handle.expect("fetch handle");
    // Two failed batches are retried, the third succeeds.
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(EngineStatus::Success)
    );
    assert!(backend.get_multi_calls() - calls_before >= 3);
    assert!(store.stats().bg_requeued.load(Ordering::Relaxed) >= 2);

    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::Success);
    assert_eq!(result.item.expect("value").value().as_bytes(), b"1");

    store.shutdown();
}

#[test]
fn test_exhausted_retries_surface_failure() {
    let (store, backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    persist_and_evict(&store, b"a");

    // More failures than the retry cap: the client sees the failure.
    backend.inject_fetch_failures(64);
    let result = store.get(b"a", 0);
    let handle = result.handle.expect("fetch handle");
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(EngineStatus::TempFail)
    );
    backend.inject_fetch_failures(0);

    store.shutdown();
}

#[test]
fn test_lock_blocks_casless_writes_until_expiry() {
    let (store, _backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);

    let locked = store.get_locked(b"a", 0, 10);
    assert_eq!(locked.status, EngineStatus::Success);
    let lock_cas = locked.item.expect("locked value").cas;

    // A second lock attempt and a blind write are both refused.
    assert_eq!(store.get_locked(b"a", 0, 10).status, EngineStatus::Locked);
    let mut blind = item(b"a", b"2");
    assert_eq!(store.set(&mut blind, false), EngineStatus::Locked);

    // The lock CAS opens the record.
    let mut keyed = item(b"a", b"2");
    keyed.cas = lock_cas;
    assert_eq!(store.set(&mut keyed, false), EngineStatus::Success);

    // Lock again and let it time out instead.
    assert_eq!(store.get_locked(b"a", 0, 10).status, EngineStatus::Success);
    store.clock().advance(11);
    let mut late = item(b"a", b"3");
    assert_eq!(store.set(&mut late, false), EngineStatus::Success);

    store.shutdown();
}

#[test]
fn test_unlock_requires_matching_cas() {
    let (store, _backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    let locked = store.get_locked(b"a", 0, 20);
    let lock_cas = locked.item.expect("value").cas;

    assert_eq!(
        store.unlock_key(b"a", 0, lock_cas + 1),
        EngineStatus::InvalidCas
    );
    assert_eq!(store.unlock_key(b"a", 0, lock_cas), EngineStatus::Success);
    // Unlocking an unlocked key is a transient error.
    assert_eq!(store.unlock_key(b"a", 0, lock_cas), EngineStatus::TempFail);

    let mut next = item(b"a", b"2");
    assert_eq!(store.set(&mut next, false), EngineStatus::Success);

    store.shutdown();
}

#[test]
fn test_ttl_reap_on_read_queues_delete() {
    let (store, backend) = new_store();

    // Comfortably beyond the expiry window, so the flusher persists it.
    let now = store.clock().now();
    let mut it = Item::new(b"a", b"1".as_slice(), 0, now + 10, 0);
    assert_eq!(store.set(&mut it, false), EngineStatus::Success);
    assert_eq!(store.get(b"a", 0).status, EngineStatus::Success);
    assert!(wait_until(|| backend.row_count() == 1, Duration::from_secs(5)));

    store.clock().advance(11);
    // The read observes expiry, drops the record and queues the delete.
    assert_eq!(store.get(b"a", 0).status, EngineStatus::KeyNotFound);
    let (status, _) = store.get_key_stats(b"a", 0);
    assert_eq!(status, EngineStatus::KeyNotFound);
    assert!(wait_until(|| backend.row_count() == 0, Duration::from_secs(5)));
    assert!(store.stats().expired_access.load(Ordering::Relaxed) >= 1);

    store.shutdown();
}

#[test]
fn test_expiry_pager_sweeps_ttls() {
    let (store, _backend) = new_store();

    let now = store.clock().now();
    for i in 0..10u8 {
        let mut it = Item::new(&[i], b"v".as_slice(), 0, now + 1, 0);
        assert_eq!(store.set(&mut it, false), EngineStatus::Success);
    }
    store.clock().advance(5);
    store.set_expiry_pager_sleeptime(1);

    assert!(wait_until(
        || store.stats().expired_pager.load(Ordering::Relaxed) >= 10,
        Duration::from_secs(10),
    ));
    for i in 0..10u8 {
        let (status, _) = store.get_key_stats(&[i], 0);
        assert_eq!(status, EngineStatus::KeyNotFound);
    }

    store.shutdown();
}

#[test]
fn test_flusher_persists_and_clears_dirty() {
    let (store, backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    assert!(wait_until(|| backend.row_count() == 1, Duration::from_secs(5)));
    assert!(wait_until(
        || {
            let (status, stats) = store.get_key_stats(b"a", 0);
            status == EngineStatus::Success && !stats.expect("stats").dirty
        },
        Duration::from_secs(5),
    ));
    assert!(store.vbuckets().persistence_checkpoint_id(0) >= 1);

    store.shutdown();
}

#[test]
fn test_flusher_pause_and_resume() {
    let (store, backend) = new_store();

    assert!(store.pause_flusher());
    assert!(store
        .flusher()
        .wait_for_state(FlusherState::Paused, Duration::from_secs(5)));

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(backend.row_count(), 0);

    assert!(store.resume_flusher());
    assert!(wait_until(|| backend.row_count() == 1, Duration::from_secs(5)));

    store.shutdown();
}

#[test]
fn test_failed_commit_goes_to_reject_queue_and_retries() {
    let (store, backend) = new_store();

    backend.inject_commit_failures(1);
    let mut it = item(b"a", b"1");
    store.set(&mut it, false);

    // First transaction fails, the batch is rejected, the retry lands.
    assert!(wait_until(|| backend.row_count() == 1, Duration::from_secs(10)));
    assert!(store.stats().flusher_commit_failures.load(Ordering::Relaxed) >= 1);
    assert!(store.stats().flusher_commits.load(Ordering::Relaxed) >= 1);

    store.shutdown();
}

#[test]
fn test_shutdown_drains_pending_writes() {
    let (store, backend) = new_store();

    store.pause_flusher();
    store
        .flusher()
        .wait_for_state(FlusherState::Paused, Duration::from_secs(5));
    for i in 0..20u8 {
        let mut it = item(&[i], b"v");
        assert_eq!(store.set(&mut it, false), EngineStatus::Success);
    }
    assert_eq!(backend.row_count(), 0);

    store.resume_flusher();
    store.shutdown();
    assert_eq!(backend.row_count(), 20);
}

#[test]
fn test_warmup_rebuilds_from_backend() {
    let backend = Arc::new(MemoryKVStore::new());
    let cas = {
        let store =
            EmberStore::with_backend(test_config(), backend.clone()).expect("first boot");
        store.set_vbucket_state(0, VBucketState::Active).unwrap();
        let mut it = item(b"a", b"persisted");
        assert_eq!(store.set(&mut it, false), EngineStatus::Success);
        // Wait for the state snapshot too, so warmup can find vb 0.
        assert!(wait_until(
            || !backend.list_persisted_vbuckets().is_empty(),
            Duration::from_secs(5),
        ));
        store.shutdown();
        it.cas
    };
    assert_eq!(backend.row_count(), 1);

    let config = EngineConfig {
        warmup: true,
        ..test_config()
    };
    let store = EmberStore::with_backend(config, backend).expect("second boot");
    assert_eq!(store.stats().warmed_up.load(Ordering::Relaxed), 1);

    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::Success);
    let got = result.item.expect("warmed value");
    assert_eq!(got.value().as_bytes(), b"persisted");
    assert_eq!(got.cas, cas);

    store.shutdown();
}

#[test]
fn test_vbucket_states_gate_requests() {
    let (store, _backend) = new_store();
    store.set_vbucket_state(1, VBucketState::Replica).unwrap();
    store.set_vbucket_state(2, VBucketState::Pending).unwrap();

    // Active-only reads refuse a replica, and vice versa.
    assert_eq!(store.get(b"k", 1).status, EngineStatus::NotMyVbucket);
    assert_eq!(store.get_replica(b"k", 0).status, EngineStatus::NotMyVbucket);
    assert_eq!(store.get_replica(b"k", 1).status, EngineStatus::KeyNotFound);

    // Pending partitions ask the client to retry.
    assert_eq!(store.get(b"k", 2).status, EngineStatus::WouldBlock);
    let mut pending_item = Item::new(b"k", b"v".as_slice(), 0, 0, 2);
    assert_eq!(store.set(&mut pending_item, false), EngineStatus::WouldBlock);

    // Unknown partition.
    assert_eq!(store.get(b"k", 9).status, EngineStatus::NotMyVbucket);

    // Backfill writes reach the replica, and replica reads see them.
    let mut backfill = Item::new(b"k", b"replica-copy".as_slice(), 0, 0, 1);
    assert_eq!(store.add_backfill_item(&mut backfill), EngineStatus::Success);
    let result = store.get_replica(b"k", 1);
    assert_eq!(result.status, EngineStatus::Success);
    assert_eq!(result.item.expect("value").value().as_bytes(), b"replica-copy");

    store.shutdown();
}

#[test]
fn test_add_demands_absence() {
    let (store, _backend) = new_store();

    let mut it = item(b"a", b"1");
    assert_eq!(store.add(&mut it), EngineStatus::Success);
    let mut dup = item(b"a", b"2");
    assert_eq!(store.add(&mut dup), EngineStatus::KeyExists);

    store.shutdown();
}

#[test]
fn test_set_with_meta_preserves_remote_cas() {
    let (store, _backend) = new_store();

    let mut remote = Item::with_cas(b"a", b"from-peer".as_slice(), 7, 0, 987_654, 0);
    assert_eq!(
        store.set_with_meta(&mut remote, 0, false, true),
        EngineStatus::Success
    );
    let result = store.get(b"a", 0);
    let got = result.item.expect("value");
    assert_eq!(got.cas, 987_654);
    assert_eq!(got.flags, 7);

    // Replace-forbidden refuses an existing key.
    let mut again = Item::with_cas(b"a", b"x".as_slice(), 0, 0, 111, 0);
    assert_eq!(
        store.set_with_meta(&mut again, 0, false, false),
        EngineStatus::KeyExists
    );

    store.shutdown();
}

#[test]
fn test_delete_item_is_cas_checked() {
    let (store, backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    assert!(wait_until(|| backend.row_count() == 1, Duration::from_secs(5)));

    assert_eq!(
        store.delete_item(b"a", it.cas + 5, 0, false, None, false),
        EngineStatus::KeyExists
    );
    assert_eq!(
        store.delete_item(b"a", it.cas, 0, false, None, false),
        EngineStatus::Success
    );
    assert_eq!(store.get(b"a", 0).status, EngineStatus::KeyNotFound);
    assert!(wait_until(|| backend.row_count() == 0, Duration::from_secs(5)));
    assert_eq!(
        store.delete_item(b"a", 0, 0, false, None, false),
        EngineStatus::KeyNotFound
    );

    store.shutdown();
}

#[test]
fn test_get_metadata_serves_shells_and_misses() {
    let (store, _backend) = new_store();

    let mut it = Item::new(b"a", b"1".as_slice(), 42, 0, 0);
    store.set(&mut it, false);
    persist_and_evict(&store, b"a");

    // Metadata needs no value residency.
    let meta = store.get_metadata(b"a", 0);
    assert_eq!(meta.status, EngineStatus::Success);
    let metadata = meta.metadata.expect("metadata");
    assert_eq!(metadata.cas, it.cas);
    assert_eq!(metadata.flags, 42);

    // A key the engine has never seen resolves through the backend and
    // comes back missing.
    let meta = store.get_metadata(b"ghost", 0);
    assert_eq!(meta.status, EngineStatus::WouldBlock);
    let handle = meta.handle.expect("fetch handle");
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(EngineStatus::KeyNotFound)
    );

    store.shutdown();
}

#[test]
fn test_get_and_update_ttl() {
    let (store, _backend) = new_store();

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);

    let now = store.clock().now();
    let result = store.get_and_update_ttl(b"a", 0, now + 50);
    assert_eq!(result.status, EngineStatus::Success);

    let (status, stats) = store.get_key_stats(b"a", 0);
    assert_eq!(status, EngineStatus::Success);
    assert_eq!(stats.expect("stats").exptime, now + 50);

    store.clock().advance(51);
    assert_eq!(store.get(b"a", 0).status, EngineStatus::KeyNotFound);

    store.shutdown();
}

#[test]
fn test_delete_vbucket_two_phase() {
    let (store, backend) = new_store();

    for i in 0..50u8 {
        let mut it = item(&[i], b"v");
        store.set(&mut it, false);
    }
    assert!(wait_until(|| backend.row_count() == 50, Duration::from_secs(5)));

    assert_eq!(store.delete_vbucket(0), EngineStatus::Success);
    assert!(wait_until(
        || store.vbuckets().get_bucket(0).is_none(),
        Duration::from_secs(5),
    ));
    assert_eq!(backend.row_count(), 0);
    assert_eq!(store.get(b"\x01", 0).status, EngineStatus::NotMyVbucket);
    assert_eq!(store.vbuckets().persistence_checkpoint_id(0), 0);

    store.shutdown();
}

#[test]
fn test_flush_all_reset() {
    let (store, backend) = new_store();

    for i in 0..10u8 {
        let mut it = item(&[i], b"v");
        store.set(&mut it, false);
    }
    assert!(wait_until(|| backend.row_count() == 10, Duration::from_secs(5)));

    store.reset();
    assert_eq!(store.get(b"\x01", 0).status, EngineStatus::KeyNotFound);
    assert!(wait_until(|| backend.row_count() == 0, Duration::from_secs(5)));
    assert!(wait_until(|| !store.is_flush_all_scheduled(), Duration::from_secs(5)));

    store.shutdown();
}

#[test]
fn test_pager_relieves_memory_pressure() {
    let backend = Arc::new(MemoryKVStore::new());
    let config = EngineConfig {
        max_size: 120 * 1024,
        mem_high_watermark: 0.70,
        mem_low_watermark: 0.50,
        ..test_config()
    };
    let store = EmberStore::with_backend(config, backend).expect("store boots");
    store.set_vbucket_state(0, VBucketState::Active).unwrap();

    // Fill until the budget refuses; every stored value must be
    // persisted before it is ejectable.
    let payload = vec![0u8; 1024];
    let mut stored = 0u32;
    for i in 0..500u32 {
        let mut it = Item::new(&i.to_be_bytes(), payload.as_slice(), 0, 0, 0);
        match store.set(&mut it, false) {
            EngineStatus::Success => stored += 1,
            EngineStatus::TempFail => break,
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert!(stored > 0);
    assert!(store.quota().current() > store.config().high_watermark());

    // Keep offering work; the pager sweeps (woken by each refusal) and
    // eventually frees room below the high watermark.
    let relieved = wait_until(
        || {
            let mut probe = Item::new(b"probe", payload.as_slice(), 0, 0, 0);
            store.set(&mut probe, false) == EngineStatus::Success
        },
        Duration::from_secs(30),
    );
    assert!(relieved, "pager never freed memory");
    assert!(store.stats().num_values_ejected.load(Ordering::Relaxed) > 0);

    store.shutdown();
}

#[test]
fn test_per_item_fetch_path_without_ro_dispatcher() {
    // Without a separate read dispatcher the batched fetch path is off
    // and misses resolve through one-shot fetch tasks.
    let backend = Arc::new(MemoryKVStore::new());
    let config = EngineConfig {
        concurrent_db: false,
        ..test_config()
    };
    let store = EmberStore::with_backend(config, backend.clone()).expect("store boots");
    store.set_vbucket_state(0, VBucketState::Active).unwrap();
    assert!(!store.multi_bg_fetch_enabled());

    let mut it = item(b"a", b"1");
    store.set(&mut it, false);
    persist_and_evict(&store, b"a");
    let batched_before = backend.get_multi_calls();

    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::WouldBlock);
    let handle = result.handle.expect("fetch handle");
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(EngineStatus::Success)
    );
    assert_eq!(backend.get_multi_calls(), batched_before);

    let result = store.get(b"a", 0);
    assert_eq!(result.status, EngineStatus::Success);
    assert_eq!(result.item.expect("value").value().as_bytes(), b"1");

    store.shutdown();
}

#[test]
fn test_evicted_shells_count_as_non_resident() {
    let (store, _backend) = new_store();

    let mut it = item(b"a", b"some-value-bytes");
    store.set(&mut it, false);
    persist_and_evict(&store, b"a");
    assert_eq!(store.stats().num_non_resident.load(Ordering::Relaxed), 1);

    // Re-eviction of a shell is refused.
    let (status, msg) = store.evict_key(b"a", 0);
    assert_eq!(status, EngineStatus::KeyExists);
    assert_eq!(msg, "Already ejected.");

    // Restoring through a fetch brings the count back down.
    let result = store.get(b"a", 0);
    let handle = result.handle.expect("fetch handle");
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(10)),
        Some(EngineStatus::Success)
    );
    assert!(wait_until(
        || store.stats().num_non_resident.load(Ordering::Relaxed) == 0,
        Duration::from_secs(5),
    ));

    store.shutdown();
}
