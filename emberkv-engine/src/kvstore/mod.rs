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

//! The storage backend contract.
//!
//! The engine core is backend-agnostic: everything it needs from durable
//! storage is the [`KVStore`] trait. Two plugs ship in-tree: the
//! [`memory`] store, a real rowid-assigning backend the warmup and fetch
//! paths exercise end to end, and [`blackhole`], which persists nothing.

pub mod blackhole;
pub mod memory;

use std::collections::HashMap;

use std::sync::Arc;

use emberkv_core::{EmberError, EngineStatus, Item, Result};

use crate::vbucket::{FetchQueue, VBucketState};

pub use blackhole::BlackholeKVStore;
pub use memory::MemoryKVStore;

/// Result of a point fetch from the backend.
#[derive(Debug, Clone)]
pub struct GetValue {
    pub item: Option<Item>,
    pub status: EngineStatus,
}

impl GetValue {
    pub fn success(item: Item) -> Self {
        GetValue {
            item: Some(item),
            status: EngineStatus::Success,
        }
    }

    pub fn missing(status: EngineStatus) -> Self {
        GetValue { item: None, status }
    }

    /// A fetch slot the backend has not resolved yet.
    pub fn pending() -> Self {
        GetValue {
            item: None,
            status: EngineStatus::WouldBlock,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Outcome of a durable upsert.
#[derive(Debug, Clone, Copy)]
pub struct MutationResult {
    /// True when the row was created rather than updated.
    pub inserted: bool,
    /// Backend identity of the row.
    pub rowid: i64,
}

/// Capability flags a backend reports, consulted when wiring the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageProperties {
    /// Batched point reads are cheap; misses may take the multi-fetch path.
    pub has_efficient_get: bool,
    /// Partition-level erase is cheap; no chunked in-memory teardown needed.
    pub has_efficient_vb_deletion: bool,
    /// Per-partition dump is supported.
    pub has_efficient_vb_dump: bool,
}

/// Contract between the engine core and durable storage.
///
/// Mutations happen inside `begin`/`commit` transactions driven by the
/// flusher; `commit` is allowed to fail and will be retried with the
/// same logical content. Reads are transaction-free.
pub trait KVStore: Send + Sync + std::fmt::Debug {
    /// Drop every stored row; partition states survive.
    fn reset(&self) -> Result<()>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self);

    fn storage_properties(&self) -> StorageProperties;

    /// Durable upsert. The returned rowid is stable for the life of the
    /// row and is how non-resident values are fetched back.
    fn set(&self, item: &Item) -> Result<MutationResult>;

    /// Point fetch by rowid, falling back to the key when the caller has
    /// no rowid.
    fn get(&self, key: &[u8], rowid: i64, vbucket: u16) -> GetValue;

    /// Batched fetch: resolve every waiter's value slot in `fetches`.
    /// Entries are never removed; the caller owns completion/requeue.
    fn get_multi(&self, vbucket: u16, fetches: &mut FetchQueue);

    /// Durable remove.
    fn del(&self, item: &Item, rowid: i64) -> Result<()>;

    /// Partition-level erase.
    fn del_vbucket(&self, vbucket: u16, recreate: bool) -> Result<()>;

    /// Partition states as last snapshotted, used by warmup.
    fn list_persisted_vbuckets(&self) -> HashMap<u16, VBucketState>;

    /// Persist a partition-state snapshot; false on failure.
    fn snapshot_vbuckets(&self, map: &HashMap<u16, VBucketState>) -> bool;

    /// Persist an engine-stats snapshot; false on failure.
    fn snapshot_stats(&self, map: &HashMap<String, String>) -> bool;

    /// Full scan, for warmup.
    fn dump(&self, cb: &mut dyn FnMut(GetValue));

    /// Scan one partition.
    fn dump_vbucket(&self, vbucket: u16, cb: &mut dyn FnMut(GetValue));

    /// Replay persisted records for the given partitions. `estimate` is
    /// called once with the record count before replay starts; returns
    /// the number of records delivered to `cb`.
    fn warmup(
        &self,
        vbmap: &HashMap<u16, VBucketState>,
        cb: &mut dyn FnMut(GetValue),
        estimate: &mut dyn FnMut(usize),
    ) -> Result<usize> {
        let mut total = 0usize;
        self.dump(&mut |gv: GetValue| {
            if gv
                .item
                .as_ref()
                .map(|item| vbmap.contains_key(&item.vbucket))
                .unwrap_or(false)
            {
                total += 1;
            }
        });
        estimate(total);
        let mut loaded = 0usize;
        self.dump(&mut |gv: GetValue| {
            let relevant = gv
                .item
                .as_ref()
                .map(|item| vbmap.contains_key(&item.vbucket))
                .unwrap_or(false);
            if relevant {
                loaded += 1;
                cb(gv);
            }
        });
        Ok(loaded)
    }
}

/// Builds the configured backend plug.
pub struct KVStoreFactory;

impl KVStoreFactory {
    pub fn create(backend: &str) -> Result<Arc<dyn KVStore>> {
        match backend {
            "memory" => Ok(Arc::new(MemoryKVStore::new())),
            "blackhole" => Ok(Arc::new(BlackholeKVStore::new())),
            other => Err(EmberError::UnknownBackend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_known_backends() {
        assert!(KVStoreFactory::create("memory").is_ok());
        assert!(KVStoreFactory::create("blackhole").is_ok());
    }

    #[test]
    fn test_factory_rejects_unknown_backend() {
        let err = KVStoreFactory::create("couchdb").unwrap_err();
        assert!(matches!(err, EmberError::UnknownBackend(name) if name == "couchdb"));
    }
}
