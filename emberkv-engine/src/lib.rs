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

//! EmberKV Engine
//!
//! An eventually-persistent, partitioned key-value store: a striped
//! in-memory caching tier in front of a pluggable durable backend.
//!
//! ## Architecture
//!
//! ```text
//! clients ──> EmberStore ──> VBucketMap ──> VBucket ──> HashTable
//!                │                            │
//!                │ miss (non-resident)        │ mutation
//!                ▼                            ▼
//!            BgFetcher  <── RO dispatcher  dirty queue
//!                │                            │
//!                ▼                            ▼
//!             KVStore  <── RW dispatcher ── Flusher
//! ```
//!
//! Reads are served from per-partition hash tables with striped locks;
//! a miss on a non-resident value returns `WouldBlock` and completes
//! asynchronously through the background fetcher. Mutations are
//! acknowledged after the in-memory update and persisted later by the
//! flusher, one bounded transaction per partition. Under memory
//! pressure the item pager ejects clean values down to the low
//! watermark, leaving metadata shells behind; the expiry pager reaps
//! TTL-expired records into the same persistence queue.
//!
//! Background work rides on [`dispatcher::Dispatcher`]s: single-threaded
//! priority-ordered task runners, split by concern so slow reads cannot
//! starve persistence.

pub mod bg_fetcher;
pub mod config;
pub mod dispatcher;
pub mod flusher;
pub mod hash_table;
pub mod kvstore;
pub mod pager;
pub mod stats;
pub mod store;
pub mod stored_value;
pub mod vbucket;
pub mod vbucket_map;
pub mod warmup;

pub use bg_fetcher::BgFetcher;
pub use config::{EngineConfig, MAX_BG_FETCH_DELAY};
pub use dispatcher::{Dispatcher, DispatcherCallback, FnCallback, Priority, TaskHandle};
pub use flusher::{Flusher, FlusherState};
pub use hash_table::{HashTable, HashTableVisitor, DEFAULT_HT_LOCKS, DEFAULT_HT_SIZE};
pub use kvstore::{
    BlackholeKVStore, GetValue, KVStore, KVStoreFactory, MemoryKVStore, MutationResult,
    StorageProperties,
};
pub use stats::{EngineStats, LatencyHistogram};
pub use store::{EmberStore, FetchHandle, GetResult, KeyStats, MetaResult, VBucketVisitor};
pub use stored_value::{MemoryQuota, StoredValue, StoredValueFactory, StoredValueType};
pub use vbucket::{
    BgFetchItem, BgFetchType, FetchQueue, QueueOp, QueuedItem, VBucket, VBucketState,
    MAX_BG_FETCH_RETRY,
};
pub use vbucket_map::VBucketMap;
pub use warmup::WarmupStats;

pub use emberkv_core::{
    is_expired, next_cas, AddStatus, Blob, Clock, EmberError, EngineStatus, Item, ItemMetadata,
    MutationStatus, RelTime, Result, MAX_KEY_LEN, NO_ROWID,
};
