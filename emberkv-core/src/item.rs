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

//! The wire-level item record and its shared value blob.
//!
//! A [`Blob`] is immutable once built and reference-counted, so a value
//! fetched once from the backend can be handed to any number of waiting
//! clients without copies and without a designated owner for disposal.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::time::RelTime;

/// Maximum key length accepted by the engine.
pub const MAX_KEY_LEN: usize = 255;

/// Rowid value for an item the backend has never seen.
pub const NO_ROWID: i64 = -1;

static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh, process-unique CAS value.
pub fn next_cas() -> u64 {
    CAS_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Reference-counted immutable value bytes.
#[derive(Clone)]
pub struct Blob(Arc<[u8]>);

impl Blob {
    pub fn from_slice(data: &[u8]) -> Self {
        Blob(Arc::from(data))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when both handles point at the same allocation.
    pub fn ptr_eq(a: &Blob, b: &Blob) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl Deref for Blob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self {
        Blob(Arc::from(v))
    }
}

impl From<&[u8]> for Blob {
    fn from(v: &[u8]) -> Self {
        Blob::from_slice(v)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

/// Metadata carried alongside a value, without the value itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    pub cas: u64,
    pub seqno: u64,
    pub flags: u32,
    pub exptime: RelTime,
}

/// A complete key/value record as it crosses the engine boundary.
#[derive(Debug, Clone)]
pub struct Item {
    key: Box<[u8]>,
    value: Blob,
    /// Opaque client flags, stored and returned verbatim.
    pub flags: u32,
    /// Absolute expiry in engine-relative seconds; 0 means never.
    pub exptime: RelTime,
    /// Version stamp; 0 means the item has never been stored.
    pub cas: u64,
    /// Backend row identifier; [`NO_ROWID`] until first persisted.
    pub rowid: i64,
    /// Owning partition.
    pub vbucket: u16,
}

impl Item {
    /// Build a fresh item with no CAS and no backend identity.
    ///
    /// Keys longer than [`MAX_KEY_LEN`] are a front-end protocol violation
    /// and abort in development builds.
    pub fn new(key: &[u8], value: impl Into<Blob>, flags: u32, exptime: RelTime, vbucket: u16) -> Self {
        assert!(key.len() <= MAX_KEY_LEN, "key exceeds {} bytes", MAX_KEY_LEN);
        Item {
            key: Box::from(key),
            value: value.into(),
            flags,
            exptime,
            cas: 0,
            rowid: NO_ROWID,
            vbucket,
        }
    }

    /// Like [`Item::new`] but with an externally supplied CAS, for
    /// replication and meta-aware paths.
    pub fn with_cas(
        key: &[u8],
        value: impl Into<Blob>,
        flags: u32,
        exptime: RelTime,
        cas: u64,
        vbucket: u16,
    ) -> Self {
        let mut item = Item::new(key, value, flags, exptime, vbucket);
        item.cas = cas;
        item
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &Blob {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<Blob>) {
        self.value = value.into();
    }

    /// Stamp a freshly minted CAS onto this item.
    pub fn mint_cas(&mut self) {
        self.cas = next_cas();
    }

    pub fn has_rowid(&self) -> bool {
        self.rowid > NO_ROWID
    }

    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            cas: self.cas,
            seqno: 0,
            flags: self.flags,
            exptime: self.exptime,
        }
    }

    /// Bytes this item accounts for on the wire: key plus value.
    pub fn payload_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_mint_is_unique_and_nonzero() {
        let a = next_cas();
        let b = next_cas();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_item_starts_unversioned() {
        let item = Item::new(b"k", b"v".as_slice(), 7, 0, 3);
        assert_eq!(item.cas, 0);
        assert_eq!(item.rowid, NO_ROWID);
        assert!(!item.has_rowid());
        assert_eq!(item.vbucket, 3);
        assert_eq!(item.payload_size(), 2);
    }

    #[test]
    fn test_mint_cas_changes_version() {
        let mut item = Item::new(b"k", b"v".as_slice(), 0, 0, 0);
        item.mint_cas();
        let first = item.cas;
        item.mint_cas();
        assert_ne!(first, 0);
        assert_ne!(first, item.cas);
    }

    #[test]
    fn test_blob_sharing() {
        let blob = Blob::from_slice(b"shared");
        let other = blob.clone();
        assert!(Blob::ptr_eq(&blob, &other));
        assert_eq!(&*other, b"shared");
    }

    #[test]
    #[should_panic]
    fn test_oversized_key_rejected() {
        let key = vec![b'x'; MAX_KEY_LEN + 1];
        let _ = Item::new(&key, b"v".as_slice(), 0, 0, 0);
    }
}
