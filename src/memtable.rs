//! In-memory sorted write buffer (spec §3, §4.3).
//!
//! Spec §4.3 names a skip list (max-level 12, probability 0.25) as the
//! reference design but leaves the concrete structure to implementers.
//! `kamil-kielbasa-aeternusdb`'s dependency on the `crossbeam` family points
//! this corpus at that ecosystem for concurrent structures; `SkipMap` from
//! `crossbeam-skiplist` *is* that skip list, lock-free and safe, so there is
//! no reason to hand-roll one with raw pointers the way
//! `examples/original_source/libtidesdb.h`'s `SkipList` does.

use crate::codec::TOMBSTONE;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A value stored in the memtable, tagged so tombstones round-trip through
/// `get` without the caller re-inspecting the raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemtableValue {
    pub value: Vec<u8>,
    pub is_tombstone: bool,
}

impl MemtableValue {
    pub fn put(value: Vec<u8>) -> Self {
        let is_tombstone = value == TOMBSTONE;
        Self { value, is_tombstone }
    }

    pub fn tombstone() -> Self {
        Self {
            value: TOMBSTONE.to_vec(),
            is_tombstone: true,
        }
    }
}

/// Concurrent sorted key→value buffer of pending writes.
pub struct Memtable {
    map: SkipMap<Vec<u8>, MemtableValue>,
    // `SkipMap` has no O(1) length; cache the live-entry count ourselves so
    // `should_flush` doesn't need a full traversal on every write.
    len: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Upserts `key` to `value`. Returns `true` if the key was not
    /// previously present.
    ///
    /// Uses `compare_insert` rather than a separate `get` + `insert` so the
    /// presence check and the write happen as one atomic step against the
    /// lock-free skip list: `cmp` only runs when a racing insert already
    /// landed an entry for this key, so two threads racing on a brand-new
    /// key can never both see "new" and double-count `len` (spec §4.3).
    pub fn insert(&self, key: Vec<u8>, value: MemtableValue) -> bool {
        let mut is_new = true;
        self.map.compare_insert(key, value, |_existing| {
            is_new = false;
            true
        });
        if is_new {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    pub fn get(&self, key: &[u8]) -> Option<MemtableValue> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Removes `key` outright. Used only by transaction rollback (spec
    /// §4.3): a user-initiated delete goes through the engine as a
    /// Put-tombstone, never this method.
    pub fn delete(&self, key: &[u8]) -> bool {
        if let Some(entry) = self.map.remove(key) {
            drop(entry);
            self.len.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Invokes `f(key, value)` for every live entry in ascending key order.
    pub fn traverse(&self, mut f: impl FnMut(&[u8], &MemtableValue)) {
        for entry in self.map.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.map.clear();
        self.len.store(0, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
