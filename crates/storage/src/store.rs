//! Thread-safe, sharded in-memory key-value store with LWW versioning.
//!
//! Keys are spread over a fixed array of shards by their 64-bit hash;
//! each shard holds a map behind its own readers-writer lock, so readers
//! never contend with each other and writers only contend per shard.
//! No I/O happens under a shard lock.

use dkvs_common::hash::hash64;
use dkvs_common::Version;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Fixed shard count. Must stay stable only within a process — shard
/// selection is not part of any on-disk format.
const NUM_SHARDS: usize = 32;

/// A single stored value. Tombstoned entries keep their version so a
/// later SET with an older version cannot resurrect the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub is_tombstone: bool,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Sharded LWW store.
#[derive(Debug)]
pub struct Store {
    shards: Vec<RwLock<HashMap<Vec<u8>, ValueEntry>>>,
}

impl Store {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Vec<u8>, ValueEntry>> {
        let idx = (hash64(key) % NUM_SHARDS as u64) as usize;
        &self.shards[idx]
    }

    /// Read a key. Missing keys and tombstones both come back as `None`;
    /// value and version are captured atomically under the shard lock.
    pub fn get(&self, key: &[u8]) -> Option<(Vec<u8>, Version)> {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(entry) if !entry.is_tombstone => Some((entry.value.clone(), entry.version)),
            _ => None,
        }
    }

    /// Insert or update a key. Applied only if the key is absent or
    /// `version` is strictly newer than the stored version. Returns
    /// whether the write was applied.
    pub fn set(&self, key: &[u8], value: Vec<u8>, version: Version) -> bool {
        let mut shard = self.shard(key).write();
        if let Some(existing) = shard.get(key) {
            if !version.is_newer_than(&existing.version) {
                return false;
            }
        }
        shard.insert(
            key.to_vec(),
            ValueEntry {
                is_tombstone: false,
                value,
                version,
            },
        );
        true
    }

    /// Delete a key by writing a tombstone, under the same LWW guard as
    /// [`set`](Store::set). Returns whether the tombstone was applied.
    pub fn del(&self, key: &[u8], version: Version) -> bool {
        let mut shard = self.shard(key).write();
        if let Some(existing) = shard.get(key) {
            if !version.is_newer_than(&existing.version) {
                return false;
            }
        }
        shard.insert(
            key.to_vec(),
            ValueEntry {
                is_tombstone: true,
                value: Vec::new(),
                version,
            },
        );
        true
    }

    /// Every entry in the store, tombstones included.
    ///
    /// Each shard is read atomically but shards are visited in turn, so
    /// the result is not a cross-shard point-in-time snapshot. That is
    /// sufficient for snapshotting: any write racing the walk carries a
    /// version and will be reconciled by LWW on load.
    pub fn all_entries(&self) -> Vec<(Vec<u8>, ValueEntry)> {
        let mut result = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            for (k, v) in guard.iter() {
                result.push((k.clone(), v.clone()));
            }
        }
        result
    }

    /// Number of keys present, tombstones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
