// src/core/keyspace.rs

//! The collaborator interface toward the key-value engine this cluster core
//! is attached to. The engine itself (storage, expiry, replication streams)
//! lives outside this crate; the cluster core only needs the small surface
//! below to keep the key/slot invariant, drive reshards, and run failovers.

use crate::core::cluster::slot_map::key_hash_slot;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Operations the cluster core is allowed to perform against the attached
/// key-value engine. All methods must be cheap and non-blocking; they are
/// called from packet handlers and the cluster cron.
pub trait Keyspace: Send + Sync {
    /// Whether a live (non-expired) value exists for the key.
    fn key_exists(&self, key: &[u8]) -> bool;
    /// Number of keys currently stored in the given hash slot.
    fn count_keys_in_slot(&self, slot: u16) -> usize;
    /// Up to `max` keys of the given hash slot, in stable (sorted) order.
    fn get_keys_in_slot(&self, slot: u16, max: usize) -> Vec<Bytes>;
    /// Deletes every key in the slot, returning how many were removed.
    fn del_keys_in_slot(&self, slot: u16) -> usize;
    /// Drops the entire dataset.
    fn flush_db(&self);
    /// Points replication at a new master and starts a resync.
    fn replication_set_master(&self, host: &str, port: u16);
    /// Stops replicating; the engine becomes a standalone master.
    fn replication_unset_master(&self);
    /// The replication offset this engine has processed so far.
    fn replication_get_replica_offset(&self) -> u64;
    /// Suspends client write processing until the deadline (unix ms).
    fn pause_clients(&self, deadline_ms: u64);
}

/// A minimal in-memory implementation of [`Keyspace`] used by the bundled
/// node binary and the test suite. Keys are mirrored into a per-slot ordered
/// index so slot-scoped operations do not scan the whole map.
#[derive(Debug, Default)]
pub struct MemoryKeyspace {
    entries: DashMap<Bytes, Bytes>,
    index: Mutex<BTreeMap<u16, BTreeSet<Bytes>>>,
    repl_offset: AtomicU64,
    master: Mutex<Option<(String, u16)>>,
    paused_until: AtomicU64,
}

impl MemoryKeyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: Bytes, value: Bytes) {
        let slot = key_hash_slot(&key);
        self.index.lock().entry(slot).or_default().insert(key.clone());
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn remove(&self, key: &[u8]) -> bool {
        let Some((key, _)) = self.entries.remove(key) else {
            return false;
        };
        let slot = key_hash_slot(&key);
        let mut index = self.index.lock();
        if let Some(set) = index.get_mut(&slot) {
            set.remove(&key);
            if set.is_empty() {
                index.remove(&slot);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Test hook: the advertised replication offset.
    pub fn set_replica_offset(&self, offset: u64) {
        self.repl_offset.store(offset, Ordering::Relaxed);
    }

    pub fn current_master(&self) -> Option<(String, u16)> {
        self.master.lock().clone()
    }

    pub fn paused_until(&self) -> u64 {
        self.paused_until.load(Ordering::Relaxed)
    }
}

impl Keyspace for MemoryKeyspace {
    fn key_exists(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    fn count_keys_in_slot(&self, slot: u16) -> usize {
        self.index.lock().get(&slot).map_or(0, |s| s.len())
    }

    fn get_keys_in_slot(&self, slot: u16, max: usize) -> Vec<Bytes> {
        self.index
            .lock()
            .get(&slot)
            .map(|s| s.iter().take(max).cloned().collect())
            .unwrap_or_default()
    }

    fn del_keys_in_slot(&self, slot: u16) -> usize {
        let keys = {
            let mut index = self.index.lock();
            index.remove(&slot).unwrap_or_default()
        };
        let mut deleted = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                deleted += 1;
            }
        }
        deleted
    }

    fn flush_db(&self) {
        self.entries.clear();
        self.index.lock().clear();
    }

    fn replication_set_master(&self, host: &str, port: u16) {
        info!("Keyspace now replicating from {host}:{port}");
        *self.master.lock() = Some((host.to_string(), port));
    }

    fn replication_unset_master(&self) {
        info!("Keyspace replication detached; serving as master");
        *self.master.lock() = None;
    }

    fn replication_get_replica_offset(&self) -> u64 {
        self.repl_offset.load(Ordering::Relaxed)
    }

    fn pause_clients(&self, deadline_ms: u64) {
        self.paused_until.store(deadline_ms, Ordering::Relaxed);
    }
}
