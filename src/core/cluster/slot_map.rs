// src/core/cluster/slot_map.rs

//! Hash-slot primitives: the key-to-slot hash, the per-node slot bitmap, and
//! the slot ownership table with its migrating/importing pointers.

use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crc::{CRC_16_XMODEM, Crc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

/// The total number of hash slots in the cluster.
pub const CLUSTER_SLOTS: usize = 16384;

/// Size of a slot bitmap in bytes, as carried in every bus header.
pub const SLOT_BITMAP_BYTES: usize = CLUSTER_SLOTS / 8;

/// The CRC16 variant used for key hashing.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the hash slot for a key.
///
/// If the key contains a non-empty "hash tag" (a `{...}` substring), only the
/// tag content is hashed, so related keys can be forced into one slot.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        let end = start + 1 + end_offset;
        // An empty tag, e.g. "user:{}", falls back to the whole key.
        if end > start + 1 {
            return CRC16.checksum(&key[start + 1..end]) % (CLUSTER_SLOTS as u16);
        }
    }
    CRC16.checksum(key) % (CLUSTER_SLOTS as u16)
}

/// A 16384-bit slot set with a cached popcount, as owned by every node
/// record and carried in every bus message header.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: Box<[u8; SLOT_BITMAP_BYTES]>,
    count: u16,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0u8; SLOT_BITMAP_BYTES]),
            count: 0,
        }
    }

    /// Rebuilds a bitmap from raw wire bytes, recomputing the popcount.
    pub fn from_bytes(raw: &[u8; SLOT_BITMAP_BYTES]) -> Self {
        let count = raw.iter().map(|b| b.count_ones() as u16).sum();
        Self {
            bits: Box::new(*raw),
            count,
        }
    }

    pub fn as_bytes(&self) -> &[u8; SLOT_BITMAP_BYTES] {
        &self.bits
    }

    /// Sets the bit for `slot`, returning the previous value.
    pub fn set(&mut self, slot: u16) -> bool {
        let (byte, mask) = Self::locate(slot);
        let old = self.bits[byte] & mask != 0;
        if !old {
            self.bits[byte] |= mask;
            self.count += 1;
        }
        old
    }

    /// Clears the bit for `slot`, returning the previous value.
    pub fn clear(&mut self, slot: u16) -> bool {
        let (byte, mask) = Self::locate(slot);
        let old = self.bits[byte] & mask != 0;
        if old {
            self.bits[byte] &= !mask;
            self.count -= 1;
        }
        old
    }

    pub fn get(&self, slot: u16) -> bool {
        let (byte, mask) = Self::locate(slot);
        self.bits[byte] & mask != 0
    }

    /// Cached popcount; kept in lockstep with the bits by set/clear.
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
        self.count = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..CLUSTER_SLOTS as u16).filter(|&s| self.get(s))
    }

    /// Compacts the set into inclusive ranges, e.g. 0-4095 plus singletons,
    /// for the node-view snapshot and CLUSTER NODES output.
    pub fn ranges(&self) -> Vec<(u16, u16)> {
        let mut out = Vec::new();
        let mut run: Option<(u16, u16)> = None;
        for slot in self.iter() {
            match run {
                Some((start, end)) if end + 1 == slot => run = Some((start, slot)),
                Some(done) => {
                    out.push(done);
                    run = Some((slot, slot));
                }
                None => run = Some((slot, slot)),
            }
        }
        if let Some(done) = run {
            out.push(done);
        }
        out
    }

    fn locate(slot: u16) -> (usize, u8) {
        let slot = slot as usize;
        debug_assert!(slot < CLUSTER_SLOTS);
        (slot / 8, 1 << (slot % 8))
    }
}

impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotBitmap({} slots)", self.count)
    }
}

/// The three parallel per-slot views: the owner of each slot, plus the
/// migrating/importing pointers that are only meaningful on this node.
/// At most one of migrating/importing is ever set for a slot.
pub struct SlotTable {
    owners: Vec<RwLock<Option<String>>>,
    migrating: Mutex<BTreeMap<u16, String>>,
    importing: Mutex<BTreeMap<u16, String>>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            owners: (0..CLUSTER_SLOTS).map(|_| RwLock::new(None)).collect(),
            migrating: Mutex::new(BTreeMap::new()),
            importing: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn owner(&self, slot: u16) -> Option<String> {
        self.owners[slot as usize].read().clone()
    }

    pub fn set_owner(&self, slot: u16, owner: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.owners[slot as usize].write(), owner)
    }

    pub fn owned_by(&self, slot: u16, id: &str) -> bool {
        self.owners[slot as usize]
            .read()
            .as_deref()
            .is_some_and(|o| o == id)
    }

    pub fn assigned_count(&self) -> usize {
        self.owners.iter().filter(|o| o.read().is_some()).count()
    }

    pub fn migrating_to(&self, slot: u16) -> Option<String> {
        self.migrating.lock().get(&slot).cloned()
    }

    pub fn importing_from(&self, slot: u16) -> Option<String> {
        self.importing.lock().get(&slot).cloned()
    }

    pub fn set_migrating(&self, slot: u16, target: String) {
        self.migrating.lock().insert(slot, target);
    }

    pub fn set_importing(&self, slot: u16, source: String) {
        self.importing.lock().insert(slot, source);
    }

    pub fn clear_importing(&self, slot: u16) -> Option<String> {
        self.importing.lock().remove(&slot)
    }

    /// Clears any reshard pointer for the slot (SETSLOT STABLE).
    pub fn close_slot(&self, slot: u16) {
        self.migrating.lock().remove(&slot);
        self.importing.lock().remove(&slot);
    }

    /// Drops every migrating/importing pointer.
    pub fn close_all_slots(&self) {
        self.migrating.lock().clear();
        self.importing.lock().clear();
    }

    pub fn migrating_snapshot(&self) -> BTreeMap<u16, String> {
        self.migrating.lock().clone()
    }

    pub fn importing_snapshot(&self) -> BTreeMap<u16, String> {
        self.importing.lock().clone()
    }
}

/// Applies the slot claims gossiped by a master. This is the only routine
/// that moves slots between peers based on gossip; operator-driven imports
/// are left alone, and claims only win over absent owners or owners with an
/// older configuration epoch.
///
/// When a claim takes slots this node still holds keys for, those keys are
/// removed afterwards to restore the key/slot invariant, unless the claim
/// took the last slot of the master we were following, in which case this
/// node reconfigures itself as a replica of the sender.
pub(crate) fn update_slots_config(
    state: &ClusterState,
    sender_id: &str,
    sender_epoch: u64,
    claimed: &SlotBitmap,
    now: u64,
) {
    let my_id = state.my_id();
    let myself = state.myself();
    let cur_master = {
        let m = myself.read();
        if m.is_master() {
            my_id.clone()
        } else {
            m.replicaof.clone().unwrap_or_else(|| my_id.clone())
        }
    };
    if sender_id == my_id {
        return;
    }

    let mut dirty_slots: Vec<u16> = Vec::new();
    let mut lost_to_sender = false;
    let mut changed = false;

    for slot in claimed.iter() {
        // An operator-driven import is in progress; the reshard handshake
        // owns this slot until SETSLOT NODE completes it.
        if state.slots.importing_from(slot).is_some() {
            continue;
        }
        let owner = state.slots.owner(slot);
        if owner.as_deref() == Some(sender_id) {
            continue;
        }
        let owner_epoch = owner
            .as_deref()
            .and_then(|id| state.nodes.get(id))
            .map(|n| n.read().config_epoch);
        if let Some(epoch) = owner_epoch
            && epoch >= sender_epoch
        {
            continue;
        }

        if owner.as_deref() == Some(my_id.as_str())
            && state.keyspace.count_keys_in_slot(slot) > 0
        {
            dirty_slots.push(slot);
        }
        if owner.as_deref() == Some(cur_master.as_str()) {
            lost_to_sender = true;
        }
        state.assign_slot(slot, Some(sender_id));
        changed = true;
    }

    if !changed {
        return;
    }
    state.todo_set(TodoFlags::SAVE_CONFIG);

    let master_left_empty = state
        .nodes
        .get(&cur_master)
        .map(|n| n.read().slots.is_empty())
        .unwrap_or(true);

    if lost_to_sender && master_left_empty {
        warn!(
            "Configuration change detected. Reconfiguring myself as a replica of {sender_id}"
        );
        state.become_replica_of(sender_id, now);
    } else {
        for slot in dirty_slots {
            let deleted = state.keyspace.del_keys_in_slot(slot);
            info!("Deleted {deleted} keys from lost slot {slot}");
        }
    }
}

/// After ingesting a sender's slot claims, detect the opposite staleness:
/// slots the sender claims that we know belong to a node with a greater
/// configuration epoch. Returns that owner so the caller can send an UPDATE
/// back and let the sender fix itself.
pub(crate) fn find_stale_claim(
    state: &ClusterState,
    claimed: &SlotBitmap,
    sender_epoch: u64,
) -> Option<String> {
    for slot in claimed.iter() {
        let Some(owner_id) = state.slots.owner(slot) else {
            continue;
        };
        let Some(owner) = state.nodes.get(&owner_id) else {
            continue;
        };
        let owner = owner.read();
        if owner.config_epoch > sender_epoch && !owner.flags.contains(NodeFlags::HANDSHAKE) {
            return Some(owner_id);
        }
    }
    None
}

/// Counts master nodes currently serving at least one slot. This is the
/// cluster size used by every quorum computation.
pub(crate) fn cluster_size(state: &ClusterState) -> usize {
    state
        .nodes
        .snapshot()
        .iter()
        .filter(|n| {
            let n = n.read();
            n.is_master() && !n.slots.is_empty()
        })
        .count()
}

/// Reachable portion of [`cluster_size`]: masters serving slots that are
/// neither FAIL nor PFAIL from this node's point of view.
pub(crate) fn reachable_masters(state: &ClusterState) -> usize {
    state
        .nodes
        .snapshot()
        .iter()
        .filter(|n| {
            let n = n.read();
            n.is_master() && !n.slots.is_empty() && !n.is_failing()
        })
        .count()
}
