// src/core/cluster/commands/keyslot.rs

use crate::core::cluster::slot_map::key_hash_slot;
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use bytes::Bytes;
use std::sync::Arc;

/// CLUSTER KEYSLOT: the hash slot a key maps to, hash tag included.
pub fn keyslot(key: &Bytes) -> Result<Reply, PeridotError> {
    Ok(Reply::Int(key_hash_slot(key) as i64))
}

/// CLUSTER COUNTKEYSINSLOT.
pub fn countkeysinslot(state: &Arc<ClusterState>, slot: u16) -> Result<Reply, PeridotError> {
    Ok(Reply::Int(state.keyspace.count_keys_in_slot(slot) as i64))
}

/// CLUSTER GETKEYSINSLOT.
pub fn getkeysinslot(
    state: &Arc<ClusterState>,
    slot: u16,
    count: usize,
) -> Result<Reply, PeridotError> {
    let keys = state
        .keyspace
        .get_keys_in_slot(slot, count)
        .into_iter()
        .map(Reply::Bulk)
        .collect();
    Ok(Reply::Array(keys))
}
