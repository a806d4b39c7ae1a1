// src/core/cluster/commands/addslots.rs

use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::{PeridotError, Reply};
use std::collections::HashSet;
use std::sync::Arc;

/// CLUSTER ADDSLOTS: claims unassigned slots for this node. The whole batch
/// is validated before the first assignment, so a bad slot changes nothing.
pub fn addslots(state: &Arc<ClusterState>, slots: &[u16]) -> Result<Reply, PeridotError> {
    let mut seen = HashSet::new();
    for &slot in slots {
        if !seen.insert(slot) {
            return Err(PeridotError::InvalidState(format!(
                "Slot {slot} specified multiple times"
            )));
        }
        if let Some(owner) = state.slots.owner(slot) {
            return Err(PeridotError::InvalidState(format!(
                "Slot {slot} is already busy (owned by {owner})"
            )));
        }
    }
    let my_id = state.my_id();
    for &slot in slots {
        state.add_slot(&my_id, slot)?;
    }
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
    Ok(Reply::Ok)
}

/// CLUSTER DELSLOTS: unassigns slots. Validated as a batch, like ADDSLOTS.
pub fn delslots(state: &Arc<ClusterState>, slots: &[u16]) -> Result<Reply, PeridotError> {
    let mut seen = HashSet::new();
    for &slot in slots {
        if !seen.insert(slot) {
            return Err(PeridotError::InvalidState(format!(
                "Slot {slot} specified multiple times"
            )));
        }
        if state.slots.owner(slot).is_none() {
            return Err(PeridotError::InvalidState(format!(
                "Slot {slot} is already unassigned"
            )));
        }
    }
    for &slot in slots {
        state.del_slot(slot)?;
    }
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
    Ok(Reply::Ok)
}

/// CLUSTER FLUSHSLOTS: drops every slot this node serves. Refused while any
/// of those slots still holds keys, to protect the key/slot invariant.
pub fn flushslots(state: &Arc<ClusterState>) -> Result<Reply, PeridotError> {
    let my_id = state.my_id();
    let owned: Vec<u16> = {
        let myself = state.myself();
        let me = myself.read();
        me.slots.iter().collect()
    };
    for &slot in &owned {
        if state.keyspace.count_keys_in_slot(slot) > 0 {
            return Err(PeridotError::InvalidState(
                "DB must be empty to perform CLUSTER FLUSHSLOTS".into(),
            ));
        }
    }
    state.del_node_slots(&my_id);
    state.slots.close_all_slots();
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
    Ok(Reply::Ok)
}
