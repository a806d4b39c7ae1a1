// src/core/cluster/commands/setslot.rs

use super::SetSlotOp;
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::{PeridotError, Reply};
use std::sync::Arc;
use tracing::info;

/// CLUSTER SETSLOT: the operator-driven reshard handshake. MIGRATING marks a
/// slot we own as moving to a target; IMPORTING marks a foreign slot as
/// moving to us; NODE finalizes the transfer; STABLE clears either pointer.
pub fn execute(state: &Arc<ClusterState>, slot: u16, op: &SetSlotOp) -> Result<Reply, PeridotError> {
    let my_id = state.my_id();
    match op {
        SetSlotOp::Migrating(target_id) => {
            if !state.slots.owned_by(slot, &my_id) {
                return Err(PeridotError::InvalidState(format!(
                    "I'm not the owner of hash slot {slot}"
                )));
            }
            if state.slots.importing_from(slot).is_some() {
                return Err(PeridotError::InvalidState(format!(
                    "Slot {slot} is already being imported"
                )));
            }
            let target = state
                .nodes
                .get(target_id)
                .ok_or_else(|| PeridotError::UnknownNode(target_id.clone()))?;
            if !target.read().is_master() || *target_id == my_id {
                return Err(PeridotError::InvalidState(
                    "Target of MIGRATING must be another master".into(),
                ));
            }
            state.slots.set_migrating(slot, target_id.clone());
        }
        SetSlotOp::Importing(source_id) => {
            if state.slots.owned_by(slot, &my_id) {
                return Err(PeridotError::InvalidState(format!(
                    "I'm already the owner of hash slot {slot}"
                )));
            }
            if state.slots.migrating_to(slot).is_some() {
                return Err(PeridotError::InvalidState(format!(
                    "Slot {slot} is already being migrated"
                )));
            }
            let source = state
                .nodes
                .get(source_id)
                .ok_or_else(|| PeridotError::UnknownNode(source_id.clone()))?;
            if !source.read().is_master() || *source_id == my_id {
                return Err(PeridotError::InvalidState(
                    "Source of IMPORTING must be another master".into(),
                ));
            }
            state.slots.set_importing(slot, source_id.clone());
        }
        SetSlotOp::Stable => {
            state.slots.close_slot(slot);
        }
        SetSlotOp::Node(new_owner_id) => {
            let owner = state.slots.owner(slot);
            if !state.nodes.contains(new_owner_id) {
                return Err(PeridotError::UnknownNode(new_owner_id.clone()));
            }
            // Handing a slot away while it still holds keys would break the
            // key/slot invariant.
            if owner.as_deref() == Some(my_id.as_str())
                && *new_owner_id != my_id
                && state.keyspace.count_keys_in_slot(slot) > 0
            {
                return Err(PeridotError::InvalidState(format!(
                    "Can't assign hashslot {slot}, it still holds keys locally"
                )));
            }
            if state.slots.migrating_to(slot).is_some()
                && owner.as_deref() == Some(my_id.as_str())
            {
                state.slots.close_slot(slot);
            }
            let was_importing = state.slots.clear_importing(slot).is_some();
            state.assign_slot(slot, Some(new_owner_id));
            if was_importing && *new_owner_id == my_id {
                // The reshard into this node completed: claim a fresh epoch
                // so the new ownership wins the gossip reconciliation.
                info!("Slot {slot} import finished, bumping configEpoch");
                state.bump_config_epoch();
            }
        }
    }
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
    Ok(Reply::Ok)
}
