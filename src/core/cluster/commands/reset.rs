// src/core/cluster/commands/reset.rs

use crate::core::cluster::node::random_node_id;
use crate::core::cluster::slot_map::CLUSTER_SLOTS;
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::{PeridotError, Reply};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// CLUSTER SET-CONFIG-EPOCH: a bootstrap-only escape hatch to seed distinct
/// epochs before the cluster is wired together. Legal only while the table
/// holds nothing but this node and its epoch is still zero.
pub fn set_config_epoch(state: &Arc<ClusterState>, epoch: u64) -> Result<Reply, PeridotError> {
    if state.nodes.len() != 1 {
        return Err(PeridotError::InvalidState(
            "The user can assign a config epoch only when the node does not know any other node"
                .into(),
        ));
    }
    let myself = state.myself();
    if myself.read().config_epoch != 0 {
        return Err(PeridotError::InvalidState(
            "Node config epoch is already non-zero".into(),
        ));
    }
    myself.write().config_epoch = epoch;
    state.current_epoch.fetch_max(epoch, Ordering::Relaxed);
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
    info!("Config epoch set to {epoch} via CLUSTER SET-CONFIG-EPOCH");
    Ok(Reply::Ok)
}

/// CLUSTER RESET [SOFT|HARD]: forget every peer and every slot assignment.
/// HARD additionally zeroes the epochs and regenerates the node identity.
/// A master still holding keys must be flushed first.
pub fn execute(state: &Arc<ClusterState>, hard: bool) -> Result<Reply, PeridotError> {
    let my_id = state.my_id();
    {
        let myself = state.myself();
        let me = myself.read();
        if me.is_master() {
            for slot in me.slots.iter() {
                if state.keyspace.count_keys_in_slot(slot) > 0 {
                    return Err(PeridotError::InvalidState(
                        "CLUSTER RESET can't be called with master nodes containing keys".into(),
                    ));
                }
            }
        }
    }

    // A replica turns back into an empty master first.
    if !state.is_master() {
        state.keyspace.flush_db();
        state.become_master();
    }

    for slot in 0..CLUSTER_SLOTS as u16 {
        state.slots.set_owner(slot, None);
    }
    state.slots.close_all_slots();
    state.myself().write().slots.clear_all();

    for id in state.nodes.ids() {
        if id != my_id {
            state.nodes.remove(&id);
        }
    }
    state.election.lock().reset();
    state.manual_failover.lock().reset();

    if hard {
        state.current_epoch.store(0, Ordering::Relaxed);
        state.last_vote_epoch.store(0, Ordering::Relaxed);
        let new_id = random_node_id();
        {
            let myself = state.myself();
            let mut me = myself.write();
            me.config_epoch = 0;
        }
        state.nodes.rename(&my_id, &new_id);
        state.set_my_id(new_id.clone());
        warn!("Hard reset: node {my_id} is now {new_id}");
    } else {
        info!("Soft reset performed");
    }
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
    Ok(Reply::Ok)
}
