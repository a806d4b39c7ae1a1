// src/core/cluster/commands/forget.rs

use crate::core::cluster::gossip::now_ms;
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::{PeridotError, Reply};
use std::sync::Arc;
use tracing::info;

/// CLUSTER FORGET: removes a node from the table and blacklists its identity
/// for sixty seconds so gossip cannot immediately resurrect it.
pub fn execute(state: &Arc<ClusterState>, id: &str) -> Result<Reply, PeridotError> {
    let my_id = state.my_id();
    if id == my_id {
        return Err(PeridotError::InvalidState(
            "I tried hard but I can't forget myself...".into(),
        ));
    }
    if !state.nodes.contains(id) {
        return Err(PeridotError::UnknownNode(id.to_string()));
    }
    if state.my_master_id().as_deref() == Some(id) {
        return Err(PeridotError::InvalidState(
            "Can't forget my master!".into(),
        ));
    }
    state.del_node_slots(id);
    state.nodes.remove(id);
    state.nodes.blacklist_add(id, now_ms());
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
    info!("Forgot node {id}");
    Ok(Reply::Ok)
}
