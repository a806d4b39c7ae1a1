// src/core/cluster/commands/replicate.rs

use crate::core::cluster::gossip::now_ms;
use crate::core::cluster::persistence::format_node_line;
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use std::sync::Arc;

/// CLUSTER REPLICATE: turns this node into a replica of the given master.
/// A master may only be demoted this way while it serves no slots.
pub fn replicate(state: &Arc<ClusterState>, id: &str) -> Result<Reply, PeridotError> {
    let my_id = state.my_id();
    if id == my_id {
        return Err(PeridotError::InvalidState("Can't replicate myself".into()));
    }
    let target = state
        .nodes
        .get(id)
        .ok_or_else(|| PeridotError::UnknownNode(id.to_string()))?;
    if !target.read().is_master() {
        return Err(PeridotError::InvalidState(format!(
            "I can only replicate a master, not a replica ({id})"
        )));
    }
    {
        let myself = state.myself();
        let me = myself.read();
        if me.is_master() && !me.slots.is_empty() {
            return Err(PeridotError::InvalidState(
                "To set a master the node must be empty and without assigned slots".into(),
            ));
        }
    }
    state.become_replica_of(id, now_ms());
    Ok(Reply::Ok)
}

/// CLUSTER SLAVES: the replicas of a master, one description line each.
pub fn replicas(state: &Arc<ClusterState>, id: &str) -> Result<Reply, PeridotError> {
    let master = state
        .nodes
        .get(id)
        .ok_or_else(|| PeridotError::UnknownNode(id.to_string()))?;
    if !master.read().is_master() {
        return Err(PeridotError::InvalidState(format!(
            "The specified node is not a master ({id})"
        )));
    }
    let lines = state
        .replicas_of(id)
        .into_iter()
        .map(|replica| {
            let r = replica.read();
            Reply::bulk_from(format_node_line(state, &r))
        })
        .collect();
    Ok(Reply::Array(lines))
}
