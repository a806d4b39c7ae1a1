// src/core/cluster/commands/nodes.rs

use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::persistence::format_node_line;
use crate::core::cluster::slot_map::CLUSTER_SLOTS;
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use std::sync::Arc;

/// CLUSTER NODES: one line per known node, in the same format the node-view
/// snapshot uses (minus the trailing vars line).
pub fn nodes(state: &Arc<ClusterState>) -> Result<Reply, PeridotError> {
    let mut out = String::new();
    for node in state.nodes.snapshot() {
        let n = node.read();
        out.push_str(&format_node_line(state, &n));
        out.push('\n');
    }
    Ok(Reply::bulk_from(out))
}

/// CLUSTER SLOTS: contiguous owner ranges with the master address first and
/// its working replicas after it.
pub fn slots(state: &Arc<ClusterState>) -> Result<Reply, PeridotError> {
    let mut entries = Vec::new();
    let mut run: Option<(u16, u16, String)> = None;
    for slot in 0..CLUSTER_SLOTS as u16 {
        let owner = state.slots.owner(slot);
        match (&mut run, owner) {
            (Some((_, end, id)), Some(owner_id)) if *id == owner_id && *end + 1 == slot => {
                *end = slot;
            }
            (current, owner) => {
                if let Some((start, end, id)) = current.take() {
                    entries.push(range_entry(state, start, end, &id));
                }
                *current = owner.map(|id| (slot, slot, id));
            }
        }
    }
    if let Some((start, end, id)) = run {
        entries.push(range_entry(state, start, end, &id));
    }
    Ok(Reply::Array(entries))
}

fn range_entry(state: &Arc<ClusterState>, start: u16, end: u16, owner_id: &str) -> Reply {
    let mut entry = vec![Reply::Int(start as i64), Reply::Int(end as i64)];
    if let Some(owner) = state.nodes.get(owner_id) {
        let o = owner.read();
        entry.push(node_entry(&o.ip, o.port, &o.id));
    }
    for replica in state.replicas_of(owner_id) {
        let r = replica.read();
        if !r.flags.contains(NodeFlags::FAIL) {
            entry.push(node_entry(&r.ip, r.port, &r.id));
        }
    }
    Reply::Array(entry)
}

fn node_entry(ip: &str, port: u16, id: &str) -> Reply {
    Reply::Array(vec![
        Reply::bulk_from(ip),
        Reply::Int(port as i64),
        Reply::bulk_from(id),
    ])
}
