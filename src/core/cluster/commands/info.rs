// src/core/cluster/commands/info.rs

use crate::core::cluster::failure;
use crate::core::cluster::gossip::now_ms;
use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::slot_map::CLUSTER_SLOTS;
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// CLUSTER INFO: the canonical human-readable summary block.
pub fn execute(state: &Arc<ClusterState>) -> Result<Reply, PeridotError> {
    let mut slots_ok = 0usize;
    let mut slots_pfail = 0usize;
    let mut slots_fail = 0usize;
    for slot in 0..CLUSTER_SLOTS as u16 {
        let Some(owner_id) = state.slots.owner(slot) else {
            continue;
        };
        let flags = state
            .nodes
            .get(&owner_id)
            .map(|n| n.read().flags)
            .unwrap_or(NodeFlags::FAIL);
        if flags.contains(NodeFlags::FAIL) {
            slots_fail += 1;
        } else if flags.contains(NodeFlags::PFAIL) {
            slots_pfail += 1;
        } else {
            slots_ok += 1;
        }
    }
    let assigned = slots_ok + slots_pfail + slots_fail;
    let my_epoch = {
        let myself = state.myself();
        let e = myself.read().config_epoch;
        e
    };
    let info = format!(
        "cluster_enabled:1\r\n\
         cluster_state:{}\r\n\
         cluster_slots_assigned:{assigned}\r\n\
         cluster_slots_ok:{slots_ok}\r\n\
         cluster_slots_pfail:{slots_pfail}\r\n\
         cluster_slots_fail:{slots_fail}\r\n\
         cluster_known_nodes:{}\r\n\
         cluster_size:{}\r\n\
         cluster_current_epoch:{}\r\n\
         cluster_my_epoch:{my_epoch}\r\n",
        if state.state_ok() { "ok" } else { "fail" },
        state.nodes.len(),
        state.cluster_size(),
        state.current_epoch.load(Ordering::Relaxed),
    );
    Ok(Reply::bulk_from(info))
}

/// CLUSTER COUNT-FAILURE-REPORTS: how many non-stale third-party reports we
/// hold about a node.
pub fn count_failure_reports(state: &Arc<ClusterState>, id: &str) -> Result<Reply, PeridotError> {
    let node = state
        .nodes
        .get(id)
        .ok_or_else(|| PeridotError::UnknownNode(id.to_string()))?;
    let count = failure::failure_report_count(state, &node, now_ms());
    Ok(Reply::Int(count as i64))
}
