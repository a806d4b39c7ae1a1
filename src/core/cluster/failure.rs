// src/core/cluster/failure.rs

//! PFAIL/FAIL transitions: locally-suspected failures from unanswered pings,
//! third-party failure reports carried by gossip, quorum promotion to FAIL,
//! and the rules for clearing FAIL once a node is reachable again.

use crate::core::cluster::gossip;
use crate::core::cluster::node::{ClusterNode, NodeFlags};
use crate::core::cluster::state::{ClusterState, TodoFlags};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A failure report goes stale after `node_timeout` times this multiplier.
pub const FAIL_REPORT_VALIDITY_MULT: u64 = 2;

/// A failing master with slots is rehabilitated on contact only after
/// `node_timeout` times this multiplier, giving its replicas time to act.
pub const FAIL_UNDO_TIME_MULT: u64 = 2;

/// Adds or refreshes a failure report about `node` from `reporter`.
pub fn add_failure_report(
    node: &Arc<RwLock<ClusterNode>>,
    reporter_id: &str,
    now: u64,
) {
    let mut n = node.write();
    if n.flags
        .intersects(NodeFlags::MYSELF | NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
    {
        return;
    }
    let refreshed = n
        .fail_reports
        .insert(reporter_id.to_string(), now)
        .is_some();
    if !refreshed {
        debug!("Failure report for {} from {}", n.id, reporter_id);
    }
}

/// Removes the reporter's failure report, if any. Called when a reporter
/// gossips the node as healthy again.
pub fn remove_failure_report(node: &Arc<RwLock<ClusterNode>>, reporter_id: &str) {
    node.write().fail_reports.remove(reporter_id);
}

/// Sweeps stale reports and returns how many distinct peers still vouch for
/// the failure.
pub fn failure_report_count(state: &ClusterState, node: &Arc<RwLock<ClusterNode>>, now: u64) -> usize {
    let validity = state.config.node_timeout * FAIL_REPORT_VALIDITY_MULT;
    let mut n = node.write();
    n.fail_reports
        .retain(|_, reported_at| now.saturating_sub(*reported_at) <= validity);
    n.fail_reports.len()
}

/// Marks the node PFAIL when our own ping to it has been outstanding longer
/// than the node timeout.
pub fn check_pfail(state: &ClusterState, node: &Arc<RwLock<ClusterNode>>, now: u64) {
    let mut n = node.write();
    if n.flags.intersects(
        NodeFlags::MYSELF | NodeFlags::PFAIL | NodeFlags::FAIL | NodeFlags::HANDSHAKE,
    ) {
        return;
    }
    if n.ping_sent != 0 && now.saturating_sub(n.ping_sent) > state.config.node_timeout {
        info!("*** NODE {} possibly failing", n.id);
        n.flags.insert(NodeFlags::PFAIL);
        drop(n);
        state.todo_set(TodoFlags::UPDATE_STATE);
    }
}

/// Promotes PFAIL to FAIL once enough master peers agree: the count of
/// non-stale reports from distinct masters, plus ourselves when we are a
/// master, must reach the majority of slot-serving masters. On promotion the
/// FAIL is broadcast so other nodes can shortcut their own detection.
pub fn try_promote_to_fail(
    state: &Arc<ClusterState>,
    node: &Arc<RwLock<ClusterNode>>,
    now: u64,
) {
    {
        let n = node.read();
        if !n.flags.contains(NodeFlags::PFAIL) || n.flags.contains(NodeFlags::FAIL) {
            return;
        }
    }
    let mut agreeing = failure_report_count(state, node, now);
    if state.is_master() {
        agreeing += 1;
    }
    if agreeing < state.quorum() {
        return;
    }

    let node_id = {
        let mut n = node.write();
        n.flags.remove(NodeFlags::PFAIL);
        n.flags.insert(NodeFlags::FAIL);
        n.fail_time = now;
        n.id.clone()
    };
    warn!("Marking node {node_id} as failing (quorum reached).");
    state.todo_set(TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG);
    gossip::broadcast_fail(state, &node_id, now);
}

/// Applies a FAIL message received from a peer that already collected the
/// quorum, skipping our own detection.
pub fn handle_fail_message(state: &Arc<ClusterState>, sender_id: &str, failed_id: &str, now: u64) {
    if failed_id == state.my_id() {
        warn!("Ignoring FAIL message about myself from {sender_id}");
        return;
    }
    let Some(node) = state.nodes.get(failed_id) else {
        return;
    };
    {
        let mut n = node.write();
        if n.flags.contains(NodeFlags::FAIL) {
            return;
        }
        info!("FAIL message received from {sender_id} about {failed_id}");
        n.flags.remove(NodeFlags::PFAIL);
        n.flags.insert(NodeFlags::FAIL);
        n.fail_time = now;
    }
    state.todo_set(TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG);
}

/// A failed node answered us again. FAIL is cleared right away for replicas
/// and slotless masters; a master still claiming slots keeps the flag until
/// the undo window elapses, as it may still need to be failed over.
pub fn clear_fail_if_needed(state: &ClusterState, node: &Arc<RwLock<ClusterNode>>, now: u64) {
    let mut n = node.write();
    if !n.flags.contains(NodeFlags::FAIL) {
        return;
    }
    let undo_after = state.config.node_timeout * FAIL_UNDO_TIME_MULT;
    let clear = n.is_replica()
        || n.slots.is_empty()
        || (n.is_master() && now.saturating_sub(n.fail_time) > undo_after);
    if clear {
        info!("Clear FAIL state for node {}: is reachable again.", n.id);
        n.flags.remove(NodeFlags::FAIL);
        n.fail_time = 0;
        drop(n);
        state.todo_set(TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG);
    }
}
