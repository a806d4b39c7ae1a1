// src/core/cluster/migration.rs

//! Replica migration: rebalances replicas so that no slot-serving master is
//! left orphaned, without ever dropping a master below the migration
//! barrier. Only the replica with the smallest identity among the best-
//! covered masters' replicas moves, so at most one migrates per round.

use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::state::ClusterState;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Runs on the tick, only while the cluster is healthy and this node is a
/// working replica.
pub fn replica_migration_cron(state: &Arc<ClusterState>, now: u64) {
    if !state.state_ok() {
        return;
    }
    let my_id = state.my_id();
    let my_master = {
        let myself = state.myself();
        let me = myself.read();
        if !me.is_replica() || me.is_failing() {
            return;
        }
        me.replicaof.clone()
    };
    let Some(my_master) = my_master else {
        return;
    };

    // One consistent snapshot of the master/replica topology.
    let mut ok_replicas: HashMap<String, usize> = HashMap::new();
    let mut masters: Vec<(String, u16, bool)> = Vec::new(); // (id, slots, had replicas)
    let mut replicas: Vec<(String, String)> = Vec::new(); // (id, master)
    for node in state.nodes.snapshot() {
        let n = node.read();
        if n.in_handshake() {
            continue;
        }
        if n.is_master() {
            masters.push((n.id.clone(), n.slots.count(), n.has_had_replicas));
            ok_replicas.entry(n.id.clone()).or_insert(0);
        } else if n.is_replica()
            && let Some(master_id) = &n.replicaof
        {
            if !n.flags.contains(NodeFlags::FAIL) {
                *ok_replicas.entry(master_id.clone()).or_insert(0) += 1;
                replicas.push((n.id.clone(), master_id.clone()));
            }
        }
    }

    // (i) Our master must retain more than the barrier after we leave.
    let my_master_ok = ok_replicas.get(&my_master).copied().unwrap_or(0);
    if my_master_ok == 0 || my_master_ok - 1 <= state.config.migration_barrier {
        return;
    }

    // (ii) An orphaned target: serves slots, has zero working replicas, and
    // historically had at least one (so never-replicated masters opt out).
    let mut target: Option<String> = None;
    for (id, slots, had_replicas) in &masters {
        if *slots > 0 && *had_replicas && ok_replicas.get(id).copied().unwrap_or(0) == 0 {
            match &target {
                Some(t) if t <= id => {}
                _ => target = Some(id.clone()),
            }
        }
    }
    let Some(target) = target else {
        return;
    };

    // (iii) Only the smallest identity among the replicas of the best-
    // covered masters migrates.
    let max_ok = ok_replicas.values().copied().max().unwrap_or(0);
    let candidate = replicas
        .iter()
        .filter(|(_, master_id)| ok_replicas.get(master_id).copied().unwrap_or(0) == max_ok)
        .map(|(id, _)| id.clone())
        .min();
    if candidate.as_deref() != Some(my_id.as_str()) {
        return;
    }

    info!("Migrating to orphaned master {target}");
    state.become_replica_of(&target, now);
}
