// tests/unit_migration_test.rs

//! Unit tests for replica migration: rebalancing replicas toward orphaned
//! masters without dropping any master below the migration barrier.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use peridotdb::core::MemoryKeyspace;
use peridotdb::core::cluster::gossip::now_ms;
use peridotdb::core::cluster::{ClusterState, migration};
use std::sync::Arc;
use test_helpers::{add_master, add_replica, ephemeral_node, node_id, test_config};

/// Myself replicates master `b` (slot 1); master `c` (slot 2) serves slots
/// with no replicas left. `orphan_history` marks whether `c` ever had one.
fn assemble(state: &Arc<ClusterState>, orphan_history: bool) {
    let master = node_id('b');
    add_master(state, &master, 7801, 1, &[1]);
    let orphan = add_master(state, &node_id('c'), 7802, 2, &[2]);
    orphan.write().has_had_replicas = orphan_history;
    state.become_replica_of(&master, now_ms());
}

/// Migration only runs while the aggregate state is OK; the evaluator is
/// throttled and applies the rejoin delay, so jump sufficiently far ahead.
fn settle(state: &Arc<ClusterState>) {
    state.update_state(now_ms() + 10_000);
    assert!(state.state_ok(), "fixture expected an OK cluster state");
}

#[tokio::test]
async fn test_migrates_to_an_orphaned_master() {
    let (state, keyspace) = ephemeral_node(7700);
    assemble(&state, true);
    // A spare replica (greater identity) keeps `b` above the barrier and
    // leaves the move to us.
    add_replica(&state, &node_id('f'), &node_id('b'), 7803);
    settle(&state);

    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('c').as_str()));
    assert_eq!(
        keyspace.current_master(),
        Some(("127.0.0.1".to_string(), 7802))
    );
}

#[tokio::test]
async fn test_holds_back_when_the_master_would_drop_below_the_barrier() {
    let (state, keyspace) = ephemeral_node(7700);
    assemble(&state, true);
    settle(&state);

    // We are b's only working replica; leaving would just move the orphan.
    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('b').as_str()));
    assert_eq!(
        keyspace.current_master(),
        Some(("127.0.0.1".to_string(), 7801))
    );
}

#[tokio::test]
async fn test_a_raised_barrier_pins_spare_replicas_too() {
    let mut config = test_config(7700);
    config.cluster.migration_barrier = 1;
    let state = ClusterState::new(&config, Arc::new(MemoryKeyspace::new())).unwrap();
    assemble(&state, true);
    add_replica(&state, &node_id('f'), &node_id('b'), 7803);
    settle(&state);

    // Two working replicas, but `b` must retain more than one after any
    // departure, so nobody moves.
    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('b').as_str()));
}

#[tokio::test]
async fn test_never_replicated_masters_are_not_migration_targets() {
    let (state, _keyspace) = ephemeral_node(7700);
    assemble(&state, false);
    add_replica(&state, &node_id('f'), &node_id('b'), 7803);
    settle(&state);

    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('b').as_str()));

    // The same topology migrates once the orphan is known to have had a
    // replica before.
    state
        .nodes
        .get(&node_id('c'))
        .unwrap()
        .write()
        .has_had_replicas = true;
    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('c').as_str()));
}

#[tokio::test]
async fn test_only_the_smallest_identity_replica_migrates() {
    let (state, _keyspace) = ephemeral_node(7700);
    assemble(&state, true);
    // The all-zero identity sorts below any random one, so the tie-break
    // among the best-covered master's replicas picks the spare, not us.
    add_replica(&state, &node_id('0'), &node_id('b'), 7803);
    settle(&state);

    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('b').as_str()));
}

#[tokio::test]
async fn test_migration_waits_for_an_ok_cluster() {
    let (state, _keyspace) = ephemeral_node(7700);
    assemble(&state, true);
    add_replica(&state, &node_id('f'), &node_id('b'), 7803);
    // No state settlement: the aggregate state is still FAIL.

    migration::replica_migration_cron(&state, now_ms());
    assert_eq!(state.my_master_id().as_deref(), Some(node_id('b').as_str()));
}
