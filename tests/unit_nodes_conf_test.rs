// tests/unit_nodes_conf_test.rs

//! Unit tests for the persisted node view: round trips, the zero-byte
//! first-run sentinel, in-place padding, and the single-writer lock.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use peridotdb::core::MemoryKeyspace;
use peridotdb::core::cluster::node::NodeFlags;
use peridotdb::core::cluster::state::ClusterState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;
use test_helpers::{add_master, add_replica, node_id, test_config};

fn persistent_config(dir: &TempDir, port: u16) -> peridotdb::config::Config {
    let mut config = test_config(port);
    config.cluster.config_file = dir
        .path()
        .join("nodes.conf")
        .to_string_lossy()
        .to_string();
    config
}

fn new_state(config: &peridotdb::config::Config) -> Arc<ClusterState> {
    ClusterState::new(config, Arc::new(MemoryKeyspace::new())).unwrap()
}

#[tokio::test]
async fn test_zero_byte_file_triggers_first_run_identity() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(&dir, 7700);
    std::fs::write(&config.cluster.config_file, b"").unwrap();

    let state = new_state(&config);
    let my_id = state.my_id();
    assert_eq!(my_id.len(), 40);
    assert!(my_id.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(state.myself().read().is_master());

    // The fresh view is written out right away.
    let content = std::fs::read_to_string(&config.cluster.config_file).unwrap();
    assert!(content.contains(&my_id));
    assert!(content.contains("vars currentEpoch 0 lastVoteEpoch 0"));
}

#[tokio::test]
async fn test_persist_reload_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(&dir, 7700);

    let state = new_state(&config);
    let my_id = state.my_id();
    for slot in [0, 1, 2, 3, 42] {
        state.add_slot(&my_id, slot).unwrap();
    }
    let master_b = node_id('b');
    add_master(&state, &master_b, 7801, 11, &[5000, 5001]);
    {
        let node = state.nodes.get(&master_b).unwrap();
        node.write().flags.insert(NodeFlags::FAIL);
    }
    add_replica(&state, &node_id('c'), &master_b, 7802);
    state.slots.set_migrating(42, master_b.clone());
    state.slots.set_importing(9000, master_b.clone());
    state.current_epoch.store(17, Ordering::Relaxed);
    state.last_vote_epoch.store(12, Ordering::Relaxed);
    state.save_config(true).unwrap();
    drop(state); // releases the lock

    let reloaded = new_state(&config);
    assert_eq!(reloaded.my_id(), my_id);
    assert_eq!(reloaded.nodes.len(), 3);
    assert_eq!(reloaded.current_epoch.load(Ordering::Relaxed), 17);
    assert_eq!(reloaded.last_vote_epoch.load(Ordering::Relaxed), 12);

    let me = reloaded.myself();
    assert_eq!(me.read().slots.count(), 5);
    assert!(me.read().slots.get(42));

    let b = reloaded.nodes.get(&master_b).unwrap();
    {
        let b = b.read();
        assert!(b.is_master());
        assert!(b.flags.contains(NodeFlags::FAIL));
        assert_eq!(b.config_epoch, 11);
        assert!(b.slots.get(5000) && b.slots.get(5001));
    }
    assert_eq!(reloaded.slots.owner(5000).as_deref(), Some(master_b.as_str()));
    assert_eq!(reloaded.slots.owner(0).as_deref(), Some(my_id.as_str()));
    assert_eq!(
        reloaded.slots.migrating_to(42).as_deref(),
        Some(master_b.as_str())
    );
    assert_eq!(
        reloaded.slots.importing_from(9000).as_deref(),
        Some(master_b.as_str())
    );

    let c = reloaded.nodes.get(&node_id('c')).unwrap();
    let c = c.read();
    assert!(c.is_replica());
    assert_eq!(c.replicaof.as_deref(), Some(master_b.as_str()));
}

#[tokio::test]
async fn test_shrinking_rewrite_stays_parseable() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(&dir, 7700);

    let state = new_state(&config);
    for fill in ['b', 'c', 'd', 'e'] {
        add_master(&state, &node_id(fill), 7800, 1, &[]);
    }
    state.save_config(true).unwrap();
    let long_len = std::fs::metadata(&config.cluster.config_file).unwrap().len();

    for fill in ['b', 'c', 'd', 'e'] {
        state.nodes.remove(&node_id(fill));
    }
    state.save_config(true).unwrap();
    let new_len = std::fs::metadata(&config.cluster.config_file).unwrap().len();
    // Padding keeps the file at its previous length; only newlines follow.
    assert_eq!(new_len, long_len);
    drop(state);

    let reloaded = new_state(&config);
    assert_eq!(reloaded.nodes.len(), 1);
}

#[tokio::test]
async fn test_the_file_lock_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(&dir, 7700);

    let _state = new_state(&config);
    let second = ClusterState::new(&config, Arc::new(MemoryKeyspace::new()));
    assert!(second.is_err(), "a second node must not share the view file");
}

#[tokio::test]
async fn test_malformed_snapshot_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config(&dir, 7700);
    std::fs::write(&config.cluster.config_file, "this is not a node line\n").unwrap();
    assert!(ClusterState::new(&config, Arc::new(MemoryKeyspace::new())).is_err());
}
