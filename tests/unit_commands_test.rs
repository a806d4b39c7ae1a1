// tests/unit_commands_test.rs

//! Unit tests for the CLUSTER command surface: slot administration, the
//! reshard handshake, node management, and the reset paths.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use peridotdb::core::cluster::commands::{
    self, ClusterSubcommand, SetSlotOp,
};
use peridotdb::core::cluster::gossip::now_ms;
use peridotdb::core::{PeridotError, Reply};
use std::sync::atomic::Ordering;
use test_helpers::{add_master, bytes, ephemeral_node, node_id};

fn run(
    state: &std::sync::Arc<peridotdb::core::cluster::ClusterState>,
    cmd: ClusterSubcommand,
) -> Result<Reply, PeridotError> {
    commands::execute(state, cmd)
}

#[tokio::test]
async fn test_addslots_and_delslots() {
    let (state, _keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();

    assert_eq!(
        run(&state, ClusterSubcommand::AddSlots(vec![0, 1, 2, 3])).unwrap(),
        Reply::Ok
    );
    for slot in 0..=3 {
        assert!(state.slots.owned_by(slot, &my_id));
    }

    // Busy slots fail as a batch: nothing in the request is applied.
    assert!(run(&state, ClusterSubcommand::AddSlots(vec![4, 1])).is_err());
    assert!(state.slots.owner(4).is_none());

    // Duplicates within one request are rejected.
    assert!(run(&state, ClusterSubcommand::AddSlots(vec![5, 5])).is_err());

    assert_eq!(
        run(&state, ClusterSubcommand::DelSlots(vec![0, 1])).unwrap(),
        Reply::Ok
    );
    assert!(state.slots.owner(0).is_none());
    assert!(run(&state, ClusterSubcommand::DelSlots(vec![0])).is_err());
}

#[tokio::test]
async fn test_flushslots_requires_an_empty_keyspace() {
    let (state, keyspace) = ephemeral_node(7700);
    let slot = peridotdb::core::cluster::key_hash_slot(b"k");
    run(&state, ClusterSubcommand::AddSlots(vec![slot])).unwrap();
    keyspace.insert(bytes("k"), bytes("v"));

    assert!(run(&state, ClusterSubcommand::FlushSlots).is_err());
    keyspace.remove(b"k");
    assert_eq!(run(&state, ClusterSubcommand::FlushSlots).unwrap(), Reply::Ok);
    assert!(state.slots.owner(slot).is_none());
}

#[tokio::test]
async fn test_setslot_reshard_handshake() {
    let (state, _keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();
    let peer = node_id('b');
    add_master(&state, &peer, 7801, 1, &[]);
    run(&state, ClusterSubcommand::AddSlots(vec![100])).unwrap();

    // MIGRATING requires ownership.
    assert!(
        run(
            &state,
            ClusterSubcommand::SetSlot {
                slot: 200,
                op: SetSlotOp::Migrating(peer.clone())
            }
        )
        .is_err()
    );
    run(
        &state,
        ClusterSubcommand::SetSlot {
            slot: 100,
            op: SetSlotOp::Migrating(peer.clone()),
        },
    )
    .unwrap();
    assert_eq!(state.slots.migrating_to(100).as_deref(), Some(peer.as_str()));

    // STABLE clears the pointer again.
    run(
        &state,
        ClusterSubcommand::SetSlot {
            slot: 100,
            op: SetSlotOp::Stable,
        },
    )
    .unwrap();
    assert!(state.slots.migrating_to(100).is_none());

    // IMPORTING is only legal for slots we do not own.
    assert!(
        run(
            &state,
            ClusterSubcommand::SetSlot {
                slot: 100,
                op: SetSlotOp::Importing(peer.clone())
            }
        )
        .is_err()
    );
    state.assign_slot(300, Some(&peer));
    run(
        &state,
        ClusterSubcommand::SetSlot {
            slot: 300,
            op: SetSlotOp::Importing(peer.clone()),
        },
    )
    .unwrap();

    // NODE finishes the import: ownership moves here and the configEpoch is
    // bumped so the new claim wins the gossip reconciliation.
    let epoch_before = {
        let myself = state.myself();
        let epoch = myself.read().config_epoch;
        epoch
    };
    run(
        &state,
        ClusterSubcommand::SetSlot {
            slot: 300,
            op: SetSlotOp::Node(my_id.clone()),
        },
    )
    .unwrap();
    assert!(state.slots.owned_by(300, &my_id));
    assert!(state.slots.importing_from(300).is_none());
    let epoch_after = {
        let myself = state.myself();
        let epoch = myself.read().config_epoch;
        epoch
    };
    assert!(epoch_after > epoch_before);
}

#[tokio::test]
async fn test_forget_blacklists_the_node() {
    let (state, _keyspace) = ephemeral_node(7700);
    let peer = node_id('b');
    add_master(&state, &peer, 7801, 1, &[9]);

    assert!(run(&state, ClusterSubcommand::Forget(state.my_id())).is_err());
    assert_eq!(run(&state, ClusterSubcommand::Forget(peer.clone())).unwrap(), Reply::Ok);
    assert!(!state.nodes.contains(&peer));
    assert!(state.nodes.blacklist_contains(&peer, now_ms()));
    assert!(state.slots.owner(9).is_none(), "its slots were released");

    assert!(
        run(&state, ClusterSubcommand::Forget(peer.clone())).is_err(),
        "forgetting an unknown node fails"
    );
}

#[tokio::test]
async fn test_a_replica_cannot_forget_its_master() {
    let (state, _keyspace) = ephemeral_node(7700);
    let master = node_id('b');
    add_master(&state, &master, 7801, 1, &[1]);
    state.become_replica_of(&master, now_ms());
    assert!(run(&state, ClusterSubcommand::Forget(master)).is_err());
}

#[tokio::test]
async fn test_set_config_epoch_is_bootstrap_only() {
    let (state, _keyspace) = ephemeral_node(7700);
    assert_eq!(
        run(&state, ClusterSubcommand::SetConfigEpoch(5)).unwrap(),
        Reply::Ok
    );
    {
        let myself = state.myself();
        assert_eq!(myself.read().config_epoch, 5);
    }
    assert_eq!(state.current_epoch.load(Ordering::Relaxed), 5);

    // A second assignment is refused: the epoch is no longer zero.
    assert!(run(&state, ClusterSubcommand::SetConfigEpoch(9)).is_err());

    // And so is any assignment once another node is known.
    let (state, _keyspace) = ephemeral_node(7700);
    add_master(&state, &node_id('b'), 7801, 1, &[]);
    assert!(run(&state, ClusterSubcommand::SetConfigEpoch(5)).is_err());
}

#[tokio::test]
async fn test_reset_soft_and_hard() {
    let (state, _keyspace) = ephemeral_node(7700);
    let old_id = state.my_id();
    add_master(&state, &node_id('b'), 7801, 4, &[7]);
    run(&state, ClusterSubcommand::AddSlots(vec![1, 2])).unwrap();
    state.current_epoch.store(9, Ordering::Relaxed);

    run(&state, ClusterSubcommand::Reset { hard: false }).unwrap();
    assert_eq!(state.nodes.len(), 1);
    assert!(state.slots.owner(1).is_none());
    assert!(state.slots.owner(7).is_none());
    assert_eq!(state.my_id(), old_id, "soft reset keeps the identity");
    assert_eq!(state.current_epoch.load(Ordering::Relaxed), 9);

    run(&state, ClusterSubcommand::Reset { hard: true }).unwrap();
    assert_ne!(state.my_id(), old_id, "hard reset renames the node");
    assert_eq!(state.current_epoch.load(Ordering::Relaxed), 0);
    assert!(state.myself().read().is_master());
}

#[tokio::test]
async fn test_reset_refuses_a_master_with_keys() {
    let (state, keyspace) = ephemeral_node(7700);
    let slot = peridotdb::core::cluster::key_hash_slot(b"k");
    run(&state, ClusterSubcommand::AddSlots(vec![slot])).unwrap();
    keyspace.insert(bytes("k"), bytes("v"));
    assert!(run(&state, ClusterSubcommand::Reset { hard: false }).is_err());
}

#[tokio::test]
async fn test_nodes_and_slots_output() {
    let (state, _keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();
    run(&state, ClusterSubcommand::AddSlots(vec![0, 1, 2, 100])).unwrap();

    let Reply::Bulk(raw) = run(&state, ClusterSubcommand::Nodes).unwrap() else {
        panic!("CLUSTER NODES returns a bulk string");
    };
    let text = String::from_utf8(raw.to_vec()).unwrap();
    assert!(text.contains(&my_id));
    assert!(text.contains("myself,master"));
    assert!(text.contains("0-2"), "slot ranges are compacted: {text}");
    assert!(text.contains(" 100"));

    let Reply::Array(ranges) = run(&state, ClusterSubcommand::Slots).unwrap() else {
        panic!("CLUSTER SLOTS returns an array");
    };
    assert_eq!(ranges.len(), 2, "0-2 and 100-100");
    let Reply::Array(first) = &ranges[0] else {
        panic!("each range is an array");
    };
    assert_eq!(first[0], Reply::Int(0));
    assert_eq!(first[1], Reply::Int(2));
}

#[tokio::test]
async fn test_parse_rejects_unknown_subcommands() {
    let err = ClusterSubcommand::parse(&[bytes("frobnicate")]).unwrap_err();
    assert!(matches!(err, PeridotError::InvalidRequest(_)));
    assert!(ClusterSubcommand::parse(&[]).is_err());
    assert!(ClusterSubcommand::parse(&[bytes("meet"), bytes("127.0.0.1")]).is_err());
}

#[tokio::test]
async fn test_meet_rejects_port_zero() {
    let (state, _keyspace) = ephemeral_node(7700);
    assert!(
        run(
            &state,
            ClusterSubcommand::Meet {
                host: "127.0.0.1".into(),
                port: 0
            }
        )
        .is_err()
    );
    assert_eq!(
        run(
            &state,
            ClusterSubcommand::Meet {
                host: "10.0.0.2".into(),
                port: 6379
            }
        )
        .unwrap(),
        Reply::Ok
    );
    assert!(state.nodes.find_by_bus_addr("10.0.0.2", 16379).is_some());
}
