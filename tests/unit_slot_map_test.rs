// tests/unit_slot_map_test.rs

//! Unit tests for the slot bitmap, the ownership table, and the gossip-driven
//! slot reconfiguration rules.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use peridotdb::core::cluster::gossip::{self, LinkAction, PacketSource};
use peridotdb::core::cluster::message::{ClusterMessage, MsgPayload, MsgType};
use peridotdb::core::cluster::node::NodeFlags;
use peridotdb::core::Keyspace;
use peridotdb::core::cluster::slot_map::SlotBitmap;
use test_helpers::{add_master, bytes, ephemeral_node, fake_link, node_id, peer_header};

#[test]
fn test_bitmap_set_clear_and_cached_popcount() {
    let mut bitmap = SlotBitmap::new();
    assert_eq!(bitmap.count(), 0);
    assert!(!bitmap.set(100));
    assert!(bitmap.set(100), "second set reports the old bit");
    assert!(bitmap.set(16383) == false);
    assert_eq!(bitmap.count(), 2);
    assert!(bitmap.get(100));
    assert!(!bitmap.get(101));
    assert!(bitmap.clear(100));
    assert!(!bitmap.clear(100));
    assert_eq!(bitmap.count(), 1);

    let rebuilt = SlotBitmap::from_bytes(bitmap.as_bytes());
    assert_eq!(rebuilt.count(), 1);
    assert!(rebuilt.get(16383));
}

#[test]
fn test_bitmap_range_compaction() {
    let mut bitmap = SlotBitmap::new();
    for slot in [0, 1, 2, 3, 10, 4000, 4001] {
        bitmap.set(slot);
    }
    assert_eq!(bitmap.ranges(), vec![(0, 3), (10, 10), (4000, 4001)]);
}

#[tokio::test]
async fn test_add_and_del_slot_guard_ownership() {
    let (state, _keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();

    state.add_slot(&my_id, 7).unwrap();
    assert!(state.slots.owned_by(7, &my_id));
    assert!(state.myself().read().slots.get(7));

    // A busy slot cannot be claimed again.
    assert!(state.add_slot(&my_id, 7).is_err());

    state.del_slot(7).unwrap();
    assert!(state.slots.owner(7).is_none());
    assert!(!state.myself().read().slots.get(7));
    assert!(state.del_slot(7).is_err());
}

#[tokio::test]
async fn test_del_node_slots_returns_the_true_count() {
    let (state, _keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();
    for slot in [1, 2, 3] {
        state.add_slot(&my_id, slot).unwrap();
    }
    assert_eq!(state.del_node_slots(&my_id), 3);
    // Nothing left to clear the second time around.
    assert_eq!(state.del_node_slots(&my_id), 0);
}

/// Drives the gossip-based reconfiguration through a full PING packet from a
/// known master sender claiming the given slots.
fn claim_slots(
    state: &std::sync::Arc<peridotdb::core::cluster::ClusterState>,
    sender_id: &str,
    config_epoch: u64,
    claimed: &[u16],
) -> LinkAction {
    let (reply, _rx) = fake_link(99);
    let msg = ClusterMessage {
        header: peer_header(
            MsgType::Ping,
            sender_id,
            NodeFlags::MASTER,
            None,
            7801,
            config_epoch,
            config_epoch,
            claimed,
        ),
        payload: MsgPayload::Gossip(vec![]),
    };
    gossip::process_packet(
        state,
        msg,
        PacketSource {
            reply: &reply,
            peer_ip: None,
            link_node: None,
        },
        gossip::now_ms(),
    )
}

#[tokio::test]
async fn test_gossip_claims_take_unowned_slots() {
    let (state, _keyspace) = ephemeral_node(7700);
    let sender = node_id('b');
    add_master(&state, &sender, 7801, 0, &[]);

    claim_slots(&state, &sender, 1, &[100, 101]);
    assert_eq!(state.slots.owner(100).as_deref(), Some(sender.as_str()));
    assert_eq!(state.slots.owner(101).as_deref(), Some(sender.as_str()));
    let node = state.nodes.get(&sender).unwrap();
    assert_eq!(node.read().slots.count(), 2);
}

#[tokio::test]
async fn test_gossip_claims_respect_newer_owners() {
    let (state, _keyspace) = ephemeral_node(7700);
    let older = node_id('b');
    let newer = node_id('c');
    add_master(&state, &older, 7801, 2, &[]);
    add_master(&state, &newer, 7802, 9, &[200]);

    // The older epoch must not steal a slot from the newer claim.
    claim_slots(&state, &older, 2, &[200]);
    assert_eq!(state.slots.owner(200).as_deref(), Some(newer.as_str()));

    // A strictly newer epoch wins.
    claim_slots(&state, &older, 10, &[200]);
    assert_eq!(state.slots.owner(200).as_deref(), Some(older.as_str()));
}

#[tokio::test]
async fn test_gossip_claims_leave_importing_slots_alone() {
    let (state, _keyspace) = ephemeral_node(7700);
    let sender = node_id('b');
    add_master(&state, &sender, 7801, 0, &[]);
    state.slots.set_importing(300, node_id('c'));

    claim_slots(&state, &sender, 50, &[300]);
    assert!(state.slots.owner(300).is_none(), "operator import wins");
}

#[tokio::test]
async fn test_losing_a_dirty_slot_deletes_its_keys() {
    let (state, keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();
    let slot = peridotdb::core::cluster::key_hash_slot(b"tag");
    state.add_slot(&my_id, slot).unwrap();
    state.add_slot(&my_id, 1).unwrap(); // keep a second slot so we stay a master
    keyspace.insert(bytes("{tag}k1"), bytes("v"));
    keyspace.insert(bytes("{tag}k2"), bytes("v"));

    let sender = node_id('b');
    add_master(&state, &sender, 7801, 0, &[]);
    claim_slots(&state, &sender, 5, &[slot]);

    assert_eq!(state.slots.owner(slot).as_deref(), Some(sender.as_str()));
    assert_eq!(keyspace.count_keys_in_slot(slot), 0, "dirty keys removed");
    assert!(state.myself().read().is_master(), "still a master");
}

#[tokio::test]
async fn test_losing_the_last_slot_demotes_to_replica_of_the_sender() {
    let (state, keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();
    state.add_slot(&my_id, 400).unwrap();

    let sender = node_id('b');
    add_master(&state, &sender, 7801, 0, &[]);
    claim_slots(&state, &sender, 5, &[400]);

    let myself = state.myself();
    let me = myself.read();
    assert!(me.is_replica());
    assert_eq!(me.replicaof.as_deref(), Some(sender.as_str()));
    assert_eq!(
        keyspace.current_master(),
        Some(("127.0.0.1".to_string(), 7801))
    );
}

#[tokio::test]
async fn test_stale_claims_receive_an_update() {
    let (state, _keyspace) = ephemeral_node(7700);
    let owner = node_id('c');
    add_master(&state, &owner, 7802, 20, &[500]);
    let sender = node_id('b');
    add_master(&state, &sender, 7801, 0, &[]);

    let (reply, mut rx) = fake_link(7);
    let msg = ClusterMessage {
        header: peer_header(MsgType::Ping, &sender, NodeFlags::MASTER, None, 7801, 3, 3, &[500]),
        payload: MsgPayload::Gossip(vec![]),
    };
    gossip::process_packet(
        &state,
        msg,
        PacketSource {
            reply: &reply,
            peer_ip: None,
            link_node: None,
        },
        gossip::now_ms(),
    );

    // First reply is the PONG, then the UPDATE about the real owner.
    let mut saw_update = false;
    while let Ok(out) = rx.try_recv() {
        if let MsgPayload::Update {
            config_epoch,
            node_id: id,
            slots,
        } = out.payload
        {
            assert_eq!(config_epoch, 20);
            assert_eq!(id, owner);
            assert!(slots.get(500));
            saw_update = true;
        }
    }
    assert!(saw_update, "the stale sender must be told about the owner");
    // And the slot did not move.
    assert_eq!(state.slots.owner(500).as_deref(), Some(owner.as_str()));
}
