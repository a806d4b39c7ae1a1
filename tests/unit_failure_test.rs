// tests/unit_failure_test.rs

//! Unit tests for the failure detector: PFAIL from unanswered pings, report
//! bookkeeping, quorum promotion to FAIL, and rehabilitation.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use peridotdb::core::cluster::failure;
use peridotdb::core::cluster::gossip::now_ms;
use peridotdb::core::cluster::message::MsgPayload;
use peridotdb::core::cluster::node::NodeFlags;
use test_helpers::{add_master, add_replica, attach_fake_link, ephemeral_node, node_id};

#[tokio::test]
async fn test_outstanding_ping_past_timeout_marks_pfail() {
    let (state, _keyspace) = ephemeral_node(7700);
    let node = add_master(&state, &node_id('b'), 7801, 1, &[1]);
    let now = now_ms();

    node.write().ping_sent = now - 100;
    failure::check_pfail(&state, &node, now);
    assert!(!node.read().flags.contains(NodeFlags::PFAIL));

    // node_timeout in the test config is 500 ms.
    node.write().ping_sent = now - 501;
    failure::check_pfail(&state, &node, now);
    assert!(node.read().flags.contains(NodeFlags::PFAIL));
}

#[tokio::test]
async fn test_failure_reports_go_stale() {
    let (state, _keyspace) = ephemeral_node(7700);
    let node = add_master(&state, &node_id('b'), 7801, 1, &[1]);
    let now = now_ms();

    failure::add_failure_report(&node, &node_id('c'), now);
    failure::add_failure_report(&node, &node_id('d'), now);
    assert_eq!(failure::failure_report_count(&state, &node, now), 2);

    // Validity is node_timeout * 2 = 1000 ms in the test config.
    assert_eq!(failure::failure_report_count(&state, &node, now + 999), 2);
    assert_eq!(failure::failure_report_count(&state, &node, now + 1001), 0);
}

#[tokio::test]
async fn test_removing_a_report_on_healthy_gossip() {
    let (state, _keyspace) = ephemeral_node(7700);
    let node = add_master(&state, &node_id('b'), 7801, 1, &[1]);
    let now = now_ms();
    failure::add_failure_report(&node, &node_id('c'), now);
    failure::remove_failure_report(&node, &node_id('c'));
    assert_eq!(failure::failure_report_count(&state, &node, now), 0);
}

#[tokio::test]
async fn test_quorum_promotion_broadcasts_fail() {
    // Three slot-serving masters: myself, the victim, and a witness.
    let (state, _keyspace) = ephemeral_node(7700);
    let my_id = state.my_id();
    state.add_slot(&my_id, 1).unwrap();
    let victim = add_master(&state, &node_id('b'), 7801, 1, &[2]);
    let witness = add_master(&state, &node_id('c'), 7802, 1, &[3]);
    let mut witness_rx = attach_fake_link(&witness, 1);
    let now = now_ms();

    victim.write().flags.insert(NodeFlags::PFAIL);

    // cluster_size = 3, quorum = 2; our own view counts as one voice, so one
    // more master report tips it over.
    failure::try_promote_to_fail(&state, &victim, now);
    assert!(!victim.read().flags.contains(NodeFlags::FAIL));

    failure::add_failure_report(&victim, &node_id('c'), now);
    failure::try_promote_to_fail(&state, &victim, now);
    {
        let v = victim.read();
        assert!(v.flags.contains(NodeFlags::FAIL));
        assert!(!v.flags.contains(NodeFlags::PFAIL));
        assert_eq!(v.fail_time, now);
    }

    let broadcast = witness_rx.try_recv().expect("FAIL must be broadcast");
    match broadcast.payload {
        MsgPayload::Fail { node_id: failed } => assert_eq!(failed, node_id('b')),
        other => panic!("expected a FAIL broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fail_message_shortcuts_detection() {
    let (state, _keyspace) = ephemeral_node(7700);
    let victim = add_master(&state, &node_id('b'), 7801, 1, &[2]);
    let now = now_ms();
    failure::handle_fail_message(&state, &node_id('c'), &node_id('b'), now);
    assert!(victim.read().flags.contains(NodeFlags::FAIL));

    // A FAIL about ourselves is ignored.
    let my_id = state.my_id();
    failure::handle_fail_message(&state, &node_id('c'), &my_id, now);
    assert!(!state.myself().read().flags.contains(NodeFlags::FAIL));
}

#[tokio::test]
async fn test_fail_clears_immediately_for_replicas_and_slotless_masters() {
    let (state, _keyspace) = ephemeral_node(7700);
    let now = now_ms();

    let replica = add_replica(&state, &node_id('d'), &node_id('b'), 7803);
    {
        let mut r = replica.write();
        r.flags.insert(NodeFlags::FAIL);
        r.fail_time = now;
    }
    failure::clear_fail_if_needed(&state, &replica, now);
    assert!(!replica.read().flags.contains(NodeFlags::FAIL));

    let slotless = add_master(&state, &node_id('e'), 7804, 1, &[]);
    {
        let mut n = slotless.write();
        n.flags.insert(NodeFlags::FAIL);
        n.fail_time = now;
    }
    failure::clear_fail_if_needed(&state, &slotless, now);
    assert!(!slotless.read().flags.contains(NodeFlags::FAIL));
}

#[tokio::test]
async fn test_fail_on_a_serving_master_waits_for_the_undo_window() {
    let (state, _keyspace) = ephemeral_node(7700);
    let master = add_master(&state, &node_id('b'), 7801, 1, &[7]);
    let now = now_ms();
    {
        let mut m = master.write();
        m.flags.insert(NodeFlags::FAIL);
        m.fail_time = now;
    }

    // Inside the undo window (node_timeout * 2 = 1000 ms) the flag holds, so
    // its replicas still get their chance to take over.
    failure::clear_fail_if_needed(&state, &master, now + 900);
    assert!(master.read().flags.contains(NodeFlags::FAIL));

    failure::clear_fail_if_needed(&state, &master, now + 1100);
    assert!(!master.read().flags.contains(NodeFlags::FAIL));
}
