// tests/integration/cluster_bus_test.rs

//! End-to-end scenarios over the real bus: MEET handshakes, slot-claim
//! gossip with MOVED redirection, and configEpoch collision resolution.

use super::test_helpers::{bytes, test_config};
use peridotdb::core::MemoryKeyspace;
use peridotdb::core::PeridotError;
use peridotdb::core::cluster::commands::{self, ClusterSubcommand};
use peridotdb::core::cluster::router::{self, RoutingSession};
use peridotdb::core::cluster::{ClusterState, bus, key_hash_slot};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

/// Picks a client port whose derived bus port is also free. Racy in theory,
/// but the window between probing and binding is tiny.
fn free_port() -> u16 {
    for _ in 0..64 {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let port = probe.local_addr().unwrap().port();
        if port > 1024
            && port < 55000
            && TcpListener::bind(("127.0.0.1", port + 10000)).is_ok()
        {
            return port;
        }
    }
    panic!("could not find a free port pair");
}

struct TestNode {
    state: Arc<ClusterState>,
    keyspace: Arc<MemoryKeyspace>,
    port: u16,
    shutdown: broadcast::Sender<()>,
}

impl TestNode {
    async fn start() -> Self {
        let port = free_port();
        let keyspace = Arc::new(MemoryKeyspace::new());
        let state = ClusterState::new(&test_config(port), keyspace.clone()).unwrap();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(bus::run(state.clone(), shutdown_rx));
        Self {
            state,
            keyspace,
            port,
            shutdown,
        }
    }

    fn meet(&self, other: &TestNode) {
        commands::execute(
            &self.state,
            ClusterSubcommand::Meet {
                host: "127.0.0.1".to_string(),
                port: other.port,
            },
        )
        .unwrap();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Polls until the condition holds or the deadline passes.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn knows(state: &Arc<ClusterState>, id: &str) -> bool {
    state
        .nodes
        .get(id)
        .map(|n| {
            let n = n.read();
            !n.in_handshake() && n.is_master()
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn test_meet_completes_a_mutual_handshake() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    sleep(Duration::from_millis(100)).await;

    a.meet(&b);

    let a_id = a.state.my_id();
    let b_id = b.state.my_id();
    let (a_state, b_state) = (a.state.clone(), b.state.clone());
    wait_for("both nodes to learn each other's identity", move || {
        knows(&a_state, &b_id) && knows(&b_state, &a_id)
    })
    .await;

    // Both tables settle on exactly two confirmed entries.
    assert_eq!(a.state.nodes.len(), 2);
    assert_eq!(b.state.nodes.len(), 2);

    // The NODES listing reflects the handshake completion on either side.
    let reply = commands::execute(&a.state, ClusterSubcommand::Nodes).unwrap();
    let peridotdb::core::Reply::Bulk(raw) = reply else {
        panic!("CLUSTER NODES returns a bulk string");
    };
    let text = String::from_utf8(raw.to_vec()).unwrap();
    assert!(text.contains(&b.state.my_id()));
    assert!(!text.contains("handshake"), "handshake flags cleared: {text}");
}

#[tokio::test]
async fn test_slot_claims_gossip_into_moved_redirections() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    sleep(Duration::from_millis(100)).await;

    let slot = key_hash_slot(b"tag5000");
    commands::execute(&b.state, ClusterSubcommand::AddSlots(vec![slot])).unwrap();
    a.meet(&b);

    let b_id = b.state.my_id();
    let a_state = a.state.clone();
    let expected = b_id.clone();
    wait_for("the slot claim to reach the other node", move || {
        a_state.slots.owner(slot).as_deref() == Some(expected.as_str())
    })
    .await;

    let a_state = a.state.clone();
    wait_for("the cluster state to settle", move || a_state.state_ok()).await;

    let err = router::route(
        &a.state,
        &[bytes("SET"), bytes("{tag5000}x"), bytes("1")],
        &RoutingSession::default(),
    )
    .unwrap_err();
    match err {
        PeridotError::Moved { slot: s, addr } => {
            assert_eq!(s, slot);
            assert_eq!(addr, format!("127.0.0.1:{}", b.port));
        }
        other => panic!("expected MOVED, got {other:?}"),
    }

    // The owner itself serves the key.
    b.keyspace.insert(bytes("{tag5000}x"), bytes("1"));
    let b_state = b.state.clone();
    wait_for("the owner to settle", move || b_state.state_ok()).await;
    assert!(
        router::route(
            &b.state,
            &[bytes("GET"), bytes("{tag5000}x")],
            &RoutingSession::default()
        )
        .is_ok()
    );
}

#[tokio::test]
async fn test_config_epoch_collision_resolves_across_the_bus() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    sleep(Duration::from_millis(100)).await;

    // Two fresh masters, both claiming slots at configEpoch 0.
    commands::execute(&a.state, ClusterSubcommand::AddSlots(vec![1])).unwrap();
    commands::execute(&b.state, ClusterSubcommand::AddSlots(vec![2])).unwrap();
    a.meet(&b);

    let (a_state, b_state) = (a.state.clone(), b.state.clone());
    wait_for("the collision to resolve into distinct epochs", move || {
        let a_epoch = {
            let myself = a_state.myself();
            let epoch = myself.read().config_epoch;
            epoch
        };
        let b_epoch = {
            let myself = b_state.myself();
            let epoch = myself.read().config_epoch;
            epoch
        };
        a_epoch != b_epoch
    })
    .await;

    // The greater identity yielded; the loser of the tiebreak kept epoch 0.
    let a_epoch = {
        let myself = a.state.myself();
        let epoch = myself.read().config_epoch;
        epoch
    };
    let b_epoch = {
        let myself = b.state.myself();
        let epoch = myself.read().config_epoch;
        epoch
    };
    let (greater_epoch, smaller_epoch) = if a.state.my_id() > b.state.my_id() {
        (a_epoch, b_epoch)
    } else {
        (b_epoch, a_epoch)
    };
    assert!(greater_epoch >= 1);
    assert_eq!(smaller_epoch, 0);
    assert!(
        a.state
            .current_epoch
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
    assert!(
        b.state
            .current_epoch
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}
