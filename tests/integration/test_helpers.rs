// tests/integration/test_helpers.rs

//! Shared fixtures for the cluster engine tests: ephemeral in-process nodes,
//! hand-built peer records, and fake bus links whose frames can be inspected.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::RwLock;
use peridotdb::config::Config;
use peridotdb::core::MemoryKeyspace;
use peridotdb::core::cluster::message::{ClusterMessage, MsgFlags, MsgHeader, MsgType};
use peridotdb::core::cluster::node::{ClusterNode, LinkHandle, NodeFlags};
use peridotdb::core::cluster::slot_map::SlotBitmap;
use peridotdb::core::cluster::state::ClusterState;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// A config for an ephemeral (non-persisted) test node with a short timeout.
pub fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = port;
    config.cluster.enabled = true;
    config.cluster.config_file = String::new();
    config.cluster.node_timeout = 500;
    config.cluster.require_full_coverage = false;
    config
}

pub fn ephemeral_node(port: u16) -> (Arc<ClusterState>, Arc<MemoryKeyspace>) {
    let keyspace = Arc::new(MemoryKeyspace::new());
    let state = ClusterState::new(&test_config(port), keyspace.clone())
        .expect("ephemeral cluster state must build");
    (state, keyspace)
}

/// Inserts a remote master into the node table and assigns it slots.
pub fn add_master(
    state: &Arc<ClusterState>,
    id: &str,
    port: u16,
    config_epoch: u64,
    slots: &[u16],
) -> Arc<RwLock<ClusterNode>> {
    let mut node = ClusterNode::new(id.to_string(), NodeFlags::MASTER, 0);
    node.ip = "127.0.0.1".to_string();
    node.port = port;
    node.bus_port = port + 10000;
    node.config_epoch = config_epoch;
    let arc = state.nodes.insert(node);
    for &slot in slots {
        state.assign_slot(slot, Some(id));
    }
    arc
}

/// Inserts a remote replica of the given master.
pub fn add_replica(
    state: &Arc<ClusterState>,
    id: &str,
    master_id: &str,
    port: u16,
) -> Arc<RwLock<ClusterNode>> {
    let mut node = ClusterNode::new(id.to_string(), NodeFlags::REPLICA, 0);
    node.ip = "127.0.0.1".to_string();
    node.port = port;
    node.bus_port = port + 10000;
    node.replicaof = Some(master_id.to_string());
    if let Some(master) = state.nodes.get(master_id) {
        master.write().has_had_replicas = true;
    }
    state.nodes.insert(node)
}

/// A fake bus link: frames sent through the handle pile up in the receiver.
pub fn fake_link(id: u64) -> (LinkHandle, UnboundedReceiver<ClusterMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LinkHandle {
            id,
            tx,
            established: 0,
        },
        rx,
    )
}

/// Attaches a fake link to a node so broadcasts and replies can be observed.
pub fn attach_fake_link(
    node: &Arc<RwLock<ClusterNode>>,
    id: u64,
) -> UnboundedReceiver<ClusterMessage> {
    let (handle, rx) = fake_link(id);
    node.write().link = Some(handle);
    rx
}

/// Builds a bus header as a remote peer would send it.
#[allow(clippy::too_many_arguments)]
pub fn peer_header(
    mtype: MsgType,
    sender: &str,
    flags: NodeFlags,
    master: Option<&str>,
    port: u16,
    current_epoch: u64,
    config_epoch: u64,
    claimed: &[u16],
) -> MsgHeader {
    let mut slots = SlotBitmap::new();
    for &slot in claimed {
        slots.set(slot);
    }
    MsgHeader {
        mtype,
        sender: sender.to_string(),
        flags,
        master: master.map(str::to_string),
        ip: "127.0.0.1".to_string(),
        port,
        cluster_ok: true,
        mflags: MsgFlags::empty(),
        current_epoch,
        config_epoch,
        repl_offset: 0,
        slots,
    }
}

pub fn node_id(fill: char) -> String {
    std::iter::repeat_n(fill, 40).collect()
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::from(s.to_string())
}
