// src/core/cluster/node.rs

//! The node table: every peer this node knows about, keyed by its 40-hex
//! identity, plus the blacklist of recently forgotten identities.

use crate::core::cluster::message::ClusterMessage;
use crate::core::cluster::slot_map::SlotBitmap;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Length of a node identity in hex characters.
pub const NODE_ID_LEN: usize = 40;

/// How long a forgotten node stays blacklisted, so that gossip cannot
/// immediately re-add it.
pub const BLACKLIST_TTL_MS: u64 = 60_000;

/// Generates a fresh random 40-hex node identity.
pub fn random_node_id() -> String {
    hex::encode(rand::random::<[u8; 20]>())
}

bitflags! {
    /// Flags representing the state and role of a cluster node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct NodeFlags: u16 {
        const MYSELF    = 1 << 0;
        const MASTER    = 1 << 1;
        const REPLICA   = 1 << 2;
        /// Possible failure (locally suspected, unconfirmed).
        const PFAIL     = 1 << 3;
        /// Confirmed failure (master quorum agreed).
        const FAIL      = 1 << 4;
        /// Node is in handshake, identity not yet confirmed.
        const HANDSHAKE = 1 << 5;
        /// Node address is unknown.
        const NOADDR    = 1 << 6;
        /// Send MEET instead of PING on the next connect.
        const MEET      = 1 << 7;
    }
}

/// The sending half of an established bus link. Frames pushed here are
/// encoded and drained by the link's writer task; dropping every handle
/// tears the connection down.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<ClusterMessage>,
    /// Unix ms at which the link was created.
    pub established: u64,
}

impl LinkHandle {
    pub fn send(&self, msg: ClusterMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Everything this node knows about one peer (or about itself, for the entry
/// carrying the MYSELF flag).
#[derive(Debug)]
pub struct ClusterNode {
    /// 40-hex identity. Random at creation; handshake entries are renamed in
    /// place once the first PONG reveals the true identity.
    pub id: String,
    pub ip: String,
    /// Client-facing port.
    pub port: u16,
    /// Cluster bus port, normally `port + 10000`.
    pub bus_port: u16,
    pub flags: NodeFlags,
    /// For replicas, the identity of the replicated master.
    pub replicaof: Option<String>,
    pub config_epoch: u64,
    /// Last replication offset reported by the node.
    pub repl_offset: u64,
    /// Hash slots served by this node (meaningful for masters).
    pub slots: SlotBitmap,
    /// Unix ms at which the entry was created; bounds the handshake lifetime.
    pub ctime: u64,
    /// Unix ms of the oldest unanswered ping, or 0 when no ping is pending.
    pub ping_sent: u64,
    /// Unix ms of the last PONG received from this node.
    pub pong_received: u64,
    /// Unix ms at which the FAIL flag was set.
    pub fail_time: u64,
    /// Unix ms at which we last voted for a replica of this master.
    pub voted_time: u64,
    /// Whether this master was ever observed with at least one working
    /// replica; orphan rebalancing only targets such masters.
    pub has_had_replicas: bool,
    /// Failure reports: reporter identity -> unix ms of the last report.
    pub fail_reports: HashMap<String, u64>,
    /// The outbound bus link, if currently established.
    pub link: Option<LinkHandle>,
}

impl ClusterNode {
    pub fn new(id: String, flags: NodeFlags, now: u64) -> Self {
        Self {
            id,
            ip: String::new(),
            port: 0,
            bus_port: 0,
            flags,
            replicaof: None,
            config_epoch: 0,
            repl_offset: 0,
            slots: SlotBitmap::new(),
            ctime: now,
            ping_sent: 0,
            pong_received: 0,
            fail_time: 0,
            voted_time: 0,
            has_had_replicas: false,
            fail_reports: HashMap::new(),
            link: None,
        }
    }

    pub fn is_myself(&self) -> bool {
        self.flags.contains(NodeFlags::MYSELF)
    }

    pub fn is_master(&self) -> bool {
        self.flags.contains(NodeFlags::MASTER)
    }

    pub fn is_replica(&self) -> bool {
        self.flags.contains(NodeFlags::REPLICA)
    }

    pub fn is_failing(&self) -> bool {
        self.flags.intersects(NodeFlags::FAIL | NodeFlags::PFAIL)
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.contains(NodeFlags::HANDSHAKE)
    }

    /// The client-facing address, as used in MOVED/ASK redirections.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn bus_addr(&self) -> String {
        format!("{}:{}", self.ip, self.bus_port)
    }

    /// Flips the role flags to master. MASTER and REPLICA are mutually
    /// exclusive, so both are always rewritten together.
    pub fn set_master_role(&mut self) {
        self.flags.remove(NodeFlags::REPLICA);
        self.flags.insert(NodeFlags::MASTER);
        self.replicaof = None;
    }

    pub fn set_replica_role(&mut self, master_id: String) {
        self.flags.remove(NodeFlags::MASTER);
        self.flags.insert(NodeFlags::REPLICA);
        self.replicaof = Some(master_id);
    }
}

/// The set of known peers plus the forget-blacklist. Node records sit behind
/// per-node locks so that table iteration never pins the map shards; sweeps
/// collect identities first and mutate afterwards.
#[derive(Debug, Default)]
pub struct NodeTable {
    map: DashMap<String, Arc<RwLock<ClusterNode>>>,
    blacklist: DashMap<String, u64>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<RwLock<ClusterNode>>> {
        self.map.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn insert(&self, node: ClusterNode) -> Arc<RwLock<ClusterNode>> {
        let id = node.id.clone();
        let arc = Arc::new(RwLock::new(node));
        self.map.insert(id, arc.clone());
        arc
    }

    pub fn remove(&self, id: &str) -> Option<Arc<RwLock<ClusterNode>>> {
        self.map.remove(id).map(|(_, v)| v)
    }

    /// Renames a handshake entry in place once the true identity is known.
    /// The record keeps its link and timestamps; only the key changes.
    pub fn rename(&self, old_id: &str, new_id: &str) -> bool {
        let Some((_, arc)) = self.map.remove(old_id) else {
            return false;
        };
        arc.write().id = new_id.to_string();
        self.map.insert(new_id.to_string(), arc);
        true
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// A point-in-time list of node handles, safe to iterate while the table
    /// is concurrently mutated.
    pub fn snapshot(&self) -> Vec<Arc<RwLock<ClusterNode>>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    /// Finds a node (handshake entries included) by bus address, used to
    /// avoid starting duplicate handshakes toward the same peer.
    pub fn find_by_bus_addr(&self, ip: &str, bus_port: u16) -> Option<Arc<RwLock<ClusterNode>>> {
        self.snapshot().into_iter().find(|n| {
            let n = n.read();
            n.ip == ip && n.bus_port == bus_port
        })
    }

    pub fn blacklist_add(&self, id: &str, now: u64) {
        self.blacklist_sweep(now);
        self.blacklist.insert(id.to_string(), now + BLACKLIST_TTL_MS);
    }

    pub fn blacklist_contains(&self, id: &str, now: u64) -> bool {
        self.blacklist_sweep(now);
        self.blacklist.contains_key(id)
    }

    fn blacklist_sweep(&self, now: u64) {
        self.blacklist.retain(|_, expiry| *expiry > now);
    }
}
