// src/core/cluster/state.rs

//! The shared state of the cluster engine: the node table, slot ownership,
//! epoch counters, election and manual-failover bookkeeping, the aggregate
//! OK/FAIL evaluator, and the before-sleep hook that coalesces deferred
//! work between event-loop iterations.

use crate::config::Config;
use crate::core::cluster::node::{
    ClusterNode, NodeFlags, NodeTable, random_node_id,
};
use crate::core::cluster::persistence::{self, NodeConfFile};
use crate::core::cluster::slot_map::{self, CLUSTER_SLOTS, SlotTable};
use crate::core::cluster::{ClusterConfig, failover};
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::keyspace::Keyspace;
use crate::core::PeridotError;
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tracing::{info, warn};

bitflags! {
    /// Deferred actions accumulated by packet handlers and the cron, and
    /// drained by [`ClusterState::before_sleep`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TodoFlags: u8 {
        const HANDLE_FAILOVER = 1 << 0;
        const UPDATE_STATE    = 1 << 1;
        const SAVE_CONFIG     = 1 << 2;
        const FSYNC_CONFIG    = 1 << 3;
    }
}

/// Replica election progress, reset whenever an attempt concludes.
#[derive(Debug, Default)]
pub(crate) struct ElectionState {
    /// Unix ms at which the auth request may be sent. 0 = no election.
    pub auth_time: u64,
    /// Votes collected for the current attempt.
    pub auth_count: u64,
    /// Whether the request for the current attempt went out already.
    pub auth_sent: bool,
    /// Rank among co-replicas at scheduling time.
    pub auth_rank: u64,
    /// The epoch this candidate requested votes for.
    pub auth_epoch: u64,
}

impl ElectionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Manual failover progress, on either side of the handshake.
#[derive(Debug, Default)]
pub(crate) struct ManualFailoverState {
    /// Unix ms deadline. 0 = no manual failover in progress.
    pub end_time: u64,
    /// Master side: the replica that requested the failover.
    pub replica: Option<String>,
    /// Replica side: the master offset observed from a PAUSED ping.
    pub master_offset: u64,
    /// Replica side: set once our offset caught up with the master's.
    pub can_start: bool,
}

impl ManualFailoverState {
    pub fn in_progress(&self) -> bool {
        self.end_time != 0
    }

    pub fn reset(&mut self) {
        if self.in_progress() {
            info!("Manual failover state cleared.");
        }
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct StateEval {
    /// Unix ms of the last evaluation; bounds recomputation to 10/s.
    last_eval: u64,
    /// Unix ms at which this node last found itself in a minority partition.
    among_minority_since: u64,
}

/// `ClusterState` is the single context value threaded through every routine
/// of the engine. It is fully instantiable, so tests run several in-process
/// nodes against each other.
pub struct ClusterState {
    my_id: RwLock<String>,
    pub config: ClusterConfig,
    /// Announced client-facing address of this node.
    pub host: String,
    pub port: u16,
    /// The local address the cluster bus binds to.
    pub bus_bind_addr: String,
    pub nodes: NodeTable,
    pub slots: SlotTable,
    pub current_epoch: AtomicU64,
    pub last_vote_epoch: AtomicU64,
    state_ok: AtomicBool,
    eval: Mutex<StateEval>,
    pub(crate) election: Mutex<ElectionState>,
    pub(crate) manual_failover: Mutex<ManualFailoverState>,
    todo: AtomicU8,
    pub keyspace: Arc<dyn Keyspace>,
    pub events: EventBus,
    pub(crate) node_conf: Mutex<Option<NodeConfFile>>,
    link_ids: AtomicU64,
}

impl ClusterState {
    /// Builds the cluster state for this node: takes the node-view file lock,
    /// loads the previous view when one exists, or generates a fresh identity
    /// on first run (a zero-byte file is a legal first-run sentinel).
    pub fn new(config: &Config, keyspace: Arc<dyn Keyspace>) -> Result<Arc<Self>, PeridotError> {
        let now = crate::core::cluster::gossip::now_ms();
        let (host, port) = config.announced_addr();
        let bus_port = port.saturating_add(config.cluster.bus_port_offset);
        let bus_bind_addr = format!(
            "{}:{}",
            config.host,
            config.port.saturating_add(config.cluster.bus_port_offset)
        );

        let mut node_conf = None;
        let mut content = String::new();
        if !config.cluster.config_file.is_empty() {
            let mut file = NodeConfFile::open(&config.cluster.config_file)?;
            content = file.read_all()?;
            node_conf = Some(file);
        }

        let state = Arc::new(Self {
            my_id: RwLock::new(String::new()),
            config: config.cluster.clone(),
            host: host.clone(),
            port,
            bus_bind_addr,
            nodes: NodeTable::new(),
            slots: SlotTable::new(),
            current_epoch: AtomicU64::new(0),
            last_vote_epoch: AtomicU64::new(0),
            state_ok: AtomicBool::new(false),
            eval: Mutex::new(StateEval::default()),
            election: Mutex::new(ElectionState::default()),
            manual_failover: Mutex::new(ManualFailoverState::default()),
            todo: AtomicU8::new(0),
            keyspace,
            events: EventBus::new(),
            node_conf: Mutex::new(node_conf),
            link_ids: AtomicU64::new(0),
        });

        if content.trim().is_empty() {
            let my_id = random_node_id();
            info!("No cluster configuration found; I'm {my_id}");
            *state.my_id.write() = my_id.clone();
            let mut myself = ClusterNode::new(my_id, NodeFlags::MYSELF | NodeFlags::MASTER, now);
            myself.ip = host;
            myself.port = port;
            myself.bus_port = bus_port;
            myself.pong_received = now;
            state.nodes.insert(myself);
            state.save_config(false)?;
        } else {
            persistence::apply(&state, &content, now)?;
            let myself = state.myself();
            {
                let mut me = myself.write();
                me.ip = host;
                me.port = port;
                me.bus_port = bus_port;
                me.pong_received = now;
            }
            let me = myself.read();
            info!(
                "Node configuration loaded, I'm {} ({})",
                me.id,
                if me.is_master() { "master" } else { "replica" }
            );
            if let Some(master_id) = me.replicaof.clone() {
                drop(me);
                if let Some(master) = state.nodes.get(&master_id) {
                    let (ip, port) = {
                        let m = master.read();
                        (m.ip.clone(), m.port)
                    };
                    state.keyspace.replication_set_master(&ip, port);
                }
            }
        }

        state.update_state(now);
        Ok(state)
    }

    pub fn my_id(&self) -> String {
        self.my_id.read().clone()
    }

    pub(crate) fn set_my_id(&self, id: String) {
        *self.my_id.write() = id;
    }

    /// This node's own entry in the node table.
    pub fn myself(&self) -> Arc<RwLock<ClusterNode>> {
        self.nodes
            .get(&self.my_id())
            .expect("own node record must exist in the node table")
    }

    pub fn is_master(&self) -> bool {
        self.myself().read().is_master()
    }

    pub fn my_master_id(&self) -> Option<String> {
        self.myself().read().replicaof.clone()
    }

    pub fn state_ok(&self) -> bool {
        self.state_ok.load(Ordering::Relaxed)
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.link_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn todo_set(&self, flags: TodoFlags) {
        self.todo.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    fn todo_take(&self) -> TodoFlags {
        TodoFlags::from_bits_truncate(self.todo.swap(0, Ordering::Relaxed))
    }

    /// Number of masters serving at least one slot.
    pub fn cluster_size(&self) -> usize {
        slot_map::cluster_size(self)
    }

    /// The weak agreement quorum over slot-serving masters.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn replicas_of(&self, master_id: &str) -> Vec<Arc<RwLock<ClusterNode>>> {
        self.nodes
            .snapshot()
            .into_iter()
            .filter(|n| {
                let n = n.read();
                n.is_replica() && n.replicaof.as_deref() == Some(master_id)
            })
            .collect()
    }

    // --- Slot table operations ---

    /// Rewrites the owner of a slot, keeping the per-node bitmaps and their
    /// cached counts in lockstep with the owner table.
    pub fn assign_slot(&self, slot: u16, new_owner: Option<&str>) {
        let old = self.slots.set_owner(slot, new_owner.map(str::to_string));
        if let Some(old_id) = old
            && new_owner != Some(old_id.as_str())
            && let Some(node) = self.nodes.get(&old_id)
        {
            node.write().slots.clear(slot);
        }
        if let Some(new_id) = new_owner
            && let Some(node) = self.nodes.get(new_id)
        {
            node.write().slots.set(slot);
        }
    }

    /// Assigns a free slot to a node. Fails if the slot is already served.
    pub fn add_slot(&self, node_id: &str, slot: u16) -> Result<(), PeridotError> {
        if slot as usize >= CLUSTER_SLOTS {
            return Err(PeridotError::InvalidSlot);
        }
        if let Some(owner) = self.slots.owner(slot) {
            return Err(PeridotError::InvalidState(format!(
                "Slot {slot} is already busy (owned by {owner})"
            )));
        }
        self.assign_slot(slot, Some(node_id));
        Ok(())
    }

    /// Unassigns one slot. Fails if the slot is not served at all.
    pub fn del_slot(&self, slot: u16) -> Result<(), PeridotError> {
        if slot as usize >= CLUSTER_SLOTS {
            return Err(PeridotError::InvalidSlot);
        }
        if self.slots.owner(slot).is_none() {
            return Err(PeridotError::InvalidState(format!(
                "Slot {slot} is already unassigned"
            )));
        }
        self.assign_slot(slot, None);
        self.slots.close_slot(slot);
        Ok(())
    }

    /// Unassigns every slot served by a node, returning how many slots were
    /// actually cleared.
    pub fn del_node_slots(&self, node_id: &str) -> usize {
        let owned: Vec<u16> = match self.nodes.get(node_id) {
            Some(node) => node.read().slots.iter().collect(),
            None => return 0,
        };
        let mut deleted = 0;
        for slot in owned {
            if self.slots.owned_by(slot, node_id) {
                self.assign_slot(slot, None);
                deleted += 1;
            } else if let Some(node) = self.nodes.get(node_id) {
                // Bitmap said we owned it but the table disagreed; trust the
                // table and repair the bitmap.
                node.write().slots.clear(slot);
            }
        }
        deleted
    }

    // --- Role transitions (for MYSELF) ---

    /// Reconfigures this node as a replica of the given master: role flags,
    /// back-reference bookkeeping, reshard pointers, and the replication
    /// target of the attached keyspace all flip together.
    pub fn become_replica_of(&self, master_id: &str, _now: u64) {
        let my_id = self.my_id();
        if master_id == my_id {
            return;
        }
        let Some(master_arc) = self.nodes.get(master_id) else {
            return;
        };
        let (master_ip, master_port) = {
            let mut m = master_arc.write();
            m.has_had_replicas = true;
            (m.ip.clone(), m.port)
        };

        self.del_node_slots(&my_id);
        self.slots.close_all_slots();
        self.myself().write().set_replica_role(master_id.to_string());
        self.keyspace.replication_set_master(&master_ip, master_port);
        self.election.lock().reset();
        self.manual_failover.lock().reset();
        self.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
        self.events.publish(ClusterEvent::RoleChanged { master: false });
        info!("Now a replica of {master_id} ({master_ip}:{master_port})");
    }

    /// Flips this node to a master role without touching slot ownership;
    /// slot reclaiming is the caller's business (failover win, RESET).
    pub fn become_master(&self) {
        {
            let myself = self.myself();
            let mut me = myself.write();
            if me.is_master() {
                return;
            }
            me.set_master_role();
        }
        self.keyspace.replication_unset_master();
        self.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
        self.events.publish(ClusterEvent::RoleChanged { master: true });
    }

    // --- Configuration epochs ---

    /// §Epoch rule: pre-increments the cluster-wide epoch and returns it.
    pub fn next_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Raises our currentEpoch to an observed value, never lowering it.
    pub fn observe_current_epoch(&self, observed: u64) {
        let cur = self.current_epoch.load(Ordering::Relaxed);
        if observed > cur {
            self.current_epoch.fetch_max(observed, Ordering::Relaxed);
            self.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
        }
    }

    /// The unilateral bump used after manual slot migrations and takeovers:
    /// when our configEpoch is zero or not the unique maximum, adopt a brand
    /// new epoch. May collide; the collision resolver sorts that out later.
    pub fn bump_config_epoch(&self) -> u64 {
        let my_id = self.my_id();
        let myself = self.myself();
        let my_epoch = myself.read().config_epoch;
        let max_other = self
            .nodes
            .snapshot()
            .iter()
            .filter(|n| n.read().id != my_id)
            .map(|n| n.read().config_epoch)
            .max()
            .unwrap_or(0);
        if my_epoch != 0 && my_epoch > max_other {
            return my_epoch;
        }
        // The new epoch must clear everything this node knows about, even if
        // epoch observation lagged behind.
        self.current_epoch
            .fetch_max(max_other.max(my_epoch), Ordering::Relaxed);
        let new_epoch = self.next_epoch();
        myself.write().config_epoch = new_epoch;
        self.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
        info!("Bumped my configEpoch to {new_epoch}");
        new_epoch
    }

    /// Resolves a configEpoch collision with another master: the node whose
    /// identity is lexicographically greater yields and adopts a fresh epoch,
    /// so every colliding pair converges in finite rounds.
    pub fn handle_config_epoch_collision(&self, sender_id: &str, sender_epoch: u64) {
        let my_id = self.my_id();
        let myself = self.myself();
        {
            let me = myself.read();
            if !me.is_master() || me.config_epoch != sender_epoch {
                return;
            }
        }
        if my_id.as_str() <= sender_id {
            return;
        }
        let new_epoch = self.next_epoch();
        myself.write().config_epoch = new_epoch;
        self.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
        warn!(
            "configEpoch collision with {sender_id} at epoch {sender_epoch}; \
             yielding with new configEpoch {new_epoch}"
        );
    }

    // --- Aggregate state ---

    /// Re-derives the OK/FAIL cluster state: full-coverage policy, reachable
    /// master quorum, and the rejoin delay for masters coming back from a
    /// minority partition. Throttled to at most ten runs per second.
    pub fn update_state(&self, now: u64) {
        let mut eval = self.eval.lock();
        if eval.last_eval != 0 && now < eval.last_eval + 100 {
            return;
        }
        eval.last_eval = now;

        let mut new_ok = true;
        if self.config.require_full_coverage {
            for slot in 0..CLUSTER_SLOTS as u16 {
                let Some(owner_id) = self.slots.owner(slot) else {
                    new_ok = false;
                    break;
                };
                let failed = self
                    .nodes
                    .get(&owner_id)
                    .map(|n| n.read().flags.contains(NodeFlags::FAIL))
                    .unwrap_or(true);
                if failed {
                    new_ok = false;
                    break;
                }
            }
        } else if self.slots.assigned_count() == 0 {
            new_ok = false;
        }

        let size = slot_map::cluster_size(self);
        let needed = size / 2 + 1;
        let reachable = slot_map::reachable_masters(self);
        if reachable < needed {
            new_ok = false;
            eval.among_minority_since = now;
        }

        let was_ok = self.state_ok.load(Ordering::Relaxed);
        if new_ok && !was_ok {
            // A master reunited with the majority must idle briefly before
            // accepting writes again, so it can be reconfigured first.
            let rejoin_delay = self.config.node_timeout.clamp(500, 5000);
            if self.is_master() && now.saturating_sub(eval.among_minority_since) < rejoin_delay {
                return;
            }
        }
        if new_ok != was_ok {
            self.state_ok.store(new_ok, Ordering::Relaxed);
            if new_ok {
                info!("Cluster state changed: ok");
            } else {
                warn!("Cluster state changed: fail");
            }
            self.events.publish(ClusterEvent::StateChanged { ok: new_ok });
        }
    }

    // --- Deferred work ---

    /// Drains the pending-action bitset. This is the only place persistence
    /// happens, so writes triggered by a burst of packets coalesce into one.
    /// Runs synchronously between event-loop iterations and is idempotent.
    pub fn before_sleep(self: &Arc<Self>, now: u64) -> Result<(), PeridotError> {
        let todo = self.todo_take();
        if todo.contains(TodoFlags::HANDLE_FAILOVER) {
            failover::replica_failover_cron(self, now);
        }
        if todo.contains(TodoFlags::UPDATE_STATE) {
            self.update_state(now);
        }
        if todo.contains(TodoFlags::SAVE_CONFIG) {
            self.save_config(todo.contains(TodoFlags::FSYNC_CONFIG))?;
        }
        Ok(())
    }

    /// Persists the node-view snapshot. The node view is on the critical
    /// path for epoch bumps, so a write failure is fatal to the process.
    pub fn save_config(&self, fsync: bool) -> Result<(), PeridotError> {
        persistence::save(self, fsync || self.config.config_fsync)
    }
}
