// src/core/cluster/gossip.rs

//! The gossip engine: building PING/PONG/MEET messages with a random subset
//! of node hints, ingesting peer packets, reconciling roles and slot claims,
//! and the periodic cron driving pings, failure promotion, and handshakes.

use crate::core::cluster::message::{
    ClusterMessage, GossipEntry, MsgFlags, MsgHeader, MsgPayload, MsgType,
};
use crate::core::cluster::node::{ClusterNode, LinkHandle, NodeFlags, random_node_id};
use crate::core::cluster::slot_map::{self, SlotBitmap};
use crate::core::cluster::state::{ClusterState, TodoFlags};
use crate::core::cluster::{failover, failure, migration};
use crate::core::events::ClusterEvent;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Minimum number of gossip entries packed into a PING/PONG when enough
/// fresh nodes exist.
const GOSSIP_MIN_ENTRIES: usize = 3;

/// How many random nodes the cron samples per tick when choosing the
/// oldest-pong ping target.
const PING_SAMPLE_SIZE: usize = 5;

/// Helper to get the current system time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the caller must do with the link a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Keep,
    /// The packet handler freed the link (identity mismatch, duplicate
    /// handshake); the caller must bail out of its read loop.
    Close,
}

/// Where a packet came from: the handle for writing replies back on the same
/// connection, the remote IP when known, and, for our own outbound links,
/// the node record the link belongs to.
pub struct PacketSource<'a> {
    pub reply: &'a LinkHandle,
    pub peer_ip: Option<IpAddr>,
    pub link_node: Option<&'a Arc<RwLock<ClusterNode>>>,
}

// --- Message construction ---

/// Builds the fixed header every outgoing bus message carries. The slot
/// bitmap is the sender's master-view: its own claims when it is a master,
/// its master's claims when it is a replica.
pub(crate) fn build_header(
    state: &ClusterState,
    mtype: MsgType,
    extra_mflags: MsgFlags,
    _now: u64,
) -> MsgHeader {
    let (id, flags, replicaof, ip, port, config_epoch, my_slots) = {
        let myself = state.myself();
        let me = myself.read();
        (
            me.id.clone(),
            me.flags,
            me.replicaof.clone(),
            me.ip.clone(),
            me.port,
            me.config_epoch,
            me.slots.clone(),
        )
    };
    let slots = if flags.contains(NodeFlags::MASTER) {
        my_slots
    } else {
        replicaof
            .as_ref()
            .and_then(|id| state.nodes.get(id))
            .map(|m| m.read().slots.clone())
            .unwrap_or_else(SlotBitmap::new)
    };
    let mut mflags = extra_mflags;
    if flags.contains(NodeFlags::MASTER) {
        let mf = state.manual_failover.lock();
        if mf.in_progress() && mf.replica.is_some() {
            mflags |= MsgFlags::PAUSED;
        }
    }
    MsgHeader {
        mtype,
        sender: id,
        flags,
        master: replicaof,
        ip,
        port,
        cluster_ok: state.state_ok(),
        mflags,
        current_epoch: state.current_epoch.load(std::sync::atomic::Ordering::Relaxed),
        config_epoch,
        repl_offset: state.keyspace.replication_get_replica_offset(),
        slots,
    }
}

/// A PING/PONG/MEET message with a freshly sampled gossip section.
pub(crate) fn build_ping_msg(state: &ClusterState, mtype: MsgType, now: u64) -> ClusterMessage {
    ClusterMessage {
        header: build_header(state, mtype, MsgFlags::empty(), now),
        payload: MsgPayload::Gossip(gossip_section(state, now)),
    }
}

/// Samples the gossip section: between 3 and N/10 entries, never more than
/// N - 2. The first third of the sampling iterations only keeps failing
/// candidates, so failure evidence travels faster than ordinary hints.
pub(crate) fn gossip_section(state: &ClusterState, _now: u64) -> Vec<GossipEntry> {
    let candidates = state.nodes.snapshot();
    let total = candidates.len();
    let mut wanted = GOSSIP_MIN_ENTRIES.max(total / 10);
    wanted = wanted.min(total.saturating_sub(2));
    if wanted == 0 {
        return Vec::new();
    }

    let max_iterations = wanted * 3;
    let mut rng = rand::thread_rng();
    let mut entries: Vec<GossipEntry> = Vec::with_capacity(wanted);
    for i in 0..max_iterations {
        if entries.len() >= wanted {
            break;
        }
        let Some(node) = candidates.choose(&mut rng) else {
            break;
        };
        let n = node.read();
        if n.is_myself() {
            continue;
        }
        if i < max_iterations / 3 && !n.is_failing() {
            continue;
        }
        if n.flags.intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR) {
            continue;
        }
        if n.link.is_none() && n.slots.is_empty() {
            continue;
        }
        if entries.iter().any(|e| e.id == n.id) {
            continue;
        }
        entries.push(GossipEntry {
            id: n.id.clone(),
            ip: n.ip.clone(),
            port: n.port,
            bus_port: n.bus_port,
            flags: n.flags,
            ping_sent: n.ping_sent,
            pong_received: n.pong_received,
        });
    }
    entries
}

/// Sends a PING (or MEET) to a node over its link, recording the outstanding
/// ping time when none is pending yet.
pub(crate) fn send_ping(
    state: &ClusterState,
    node: &Arc<RwLock<ClusterNode>>,
    mtype: MsgType,
    now: u64,
) {
    let msg = build_ping_msg(state, mtype, now);
    let mut n = node.write();
    let Some(link) = &n.link else {
        return;
    };
    if link.send(msg) && n.ping_sent == 0 {
        n.ping_sent = now;
    }
}

/// Sends a message to every connected peer.
pub(crate) fn broadcast_message(state: &ClusterState, msg: &ClusterMessage) {
    for node in state.nodes.snapshot() {
        let n = node.read();
        if n.is_myself() || n.in_handshake() {
            continue;
        }
        if let Some(link) = &n.link {
            link.send(msg.clone());
        }
    }
}

/// Broadcasts a PONG so every node refreshes its view of us right away,
/// used when our configuration changed in a way peers must learn quickly
/// (failover win, role switch).
pub(crate) fn broadcast_pong(state: &ClusterState, now: u64) {
    let msg = build_ping_msg(state, MsgType::Pong, now);
    broadcast_message(state, &msg);
}

/// Forwards a locally published pub/sub message to every node, so remote
/// subscribers see publishes that originated here.
pub fn broadcast_publish(state: &ClusterState, channel: Bytes, message: Bytes, now: u64) {
    let msg = ClusterMessage {
        header: build_header(state, MsgType::Publish, MsgFlags::empty(), now),
        payload: MsgPayload::Publish { channel, message },
    };
    broadcast_message(state, &msg);
}

/// Broadcasts a FAIL message about a node whose failure just got confirmed,
/// letting every peer shortcut its own detection.
pub(crate) fn broadcast_fail(state: &ClusterState, failed_id: &str, now: u64) {
    let msg = ClusterMessage {
        header: build_header(state, MsgType::Fail, MsgFlags::empty(), now),
        payload: MsgPayload::Fail {
            node_id: failed_id.to_string(),
        },
    };
    broadcast_message(state, &msg);
}

/// Starts a handshake toward a gossiped or operator-provided address: a
/// table entry with a random identity that the first PONG will rename.
/// Returns false when a node with that bus address already exists.
pub fn handshake_start(
    state: &ClusterState,
    ip: &str,
    port: u16,
    bus_port: u16,
    now: u64,
) -> bool {
    if ip.is_empty() || port == 0 || bus_port == 0 {
        return false;
    }
    if state.nodes.find_by_bus_addr(ip, bus_port).is_some() {
        return false;
    }
    let mut node = ClusterNode::new(
        random_node_id(),
        NodeFlags::HANDSHAKE | NodeFlags::MEET,
        now,
    );
    node.ip = ip.to_string();
    node.port = port;
    node.bus_port = bus_port;
    info!("Start of handshake with {ip}:{bus_port}");
    state.nodes.insert(node);
    true
}

// --- The periodic tick ---

/// One cluster cron iteration (ten per second): handshake expiry, link
/// maintenance, ping scheduling, failure promotion, manual-failover timeout,
/// election progress, replica migration, and state re-evaluation. Returns
/// the identities that need an outbound connection attempt; the bus layer
/// owns the sockets.
pub fn cluster_cron(state: &Arc<ClusterState>, now: u64) -> Vec<String> {
    let my_id = state.my_id();
    let timeout = state.config.node_timeout;
    let handshake_timeout = timeout.max(1000);
    let mut to_connect = Vec::new();

    for node in state.nodes.snapshot() {
        let (id, flags, ctime, ping_sent, has_link) = {
            let n = node.read();
            (n.id.clone(), n.flags, n.ctime, n.ping_sent, n.link.is_some())
        };
        if id == my_id {
            continue;
        }
        if flags.contains(NodeFlags::HANDSHAKE)
            && now.saturating_sub(ctime) > handshake_timeout
        {
            let bus_addr = node.read().bus_addr();
            info!("Handshake with {bus_addr} timed out, removing the entry");
            state.nodes.remove(&id);
            continue;
        }
        if flags.contains(NodeFlags::NOADDR) {
            continue;
        }
        if !has_link {
            to_connect.push(id);
            continue;
        }
        // An outstanding ping past half the timeout means a dead or wedged
        // connection; drop the link so the next tick reconnects, keeping the
        // ping timestamp so PFAIL can still trigger.
        if ping_sent != 0 && now.saturating_sub(ping_sent) > timeout / 2 {
            debug!("Freeing possibly dead link to {id}");
            node.write().link = None;
            to_connect.push(id);
        }
        failure::check_pfail(state, &node, now);
        if node.read().flags.contains(NodeFlags::PFAIL) {
            failure::try_promote_to_fail(state, &node, now);
        }
    }

    // Ping the node with the oldest pong among five random candidates.
    let pingable: Vec<_> = state
        .nodes
        .snapshot()
        .into_iter()
        .filter(|n| {
            let n = n.read();
            !n.is_myself() && !n.in_handshake() && n.link.is_some() && n.ping_sent == 0
        })
        .collect();
    if !pingable.is_empty() {
        let mut rng = rand::thread_rng();
        let mut oldest: Option<(u64, &Arc<RwLock<ClusterNode>>)> = None;
        for _ in 0..PING_SAMPLE_SIZE {
            let candidate = pingable
                .choose(&mut rng)
                .expect("pingable list is non-empty");
            let pong = candidate.read().pong_received;
            if oldest.is_none_or(|(best, _)| pong < best) {
                oldest = Some((pong, candidate));
            }
        }
        if let Some((_, node)) = oldest {
            send_ping(state, node, MsgType::Ping, now);
        }
    }

    // Additionally ping every node we have not heard from in half the
    // timeout, so no peer ever ages past detection silently.
    for node in state.nodes.snapshot() {
        let should_ping = {
            let n = node.read();
            !n.is_myself()
                && !n.in_handshake()
                && n.link.is_some()
                && n.ping_sent == 0
                && now.saturating_sub(n.pong_received) > timeout / 2
        };
        if should_ping {
            send_ping(state, &node, MsgType::Ping, now);
        }
    }

    failover::manual_failover_cron(state, now);
    failover::replica_failover_cron(state, now);
    migration::replica_migration_cron(state, now);
    state.update_state(now);

    to_connect
}

// --- Packet ingestion ---

/// Processes one bus packet. Mutates the node table, slot map, and epoch
/// counters; replies travel back on the link the packet arrived on. The
/// returned [`LinkAction`] tells the caller whether the link survived.
pub fn process_packet(
    state: &Arc<ClusterState>,
    msg: ClusterMessage,
    src: PacketSource<'_>,
    now: u64,
) -> LinkAction {
    let header = msg.header.clone();
    let my_id = state.my_id();
    if header.sender == my_id {
        return LinkAction::Keep;
    }
    debug!(
        "--- Processing packet of type {} from {}",
        header.mtype, header.sender
    );

    let mut sender = state.nodes.get(&header.sender);

    // Identity checks for packets arriving on our own outbound links.
    if matches!(header.mtype, MsgType::Ping | MsgType::Pong | MsgType::Meet)
        && let Some(link_node) = src.link_node
    {
        let (link_id, in_handshake) = {
            let n = link_node.read();
            (n.id.clone(), n.in_handshake())
        };
        if link_id != header.sender {
            if in_handshake {
                if sender.is_some() {
                    // The handshake address resolved to a node we already
                    // know; drop the duplicate entry and its link.
                    debug!(
                        "Handshake entry {link_id} resolved to already-known {}; dropping it",
                        header.sender
                    );
                    state.nodes.remove(&link_id);
                    return LinkAction::Close;
                }
                // First PONG carries the true identity: rename in place.
                info!("Handshake completed: node {link_id} is really {}", header.sender);
                state.nodes.rename(&link_id, &header.sender);
                {
                    let mut n = link_node.write();
                    n.flags.remove(NodeFlags::HANDSHAKE | NodeFlags::NOADDR);
                }
                state.todo_set(TodoFlags::SAVE_CONFIG);
                sender = Some(link_node.clone());
            } else {
                // The peer answered with an unexpected identity; it was
                // probably restarted from scratch. Keep the record but
                // forget the address until gossip rediscovers it.
                warn!(
                    "PONG identity mismatch on link to {link_id}: sender claims {}",
                    header.sender
                );
                let mut n = link_node.write();
                n.flags.insert(NodeFlags::NOADDR);
                n.link = None;
                drop(n);
                state.todo_set(TodoFlags::SAVE_CONFIG);
                return LinkAction::Close;
            }
        }
    }

    // Epoch observation rules: a higher currentEpoch raises ours, a higher
    // configEpoch for the sender raises its record.
    if let Some(sender_arc) = &sender
        && !sender_arc.read().in_handshake()
    {
        state.observe_current_epoch(header.current_epoch);
        {
            let mut s = sender_arc.write();
            if header.config_epoch > s.config_epoch {
                s.config_epoch = header.config_epoch;
                state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
            }
            s.repl_offset = header.repl_offset;
        }
        if header.mflags.contains(MsgFlags::PAUSED) {
            failover::manual_failover_observe_master(state, &header.sender, header.repl_offset);
        }
    }

    match header.mtype {
        MsgType::Ping | MsgType::Pong | MsgType::Meet => {
            // A MEET from an unknown peer enters the table in handshake
            // state; our own outbound handshake confirms its identity.
            if header.mtype == MsgType::Meet
                && sender.is_none()
                && let Some(peer_ip) = src.peer_ip
            {
                let ip = peer_ip.to_string();
                let bus_port = header.port.saturating_add(state.config.bus_port_offset);
                if state.nodes.find_by_bus_addr(&ip, bus_port).is_none() {
                    let mut node =
                        ClusterNode::new(random_node_id(), NodeFlags::HANDSHAKE, now);
                    node.ip = ip;
                    node.port = header.port;
                    node.bus_port = bus_port;
                    info!("MEET from unknown node {}; adding {}:{}", header.sender, node.ip, bus_port);
                    state.nodes.insert(node);
                    state.todo_set(TodoFlags::SAVE_CONFIG);
                }
            }

            if header.mtype != MsgType::Pong {
                src.reply.send(build_ping_msg(state, MsgType::Pong, now));
            }

            if header.mtype == MsgType::Pong
                && let Some(sender_arc) = &sender
            {
                let mut s = sender_arc.write();
                s.pong_received = now;
                s.ping_sent = 0;
                s.flags.remove(NodeFlags::MEET);
                if s.flags.contains(NodeFlags::PFAIL) {
                    info!("Clear PFAIL flag for {}: it answered again", s.id);
                    s.flags.remove(NodeFlags::PFAIL);
                    drop(s);
                    state.todo_set(TodoFlags::UPDATE_STATE);
                } else {
                    drop(s);
                }
                failure::clear_fail_if_needed(state, sender_arc, now);
            }

            if let Some(sender_arc) = &sender {
                if sender_arc.read().in_handshake() {
                    return LinkAction::Keep;
                }
                refresh_sender_address(state, sender_arc, &header, &src);
                update_sender_role(state, sender_arc, &header);
                handle_slot_claims(state, &header, &src, now);
                if header.master.is_none() {
                    state.handle_config_epoch_collision(&header.sender, header.config_epoch);
                }
                if let MsgPayload::Gossip(entries) = &msg.payload {
                    process_gossip_section(state, Some(sender_arc), entries, now);
                }
            } else if header.mtype == MsgType::Meet
                && let MsgPayload::Gossip(entries) = &msg.payload
            {
                // Gossip hints of a MEET are still useful for discovery even
                // though the sender is not trusted for failure reports yet.
                process_gossip_section(state, None, entries, now);
            }
            LinkAction::Keep
        }
        MsgType::Fail => {
            if sender.is_some()
                && let MsgPayload::Fail { node_id } = &msg.payload
            {
                failure::handle_fail_message(state, &header.sender, node_id, now);
            }
            LinkAction::Keep
        }
        MsgType::Publish => {
            if let MsgPayload::Publish { channel, message } = msg.payload {
                state.events.publish(ClusterEvent::ForwardedPublish { channel, message });
            }
            LinkAction::Keep
        }
        MsgType::Update => {
            if sender.is_some()
                && let MsgPayload::Update {
                    config_epoch,
                    node_id,
                    slots,
                } = &msg.payload
                && let Some(node) = state.nodes.get(node_id)
            {
                let recorded = node.read().config_epoch;
                if recorded < *config_epoch {
                    node.write().config_epoch = *config_epoch;
                    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
                    slot_map::update_slots_config(state, node_id, *config_epoch, slots, now);
                }
            }
            LinkAction::Keep
        }
        MsgType::FailoverAuthRequest => {
            if sender.is_some() {
                failover::handle_auth_request(state, &header, src.reply, now);
            }
            LinkAction::Keep
        }
        MsgType::FailoverAuthAck => {
            if sender.is_some() {
                failover::handle_auth_ack(state, &header, now);
            }
            LinkAction::Keep
        }
        MsgType::MfStart => {
            if sender.is_some() {
                failover::handle_mfstart(state, &header.sender, now);
            }
            LinkAction::Keep
        }
    }
}

/// Re-learns the address of a NOADDR node from the connection it contacted
/// us over.
fn refresh_sender_address(
    state: &ClusterState,
    sender: &Arc<RwLock<ClusterNode>>,
    header: &MsgHeader,
    src: &PacketSource<'_>,
) {
    let Some(peer_ip) = src.peer_ip else {
        return;
    };
    let mut s = sender.write();
    if !s.flags.contains(NodeFlags::NOADDR) {
        return;
    }
    s.ip = peer_ip.to_string();
    s.port = header.port;
    s.bus_port = header.port.saturating_add(state.config.bus_port_offset);
    s.flags.remove(NodeFlags::NOADDR);
    info!("Address discovered for node {}: {}:{}", s.id, s.ip, s.port);
    drop(s);
    state.todo_set(TodoFlags::SAVE_CONFIG);
}

/// Reconciles the sender's role flags and master pointer with its header.
/// The back-list on the master side and the forward pointer on the replica
/// side flip together with the role flags.
fn update_sender_role(state: &ClusterState, sender: &Arc<RwLock<ClusterNode>>, header: &MsgHeader) {
    match &header.master {
        None => {
            let promoted = {
                let mut s = sender.write();
                if s.is_master() {
                    false
                } else {
                    s.set_master_role();
                    true
                }
            };
            if promoted {
                state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
            }
        }
        Some(master_id) => {
            let (sender_id, was_master, prev_master) = {
                let s = sender.read();
                (s.id.clone(), s.is_master(), s.replicaof.clone())
            };
            if was_master {
                // Demoted master: whatever it still claimed is unowned now.
                let cleared = state.del_node_slots(&sender_id);
                if cleared > 0 {
                    info!("Master {sender_id} demoted to replica; {cleared} slots released");
                }
            }
            if was_master || prev_master.as_deref() != Some(master_id.as_str()) {
                sender.write().set_replica_role(master_id.clone());
                state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE);
            }
            if let Some(master) = state.nodes.get(master_id) {
                master.write().has_had_replicas = true;
            }
        }
    }
}

/// Ingests the slot claims of a master sender, then checks the claims for
/// staleness against our own view: when the sender claims a slot we know
/// belongs to a node with a greater configEpoch, it gets an UPDATE telling
/// it about the real owner.
fn handle_slot_claims(
    state: &ClusterState,
    header: &MsgHeader,
    src: &PacketSource<'_>,
    now: u64,
) {
    if header.master.is_some() {
        return;
    }
    let differs = state
        .nodes
        .get(&header.sender)
        .map(|n| n.read().slots != header.slots)
        .unwrap_or(false);
    if differs {
        slot_map::update_slots_config(state, &header.sender, header.config_epoch, &header.slots, now);
    }
    if let Some(owner_id) = slot_map::find_stale_claim(state, &header.slots, header.config_epoch)
        && owner_id != header.sender
        && let Some(owner) = state.nodes.get(&owner_id)
    {
        let (config_epoch, node_id, slots) = {
            let o = owner.read();
            (o.config_epoch, o.id.clone(), o.slots.clone())
        };
        debug!("Sending UPDATE about {node_id} to stale sender {}", header.sender);
        src.reply.send(ClusterMessage {
            header: build_header(state, MsgType::Update, MsgFlags::empty(), now),
            payload: MsgPayload::Update {
                config_epoch,
                node_id,
                slots,
            },
        });
    }
}

/// Ingests one gossip section. Failure reports are only trusted from master
/// senders; unknown, non-blacklisted nodes trigger a handshake provided the
/// sender itself is known.
pub(crate) fn process_gossip_section(
    state: &Arc<ClusterState>,
    sender: Option<&Arc<RwLock<ClusterNode>>>,
    entries: &[GossipEntry],
    now: u64,
) {
    let my_id = state.my_id();
    let sender_info = sender.map(|s| {
        let s = s.read();
        (s.id.clone(), s.is_master())
    });
    for entry in entries {
        if entry.id == my_id {
            continue;
        }
        match state.nodes.get(&entry.id) {
            Some(node) => {
                if let Some((sender_id, true)) = &sender_info {
                    if entry.flags.intersects(NodeFlags::FAIL | NodeFlags::PFAIL) {
                        failure::add_failure_report(&node, sender_id, now);
                        failure::try_promote_to_fail(state, &node, now);
                    } else {
                        failure::remove_failure_report(&node, sender_id);
                    }
                }
            }
            None => {
                if sender_info.is_some()
                    && !entry.flags.intersects(NodeFlags::NOADDR | NodeFlags::HANDSHAKE)
                    && !state.nodes.blacklist_contains(&entry.id, now)
                {
                    handshake_start(state, &entry.ip, entry.port, entry.bus_port, now);
                }
            }
        }
    }
}
