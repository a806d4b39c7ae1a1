// src/core/cluster/failover.rs

//! Replica-initiated failover: the epoch-ordered election with its ranked
//! start delay and per-epoch vote, plus the manual-failover handshake
//! (MFSTART, client pause, offset catch-up) and the voteless takeover.

use crate::core::PeridotError;
use crate::core::cluster::gossip;
use crate::core::cluster::message::{ClusterMessage, MsgFlags, MsgPayload, MsgType};
use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::state::{ClusterState, TodoFlags};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Fixed part of the random election delay.
const ELECTION_FIXED_DELAY_MS: u64 = 500;

/// Drives the election state machine. Called from the cron every tick and
/// from the before-sleep hook whenever a packet flagged failover progress.
pub fn replica_failover_cron(state: &Arc<ClusterState>, now: u64) {
    let (is_replica, master_id) = {
        let myself = state.myself();
        let me = myself.read();
        (me.is_replica(), me.replicaof.clone())
    };
    if !is_replica {
        return;
    }
    let Some(master_id) = master_id else {
        return;
    };
    let Some(master_arc) = state.nodes.get(&master_id) else {
        return;
    };
    let manual = {
        let mf = state.manual_failover.lock();
        mf.in_progress() && mf.can_start
    };
    let (master_failed, master_slots, master_pong) = {
        let m = master_arc.read();
        (m.flags.contains(NodeFlags::FAIL), m.slots.count(), m.pong_received)
    };
    let timeout = state.config.node_timeout;

    if (!master_failed && !manual) || master_slots == 0 {
        let mut el = state.election.lock();
        if el.auth_time != 0 {
            el.reset();
        }
        return;
    }

    let auth_timeout = (timeout * 2).max(2000);
    let auth_retry = (timeout * 4).max(4000);
    let my_offset = state.keyspace.replication_get_replica_offset();

    // Data freshness: a replica whose view of the master is too old must
    // not win an election and roll the dataset back.
    if !manual && state.config.replica_validity_factor != 0 {
        let mut data_age = now.saturating_sub(master_pong);
        if data_age > timeout {
            data_age -= timeout;
        }
        let limit = state.config.repl_ping_replica_period * 1000
            + timeout * state.config.replica_validity_factor;
        if data_age > limit {
            debug!("Not starting an election: replica data too old ({data_age} > {limit} ms)");
            return;
        }
    }

    let mut el = state.election.lock();
    if el.auth_time == 0 || now > el.auth_time + auth_retry {
        let rank = if manual {
            0
        } else {
            election_rank(state, &master_id, my_offset)
        };
        el.auth_time = if manual {
            now
        } else {
            let jitter = rand::thread_rng().gen_range(0..ELECTION_FIXED_DELAY_MS);
            now + ELECTION_FIXED_DELAY_MS + jitter + rank * 1000
        };
        el.auth_count = 0;
        el.auth_sent = false;
        el.auth_rank = rank;
        info!(
            "Start of election delayed for {} ms, rank {rank}, offset {my_offset}.",
            el.auth_time.saturating_sub(now)
        );
        drop(el);
        // Tell co-replicas our offset so their ranks stay accurate.
        broadcast_offset_to_replicas(state, &master_id, now);
        return;
    }

    // While waiting, other replicas may advertise fresher offsets; the delay
    // only ever grows, never shrinks.
    if !el.auth_sent && !manual {
        let new_rank = election_rank(state, &master_id, my_offset);
        if new_rank > el.auth_rank {
            let added = (new_rank - el.auth_rank) * 1000;
            el.auth_time += added;
            el.auth_rank = new_rank;
            info!("Replica rank updated to {new_rank}, added {added} ms of delay.");
        }
    }

    if now < el.auth_time {
        return;
    }
    if now.saturating_sub(el.auth_time) > auth_timeout {
        // Attempt expired without a quorum; the retry window above will
        // schedule a new one.
        return;
    }
    if !el.auth_sent {
        let epoch = state.next_epoch();
        el.auth_epoch = epoch;
        el.auth_sent = true;
        drop(el);
        state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
        info!("Starting a failover election for epoch {epoch}.");
        let mflags = if manual {
            MsgFlags::FORCEACK
        } else {
            MsgFlags::empty()
        };
        let msg = ClusterMessage {
            header: gossip::build_header(state, MsgType::FailoverAuthRequest, mflags, now),
            payload: MsgPayload::None,
        };
        gossip::broadcast_message(state, &msg);
    }
}

/// The number of co-replicas of the same master with a strictly greater
/// replication offset; better-synced replicas start their elections first.
fn election_rank(state: &ClusterState, master_id: &str, my_offset: u64) -> u64 {
    let my_id = state.my_id();
    state
        .replicas_of(master_id)
        .iter()
        .filter(|n| {
            let n = n.read();
            n.id != my_id && n.repl_offset > my_offset
        })
        .count() as u64
}

fn broadcast_offset_to_replicas(state: &ClusterState, master_id: &str, now: u64) {
    let my_id = state.my_id();
    let msg = gossip::build_ping_msg(state, MsgType::Pong, now);
    for replica in state.replicas_of(master_id) {
        let r = replica.read();
        if r.id == my_id {
            continue;
        }
        if let Some(link) = &r.link {
            link.send(msg.clone());
        }
    }
}

/// The voter side of the election. Grants at most one vote per currentEpoch
/// and replies with an AUTH_ACK when every §grant rule passes; every refusal
/// is logged with its reason.
pub fn handle_auth_request(
    state: &Arc<ClusterState>,
    header: &crate::core::cluster::message::MsgHeader,
    reply: &crate::core::cluster::node::LinkHandle,
    now: u64,
) {
    let req_epoch = header.current_epoch;
    let force = header.mflags.contains(MsgFlags::FORCEACK);
    let (am_master, my_slots) = {
        let myself = state.myself();
        let me = myself.read();
        (me.is_master(), me.slots.count())
    };
    if !am_master || my_slots == 0 {
        debug!(
            "Ignoring failover auth request from {}: I am not a slot-serving master",
            header.sender
        );
        return;
    }
    let cur_epoch = state.current_epoch.load(Ordering::Relaxed);
    if req_epoch < cur_epoch {
        warn!(
            "Failover auth denied to {}: reqEpoch ({req_epoch}) < curEpoch ({cur_epoch})",
            header.sender
        );
        return;
    }
    if state.last_vote_epoch.load(Ordering::Relaxed) == cur_epoch {
        warn!(
            "Failover auth denied to {}: already voted for epoch {cur_epoch}",
            header.sender
        );
        return;
    }
    let Some(candidate) = state.nodes.get(&header.sender) else {
        return;
    };
    let master_id = {
        let c = candidate.read();
        if !c.is_replica() {
            warn!("Failover auth denied to {}: it is not a replica", header.sender);
            return;
        }
        c.replicaof.clone()
    };
    let Some(master_id) = master_id else {
        return;
    };
    let Some(master_arc) = state.nodes.get(&master_id) else {
        warn!(
            "Failover auth denied to {}: unknown master {master_id}",
            header.sender
        );
        return;
    };
    {
        let m = master_arc.read();
        if !force && !m.flags.contains(NodeFlags::FAIL) {
            warn!(
                "Failover auth denied to {}: its master {master_id} is not failing",
                header.sender
            );
            return;
        }
        if now.saturating_sub(m.voted_time) < state.config.node_timeout * 2 {
            warn!(
                "Failover auth denied to {}: a replica of {master_id} received a vote recently",
                header.sender
            );
            return;
        }
    }
    // Every slot the candidate claims must be unowned, owned by its failed
    // master, or tagged with an epoch no newer than the request's.
    for slot in header.slots.iter() {
        let Some(owner_id) = state.slots.owner(slot) else {
            continue;
        };
        if owner_id == master_id {
            continue;
        }
        let owner_epoch = state
            .nodes
            .get(&owner_id)
            .map(|n| n.read().config_epoch)
            .unwrap_or(0);
        if owner_epoch <= header.config_epoch {
            continue;
        }
        warn!(
            "Failover auth denied to {}: slot {slot} has a newer configuration than the request",
            header.sender
        );
        return;
    }

    state.last_vote_epoch.store(cur_epoch, Ordering::Relaxed);
    master_arc.write().voted_time = now;
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG);
    info!(
        "Failover auth granted to {} for epoch {req_epoch}",
        header.sender
    );
    reply.send(ClusterMessage {
        header: gossip::build_header(state, MsgType::FailoverAuthAck, MsgFlags::empty(), now),
        payload: MsgPayload::None,
    });
}

/// The candidate side: counts ACKs from slot-serving masters for the current
/// attempt and performs the win once the quorum is collected.
pub fn handle_auth_ack(
    state: &Arc<ClusterState>,
    header: &crate::core::cluster::message::MsgHeader,
    now: u64,
) {
    {
        let Some(sender) = state.nodes.get(&header.sender) else {
            return;
        };
        let s = sender.read();
        if !s.is_master() || s.slots.is_empty() {
            return;
        }
    }
    let needed = state.quorum() as u64;
    let epoch_won = {
        let mut el = state.election.lock();
        if !el.auth_sent {
            return;
        }
        if header.current_epoch < el.auth_epoch {
            debug!(
                "Ignoring stale failover auth from {} (epoch {} < {})",
                header.sender, header.current_epoch, el.auth_epoch
            );
            return;
        }
        el.auth_count += 1;
        info!(
            "Failover auth received from {} ({}/{needed})",
            header.sender, el.auth_count
        );
        if el.auth_count < needed {
            return;
        }
        let epoch = el.auth_epoch;
        el.reset();
        epoch
    };
    info!("Failover election won for epoch {epoch_won}.");
    failover_win(state, epoch_won, now);
}

/// Election step 5 (also the tail of a takeover): adopt the election epoch
/// as our configEpoch, reclaim every slot of the former master, detach
/// replication, tell everyone with a PONG broadcast, and persist.
pub fn failover_win(state: &Arc<ClusterState>, epoch: u64, now: u64) {
    let Some(old_master_id) = state.my_master_id() else {
        return;
    };
    let my_id = state.my_id();
    state.observe_current_epoch(epoch);
    state.myself().write().config_epoch = epoch;

    let reclaimed: Vec<u16> = state
        .nodes
        .get(&old_master_id)
        .map(|m| m.read().slots.iter().collect())
        .unwrap_or_default();
    for slot in &reclaimed {
        state.assign_slot(*slot, Some(&my_id));
    }
    state.become_master();
    state.election.lock().reset();
    state.manual_failover.lock().reset();
    state.todo_set(TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG | TodoFlags::UPDATE_STATE);
    gossip::broadcast_pong(state, now);
    info!(
        "I am the new master (epoch {epoch}), took over {} slots from {old_master_id}",
        reclaimed.len()
    );
}

// --- Manual failover ---

/// CLUSTER FAILOVER entry point on the replica. Without FORCE the master is
/// asked to pause clients first; FORCE skips the offset synchronization and
/// goes straight to a (still voted) election.
pub fn start_manual_failover(
    state: &Arc<ClusterState>,
    now: u64,
    force: bool,
) -> Result<(), PeridotError> {
    let (is_replica, master_id) = {
        let myself = state.myself();
        let me = myself.read();
        (me.is_replica(), me.replicaof.clone())
    };
    if !is_replica {
        return Err(PeridotError::InvalidState(
            "You should send CLUSTER FAILOVER to a replica".into(),
        ));
    }
    let Some(master_id) = master_id else {
        return Err(PeridotError::InvalidState(
            "I have no master to fail over".into(),
        ));
    };
    let Some(master_arc) = state.nodes.get(&master_id) else {
        return Err(PeridotError::UnknownNode(master_id));
    };
    if !force && master_arc.read().flags.contains(NodeFlags::FAIL) {
        return Err(PeridotError::InvalidState(
            "Master is down; use CLUSTER FAILOVER FORCE".into(),
        ));
    }
    {
        let mut mf = state.manual_failover.lock();
        if mf.in_progress() {
            return Err(PeridotError::InvalidState(
                "A manual failover is already in progress".into(),
            ));
        }
        mf.end_time = now + state.config.manual_failover_timeout;
        mf.can_start = force;
        mf.master_offset = 0;
        mf.replica = None;
    }
    if force {
        info!("Forced manual failover started (no offset synchronization).");
        state.todo_set(TodoFlags::HANDLE_FAILOVER);
    } else {
        info!("Manual failover started; asking the master to pause clients.");
        let msg = ClusterMessage {
            header: gossip::build_header(state, MsgType::MfStart, MsgFlags::empty(), now),
            payload: MsgPayload::None,
        };
        if let Some(link) = &master_arc.read().link {
            link.send(msg);
        }
    }
    Ok(())
}

/// The master side of MFSTART: pause client writes and start flagging our
/// pings PAUSED so the replica can observe the frozen offset.
pub fn handle_mfstart(state: &Arc<ClusterState>, sender_id: &str, now: u64) {
    if !state.is_master() {
        return;
    }
    let is_my_replica = state
        .nodes
        .get(sender_id)
        .map(|n| n.read().replicaof.as_deref() == Some(state.my_id().as_str()))
        .unwrap_or(false);
    if !is_my_replica {
        return;
    }
    let mut mf = state.manual_failover.lock();
    if mf.in_progress() {
        return;
    }
    mf.end_time = now + state.config.manual_failover_timeout;
    mf.replica = Some(sender_id.to_string());
    let deadline = mf.end_time;
    drop(mf);
    state.keyspace.pause_clients(deadline);
    info!("Manual failover requested by replica {sender_id}; pausing clients.");
}

/// The replica side of the offset handshake: a PAUSED ping from our master
/// tells us its frozen offset; once we processed that much of the stream,
/// the election may start with zero delay and FORCEACK.
pub fn manual_failover_observe_master(state: &Arc<ClusterState>, sender_id: &str, offset: u64) {
    if state.my_master_id().as_deref() != Some(sender_id) {
        return;
    }
    let mut mf = state.manual_failover.lock();
    if !mf.in_progress() || mf.can_start {
        return;
    }
    if mf.master_offset == 0 {
        mf.master_offset = offset;
        info!("Received replication offset {offset} for paused master during manual failover.");
    }
    if state.keyspace.replication_get_replica_offset() >= mf.master_offset {
        mf.can_start = true;
        info!("All master replication stream processed; manual failover can start.");
        drop(mf);
        state.todo_set(TodoFlags::HANDLE_FAILOVER);
    }
}

/// Discards every bit of manual-failover state once the window closes.
pub fn manual_failover_cron(state: &Arc<ClusterState>, now: u64) {
    let mut mf = state.manual_failover.lock();
    if mf.in_progress() && now > mf.end_time {
        warn!("Manual failover timed out.");
        mf.reset();
    }
}

/// CLUSTER FAILOVER TAKEOVER: no handshake and no vote. Bump the epoch
/// unilaterally and claim the master's slots; the epoch collision resolver
/// repairs any tie this races into.
pub fn takeover(state: &Arc<ClusterState>, now: u64) -> Result<(), PeridotError> {
    let (is_replica, has_master) = {
        let myself = state.myself();
        let me = myself.read();
        (me.is_replica(), me.replicaof.is_some())
    };
    if !is_replica || !has_master {
        return Err(PeridotError::InvalidState(
            "You should send CLUSTER FAILOVER to a replica".into(),
        ));
    }
    warn!("Taking over the master without consensus.");
    let epoch = state.bump_config_epoch();
    failover_win(state, epoch, now);
    Ok(())
}
