// src/core/cluster/persistence.rs

//! The persisted node-view snapshot: one line per known node plus a trailing
//! `vars` line with the epoch counters. Writes go in place over the same
//! descriptor with newline padding before truncation, so a crash mid-write
//! leaves either the old or the new content readable. The file is held under
//! an exclusive advisory lock for the whole process lifetime.

use crate::core::PeridotError;
use crate::core::cluster::node::{ClusterNode, NODE_ID_LEN, NodeFlags};
use crate::core::cluster::slot_map::CLUSTER_SLOTS;
use crate::core::cluster::state::ClusterState;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info};

/// The node-view file, opened once and locked for the process lifetime.
#[derive(Debug)]
pub struct NodeConfFile {
    file: File,
    path: String,
}

impl NodeConfFile {
    /// Opens (or creates) the node-view file and takes the exclusive lock.
    /// A second process opening the same file fails immediately instead of
    /// corrupting the view.
    pub fn open(path: &str) -> Result<Self, PeridotError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(PeridotError::Persistence(format!(
                "Sorry, the cluster configuration file {path} is already used by a different \
                 cluster node ({})",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    pub fn read_all(&mut self) -> Result<String, PeridotError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut content = String::new();
        self.file.read_to_string(&mut content)?;
        Ok(content)
    }

    /// In-place rewrite: when the new content is shorter than the file, it
    /// is padded with newlines (ignored by the parser) up to the old length
    /// before the final truncation, so no torn partial line survives.
    pub fn write_padded(&mut self, content: &str, fsync: bool) -> Result<(), PeridotError> {
        let old_len = self.file.metadata()?.len() as usize;
        let mut payload = content.to_string();
        if payload.len() < old_len {
            payload.push_str(&"\n".repeat(old_len - payload.len()));
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(payload.as_bytes())?;
        self.file.set_len(payload.len() as u64)?;
        if fsync {
            self.file.sync_all()?;
        }
        debug!("Cluster config written to {}", self.path);
        Ok(())
    }
}

/// Serializes and writes the current node view. A failure here is fatal to
/// the caller: the node view is on the critical path for epoch bumps.
pub fn save(state: &ClusterState, fsync: bool) -> Result<(), PeridotError> {
    let mut guard = state.node_conf.lock();
    let Some(file) = guard.as_mut() else {
        return Ok(()); // ephemeral node, nothing to persist
    };
    let mut content = String::new();
    for node in state.nodes.snapshot() {
        let n = node.read();
        if n.in_handshake() {
            continue;
        }
        content.push_str(&format_node_line(state, &n));
        content.push('\n');
    }
    content.push_str(&format!(
        "vars currentEpoch {} lastVoteEpoch {}\n",
        state
            .current_epoch
            .load(std::sync::atomic::Ordering::Relaxed),
        state
            .last_vote_epoch
            .load(std::sync::atomic::Ordering::Relaxed),
    ));
    file.write_padded(&content, fsync)
}

/// One line of the snapshot (also the CLUSTER NODES output format):
/// identity, address, flags, master, ping/pong times, configEpoch, link
/// state, and the owned slots as compacted ranges. The migrating/importing
/// markers are only emitted for this node itself.
pub fn format_node_line(state: &ClusterState, n: &ClusterNode) -> String {
    let mut line = format!(
        "{} {}:{}@{} {} {} {} {} {} {}",
        n.id,
        n.ip,
        n.port,
        n.bus_port,
        flags_to_string(n.flags),
        n.replicaof.as_deref().unwrap_or("-"),
        n.ping_sent,
        n.pong_received,
        n.config_epoch,
        if n.is_myself() || n.link.is_some() {
            "connected"
        } else {
            "disconnected"
        },
    );
    for (start, end) in n.slots.ranges() {
        if start == end {
            line.push_str(&format!(" {start}"));
        } else {
            line.push_str(&format!(" {start}-{end}"));
        }
    }
    if n.is_myself() {
        for (slot, target) in state.slots.migrating_snapshot() {
            line.push_str(&format!(" [{slot}->-{target}]"));
        }
        for (slot, source) in state.slots.importing_snapshot() {
            line.push_str(&format!(" [{slot}-<-{source}]"));
        }
    }
    line
}

/// Parses a snapshot and loads it into a freshly constructed state. Any
/// malformed line is a fatal configuration-corruption error.
pub(crate) fn apply(state: &ClusterState, content: &str, now: u64) -> Result<(), PeridotError> {
    let mut found_myself = false;
    let mut parsed_current_epoch = 0u64;
    let mut parsed_last_vote = 0u64;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens[0] == "vars" {
            let mut pairs = tokens[1..].chunks_exact(2);
            for pair in &mut pairs {
                match pair[0] {
                    "currentEpoch" => parsed_current_epoch = parse_u64(pair[1], line)?,
                    "lastVoteEpoch" => parsed_last_vote = parse_u64(pair[1], line)?,
                    other => {
                        return Err(PeridotError::ConfigCorrupt(format!(
                            "unknown vars entry '{other}'"
                        )));
                    }
                }
            }
            continue;
        }
        if tokens.len() < 8 {
            return Err(PeridotError::ConfigCorrupt(format!(
                "truncated node line: '{line}'"
            )));
        }

        let id = tokens[0];
        if id.len() != NODE_ID_LEN || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PeridotError::ConfigCorrupt(format!("bad node id '{id}'")));
        }
        let (ip, port, bus_port) = parse_addr(tokens[1], line)?;
        let flags = flags_from_string(tokens[2], line)?;
        let replicaof = match tokens[3] {
            "-" => None,
            master => Some(master.to_string()),
        };
        let ping_sent = parse_u64(tokens[4], line)?;
        let pong_received = parse_u64(tokens[5], line)?;
        let config_epoch = parse_u64(tokens[6], line)?;
        // tokens[7] is the link state, purely informational on reload.

        let mut node = ClusterNode::new(id.to_string(), flags, now);
        node.ip = ip;
        node.port = port;
        node.bus_port = bus_port;
        node.replicaof = replicaof;
        node.ping_sent = ping_sent;
        node.pong_received = pong_received;
        node.config_epoch = config_epoch;

        let myself = flags.contains(NodeFlags::MYSELF);
        for token in &tokens[8..] {
            if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                let (slot, target, importing) = parse_reshard_marker(inner, line)?;
                if myself {
                    if importing {
                        state.slots.set_importing(slot, target);
                    } else {
                        state.slots.set_migrating(slot, target);
                    }
                }
                continue;
            }
            let (start, end) = parse_slot_range(token, line)?;
            for slot in start..=end {
                node.slots.set(slot);
                state.slots.set_owner(slot, Some(id.to_string()));
            }
        }

        if myself {
            if found_myself {
                return Err(PeridotError::ConfigCorrupt(
                    "more than one line carries the myself flag".into(),
                ));
            }
            found_myself = true;
            state.set_my_id(id.to_string());
        }
        state.nodes.insert(node);
    }

    if !found_myself {
        return Err(PeridotError::ConfigCorrupt(
            "no line carries the myself flag".into(),
        ));
    }

    // currentEpoch can never trail any configEpoch we know about.
    let max_config_epoch = state
        .nodes
        .snapshot()
        .iter()
        .map(|n| n.read().config_epoch)
        .max()
        .unwrap_or(0);
    state.current_epoch.store(
        parsed_current_epoch.max(max_config_epoch),
        std::sync::atomic::Ordering::Relaxed,
    );
    state
        .last_vote_epoch
        .store(parsed_last_vote, std::sync::atomic::Ordering::Relaxed);
    info!(
        "Loaded cluster view: {} nodes, currentEpoch {}",
        state.nodes.len(),
        parsed_current_epoch.max(max_config_epoch)
    );
    Ok(())
}

fn parse_u64(token: &str, line: &str) -> Result<u64, PeridotError> {
    token
        .parse::<u64>()
        .map_err(|_| PeridotError::ConfigCorrupt(format!("bad number '{token}' in '{line}'")))
}

fn parse_addr(token: &str, line: &str) -> Result<(String, u16, u16), PeridotError> {
    let corrupt = || PeridotError::ConfigCorrupt(format!("bad address '{token}' in '{line}'"));
    let (addr, bus) = token.rsplit_once('@').ok_or_else(corrupt)?;
    let (ip, port) = addr.rsplit_once(':').ok_or_else(corrupt)?;
    let port = port.parse::<u16>().map_err(|_| corrupt())?;
    let bus_port = bus.parse::<u16>().map_err(|_| corrupt())?;
    Ok((ip.to_string(), port, bus_port))
}

fn parse_slot_range(token: &str, line: &str) -> Result<(u16, u16), PeridotError> {
    let corrupt = || PeridotError::ConfigCorrupt(format!("bad slot token '{token}' in '{line}'"));
    let (start, end) = match token.split_once('-') {
        Some((a, b)) => (
            a.parse::<u16>().map_err(|_| corrupt())?,
            b.parse::<u16>().map_err(|_| corrupt())?,
        ),
        None => {
            let slot = token.parse::<u16>().map_err(|_| corrupt())?;
            (slot, slot)
        }
    };
    if start > end || end as usize >= CLUSTER_SLOTS {
        return Err(corrupt());
    }
    Ok((start, end))
}

/// Parses the inside of a `[slot->-target]` / `[slot-<-source]` marker.
fn parse_reshard_marker(inner: &str, line: &str) -> Result<(u16, String, bool), PeridotError> {
    let corrupt = || PeridotError::ConfigCorrupt(format!("bad reshard marker in '{line}'"));
    let (slot, rest, importing) = if let Some((slot, id)) = inner.split_once("->-") {
        (slot, id, false)
    } else if let Some((slot, id)) = inner.split_once("-<-") {
        (slot, id, true)
    } else {
        return Err(corrupt());
    };
    let slot = slot.parse::<u16>().map_err(|_| corrupt())?;
    if slot as usize >= CLUSTER_SLOTS || rest.len() != NODE_ID_LEN {
        return Err(corrupt());
    }
    Ok((slot, rest.to_string(), importing))
}

fn flags_to_string(flags: NodeFlags) -> String {
    let mut parts = Vec::new();
    if flags.contains(NodeFlags::MYSELF) {
        parts.push("myself");
    }
    if flags.contains(NodeFlags::MASTER) {
        parts.push("master");
    }
    if flags.contains(NodeFlags::REPLICA) {
        parts.push("slave");
    }
    if flags.contains(NodeFlags::PFAIL) {
        parts.push("fail?");
    }
    if flags.contains(NodeFlags::FAIL) {
        parts.push("fail");
    }
    if flags.contains(NodeFlags::HANDSHAKE) {
        parts.push("handshake");
    }
    if flags.contains(NodeFlags::NOADDR) {
        parts.push("noaddr");
    }
    if flags.contains(NodeFlags::MEET) {
        parts.push("meet");
    }
    if parts.is_empty() {
        "noflags".to_string()
    } else {
        parts.join(",")
    }
}

fn flags_from_string(token: &str, line: &str) -> Result<NodeFlags, PeridotError> {
    let mut flags = NodeFlags::empty();
    if token == "noflags" {
        return Ok(flags);
    }
    for part in token.split(',') {
        flags |= match part {
            "myself" => NodeFlags::MYSELF,
            "master" => NodeFlags::MASTER,
            "slave" => NodeFlags::REPLICA,
            "fail?" => NodeFlags::PFAIL,
            "fail" => NodeFlags::FAIL,
            "handshake" => NodeFlags::HANDSHAKE,
            "noaddr" => NodeFlags::NOADDR,
            "meet" => NodeFlags::MEET,
            other => {
                return Err(PeridotError::ConfigCorrupt(format!(
                    "unknown node flag '{other}' in '{line}'"
                )));
            }
        };
    }
    Ok(flags)
}
