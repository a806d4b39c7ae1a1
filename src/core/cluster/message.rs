// src/core/cluster/message.rs

//! In-memory representation of cluster bus messages. The byte layout lives
//! in the codec; this module only models the fixed header, the gossip
//! section, and the per-type payloads.

use crate::core::cluster::node::NodeFlags;
use crate::core::cluster::slot_map::SlotBitmap;
use bitflags::bitflags;
use bytes::Bytes;
use strum_macros::{Display, FromRepr};

/// Magic signature opening every bus frame.
pub const MSG_SIGNATURE: &[u8; 4] = b"RCmb";

/// Bus protocol version. Frames with any other version are dropped.
pub const PROTOCOL_VERSION: u16 = 1;

/// The wire type tag of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u16)]
pub enum MsgType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    FailoverAuthRequest = 5,
    FailoverAuthAck = 6,
    MfStart = 7,
    Update = 8,
}

bitflags! {
    /// Per-message flags carried in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// The sending master has paused clients for a manual failover.
        const PAUSED   = 1 << 0;
        /// Vote even if the master is not flagged FAIL (manual failover).
        const FORCEACK = 1 << 1;
    }
}

/// One gossip section entry: a thumbnail of another node as seen by the
/// sender, including the sender's own liveness timestamps for it.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipEntry {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub bus_port: u16,
    pub flags: NodeFlags,
    pub ping_sent: u64,
    pub pong_received: u64,
}

/// The fixed header present on every bus message.
#[derive(Debug, Clone)]
pub struct MsgHeader {
    pub mtype: MsgType,
    /// Sender's 40-hex identity.
    pub sender: String,
    /// Sender's node flags.
    pub flags: NodeFlags,
    /// The sender's master identity, if the sender is a replica.
    pub master: Option<String>,
    /// Announced address of the sender. The bus port is the client port
    /// plus the bus offset.
    pub ip: String,
    pub port: u16,
    /// Sender's view of the aggregate cluster state.
    pub cluster_ok: bool,
    pub mflags: MsgFlags,
    pub current_epoch: u64,
    pub config_epoch: u64,
    pub repl_offset: u64,
    /// The sender's master-view slot bitmap: its own claims when it is a
    /// master, its master's claims when it is a replica.
    pub slots: SlotBitmap,
}

/// The discriminated payload following the header.
#[derive(Debug, Clone)]
pub enum MsgPayload {
    /// PING/PONG/MEET: a random subset of node hints.
    Gossip(Vec<GossipEntry>),
    /// FAIL: the identity of the node confirmed as failed.
    Fail { node_id: String },
    /// PUBLISH: a pub/sub payload forwarded across the bus.
    Publish { channel: Bytes, message: Bytes },
    /// UPDATE: the authoritative config record of one master.
    Update {
        config_epoch: u64,
        node_id: String,
        slots: SlotBitmap,
    },
    /// AUTH_REQUEST/AUTH_ACK/MFSTART carry the header alone.
    None,
}

/// A complete bus message.
#[derive(Debug, Clone)]
pub struct ClusterMessage {
    pub header: MsgHeader,
    pub payload: MsgPayload,
}

impl ClusterMessage {
    /// The number of gossip entries, as encoded in the header count field.
    pub fn count(&self) -> u16 {
        match &self.payload {
            MsgPayload::Gossip(entries) => entries.len() as u16,
            _ => 0,
        }
    }
}
