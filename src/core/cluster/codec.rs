// src/core/cluster/codec.rs

//! The cluster bus wire codec: fixed-header framing with the "RCmb"
//! signature, big-endian integers throughout, and per-type length sanity
//! checks. Malformed frames of a plausible size are dropped silently; a
//! broken signature or an implausible length poisons the stream and frees
//! the link.

use crate::core::PeridotError;
use crate::core::cluster::message::{
    ClusterMessage, GossipEntry, MSG_SIGNATURE, MsgFlags, MsgHeader, MsgPayload, MsgType,
    PROTOCOL_VERSION,
};
use crate::core::cluster::node::{NODE_ID_LEN, NodeFlags};
use crate::core::cluster::slot_map::{SLOT_BITMAP_BYTES, SlotBitmap};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Fixed size of the bus header, in bytes.
pub const HEADER_LEN: usize = 4 + 4 + 2 + 2 + 2 + 2   // sig, totlen, ver, type, count, flags
    + 8 + 8 + 8                                        // currentEpoch, configEpoch, replOffset
    + NODE_ID_LEN + SLOT_BITMAP_BYTES + NODE_ID_LEN    // sender, slots, master
    + IP_FIELD_LEN + 2 + 1 + 1; // ip, port, state, mflags

/// Fixed size of one gossip section entry.
pub const GOSSIP_ENTRY_LEN: usize = NODE_ID_LEN + 8 + 8 + IP_FIELD_LEN + 2 + 2 + 2;

/// Size of the NUL-padded address field (INET6_ADDRSTRLEN).
pub const IP_FIELD_LEN: usize = 46;

/// Upper bound for any frame; larger declared lengths poison the stream.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const UPDATE_PAYLOAD_LEN: usize = 8 + NODE_ID_LEN + SLOT_BITMAP_BYTES;

/// `tokio_util` codec for [`ClusterMessage`] frames.
#[derive(Debug, Default)]
pub struct BusCodec;

impl Encoder<ClusterMessage> for BusCodec {
    type Error = PeridotError;

    fn encode(&mut self, msg: ClusterMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = match &msg.payload {
            MsgPayload::Gossip(entries) => entries.len() * GOSSIP_ENTRY_LEN,
            MsgPayload::Fail { .. } => NODE_ID_LEN,
            MsgPayload::Publish { channel, message } => 8 + channel.len() + message.len(),
            MsgPayload::Update { .. } => UPDATE_PAYLOAD_LEN,
            MsgPayload::None => 0,
        };
        let totlen = HEADER_LEN + payload_len;
        if totlen > MAX_FRAME_LEN {
            return Err(PeridotError::ProtocolViolation(format!(
                "outgoing frame of {totlen} bytes exceeds the bus frame limit"
            )));
        }
        dst.reserve(totlen);

        let h = &msg.header;
        dst.put_slice(MSG_SIGNATURE);
        dst.put_u32(totlen as u32);
        dst.put_u16(PROTOCOL_VERSION);
        dst.put_u16(h.mtype as u16);
        dst.put_u16(msg.count());
        dst.put_u16(h.flags.bits());
        dst.put_u64(h.current_epoch);
        dst.put_u64(h.config_epoch);
        dst.put_u64(h.repl_offset);
        put_id(dst, Some(&h.sender));
        dst.put_slice(h.slots.as_bytes());
        put_id(dst, h.master.as_deref());
        put_ip(dst, &h.ip);
        dst.put_u16(h.port);
        dst.put_u8(if h.cluster_ok { 0 } else { 1 });
        dst.put_u8(h.mflags.bits());

        match &msg.payload {
            MsgPayload::Gossip(entries) => {
                for e in entries {
                    put_id(dst, Some(&e.id));
                    dst.put_u64(e.ping_sent);
                    dst.put_u64(e.pong_received);
                    put_ip(dst, &e.ip);
                    dst.put_u16(e.port);
                    dst.put_u16(e.bus_port);
                    dst.put_u16(e.flags.bits());
                }
            }
            MsgPayload::Fail { node_id } => put_id(dst, Some(node_id)),
            MsgPayload::Publish { channel, message } => {
                dst.put_u32(channel.len() as u32);
                dst.put_u32(message.len() as u32);
                dst.put_slice(channel);
                dst.put_slice(message);
            }
            MsgPayload::Update {
                config_epoch,
                node_id,
                slots,
            } => {
                dst.put_u64(*config_epoch);
                put_id(dst, Some(node_id));
                dst.put_slice(slots.as_bytes());
            }
            MsgPayload::None => {}
        }
        Ok(())
    }
}

impl Decoder for BusCodec {
    type Item = ClusterMessage;
    type Error = PeridotError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 8 {
                return Ok(None);
            }
            if &src[0..4] != MSG_SIGNATURE {
                return Err(PeridotError::ProtocolViolation(
                    "bad bus message signature".into(),
                ));
            }
            let totlen = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&totlen) {
                return Err(PeridotError::ProtocolViolation(format!(
                    "implausible bus frame length {totlen}"
                )));
            }
            if src.len() < totlen {
                src.reserve(totlen - src.len());
                return Ok(None);
            }
            let frame = src.split_to(totlen).freeze();
            match parse_frame(&frame) {
                Some(msg) => return Ok(Some(msg)),
                None => {
                    // Sanity check failed for this frame only; the stream
                    // itself is still aligned, so drop it and keep reading.
                    debug!("Dropping malformed bus frame of {totlen} bytes");
                    continue;
                }
            }
        }
    }
}

/// Parses a complete frame. Returns `None` on any sanity-check failure:
/// version mismatch, unknown type, a total length that does not match the
/// declared type, or an identity that is not 40 hex characters.
fn parse_frame(frame: &Bytes) -> Option<ClusterMessage> {
    let totlen = frame.len();
    let mut buf = &frame[8..]; // signature and totlen already validated

    let ver = buf.get_u16();
    if ver != PROTOCOL_VERSION {
        return None;
    }
    let mtype = MsgType::from_repr(buf.get_u16())?;
    let count = buf.get_u16() as usize;
    let flags = NodeFlags::from_bits_truncate(buf.get_u16());
    let current_epoch = buf.get_u64();
    let config_epoch = buf.get_u64();
    let repl_offset = buf.get_u64();
    let sender = get_id(&mut buf)??;
    let mut slot_bytes = [0u8; SLOT_BITMAP_BYTES];
    buf.copy_to_slice(&mut slot_bytes);
    let slots = SlotBitmap::from_bytes(&slot_bytes);
    let master = get_id(&mut buf)?;
    let ip = get_ip(&mut buf)?;
    let port = buf.get_u16();
    let cluster_ok = buf.get_u8() == 0;
    let mflags = MsgFlags::from_bits_truncate(buf.get_u8());

    let payload = match mtype {
        MsgType::Ping | MsgType::Pong | MsgType::Meet => {
            if totlen != HEADER_LEN + count * GOSSIP_ENTRY_LEN {
                return None;
            }
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let id = get_id(&mut buf)??;
                let ping_sent = buf.get_u64();
                let pong_received = buf.get_u64();
                let ip = get_ip(&mut buf)?;
                let port = buf.get_u16();
                let bus_port = buf.get_u16();
                let flags = NodeFlags::from_bits_truncate(buf.get_u16());
                entries.push(GossipEntry {
                    id,
                    ip,
                    port,
                    bus_port,
                    flags,
                    ping_sent,
                    pong_received,
                });
            }
            MsgPayload::Gossip(entries)
        }
        MsgType::Fail => {
            if totlen != HEADER_LEN + NODE_ID_LEN {
                return None;
            }
            MsgPayload::Fail {
                node_id: get_id(&mut buf)??,
            }
        }
        MsgType::Publish => {
            if totlen < HEADER_LEN + 8 {
                return None;
            }
            let channel_len = buf.get_u32() as usize;
            let message_len = buf.get_u32() as usize;
            if totlen != HEADER_LEN + 8 + channel_len + message_len {
                return None;
            }
            let start = HEADER_LEN + 8;
            MsgPayload::Publish {
                channel: frame.slice(start..start + channel_len),
                message: frame.slice(start + channel_len..start + channel_len + message_len),
            }
        }
        MsgType::Update => {
            if totlen != HEADER_LEN + UPDATE_PAYLOAD_LEN {
                return None;
            }
            let config_epoch = buf.get_u64();
            let node_id = get_id(&mut buf)??;
            let mut raw = [0u8; SLOT_BITMAP_BYTES];
            buf.copy_to_slice(&mut raw);
            MsgPayload::Update {
                config_epoch,
                node_id,
                slots: SlotBitmap::from_bytes(&raw),
            }
        }
        MsgType::FailoverAuthRequest | MsgType::FailoverAuthAck | MsgType::MfStart => {
            if totlen != HEADER_LEN {
                return None;
            }
            MsgPayload::None
        }
    };

    Some(ClusterMessage {
        header: MsgHeader {
            mtype,
            sender,
            flags,
            master,
            ip,
            port,
            cluster_ok,
            mflags,
            current_epoch,
            config_epoch,
            repl_offset,
            slots,
        },
        payload,
    })
}

fn put_id(dst: &mut BytesMut, id: Option<&str>) {
    match id {
        Some(id) => {
            debug_assert_eq!(id.len(), NODE_ID_LEN);
            dst.put_slice(id.as_bytes());
        }
        None => dst.put_bytes(0, NODE_ID_LEN),
    }
}

/// Reads a 40-byte identity field. The outer `Option` is the sanity check
/// (`None` = malformed frame); the inner one distinguishes an all-zero
/// "no node" field.
fn get_id(buf: &mut &[u8]) -> Option<Option<String>> {
    let raw = &buf[..NODE_ID_LEN];
    let id = if raw.iter().all(|&b| b == 0) {
        Some(None)
    } else if raw.iter().all(|b| b.is_ascii_hexdigit()) {
        Some(Some(String::from_utf8(raw.to_vec()).ok()?))
    } else {
        None
    };
    buf.advance(NODE_ID_LEN);
    id
}

fn put_ip(dst: &mut BytesMut, ip: &str) {
    let bytes = ip.as_bytes();
    let len = bytes.len().min(IP_FIELD_LEN);
    dst.put_slice(&bytes[..len]);
    dst.put_bytes(0, IP_FIELD_LEN - len);
}

fn get_ip(buf: &mut &[u8]) -> Option<String> {
    let raw = &buf[..IP_FIELD_LEN];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IP_FIELD_LEN);
    let ip = std::str::from_utf8(&raw[..end]).ok()?.to_string();
    buf.advance(IP_FIELD_LEN);
    Some(ip)
}
