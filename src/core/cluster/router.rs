// src/core/cluster/router.rs

//! Client-facing routing: maps a command's keys to a hash slot through the
//! static key-index table and decides between serving locally and the
//! MOVED/ASK/TRYAGAIN/CROSSSLOT/CLUSTERDOWN redirections.

use crate::core::PeridotError;
use crate::core::cluster::slot_map::key_hash_slot;
use crate::core::cluster::state::ClusterState;
use bitflags::bitflags;
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashMap;

bitflags! {
    /// Routing-relevant properties of a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u32 {
        /// The command modifies the dataset.
        const WRITE       = 1 << 0;
        /// The command only reads; replicas may serve it for READONLY clients.
        const READONLY    = 1 << 1;
        /// The command may always target an importing slot, as if the client
        /// had pre-sent ASKING.
        const ASKING_SAFE = 1 << 2;
    }
}

/// Key-index descriptor of one command, redis-style: 1-based first/last key
/// positions in the argv (0 = the command touches no keys; a negative last
/// counts from the end) and the step between keys.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub first_key: usize,
    pub last_key: i32,
    pub key_step: usize,
    pub flags: CommandFlags,
}

const fn spec(
    name: &'static str,
    first_key: usize,
    last_key: i32,
    key_step: usize,
    flags: CommandFlags,
) -> CommandSpec {
    CommandSpec {
        name,
        first_key,
        last_key,
        key_step,
        flags,
    }
}

const W: CommandFlags = CommandFlags::WRITE;
const R: CommandFlags = CommandFlags::READONLY;

static COMMAND_SPECS: &[CommandSpec] = &[
    // strings
    spec("get", 1, 1, 1, R),
    spec("set", 1, 1, 1, W),
    spec("setnx", 1, 1, 1, W),
    spec("setex", 1, 1, 1, W),
    spec("psetex", 1, 1, 1, W),
    spec("append", 1, 1, 1, W),
    spec("strlen", 1, 1, 1, R),
    spec("getset", 1, 1, 1, W),
    spec("getdel", 1, 1, 1, W),
    spec("getrange", 1, 1, 1, R),
    spec("setrange", 1, 1, 1, W),
    spec("incr", 1, 1, 1, W),
    spec("decr", 1, 1, 1, W),
    spec("incrby", 1, 1, 1, W),
    spec("decrby", 1, 1, 1, W),
    // multi-key
    spec("del", 1, -1, 1, W),
    spec("unlink", 1, -1, 1, W),
    spec("exists", 1, -1, 1, R),
    spec("mget", 1, -1, 1, R),
    spec("mset", 1, -1, 2, W),
    spec("msetnx", 1, -1, 2, W),
    // expiry & meta
    spec("ttl", 1, 1, 1, R),
    spec("pttl", 1, 1, 1, R),
    spec("expire", 1, 1, 1, W),
    spec("pexpire", 1, 1, 1, W),
    spec("persist", 1, 1, 1, W),
    spec("type", 1, 1, 1, R),
    // lists
    spec("lpush", 1, 1, 1, W),
    spec("rpush", 1, 1, 1, W),
    spec("lpop", 1, 1, 1, W),
    spec("rpop", 1, 1, 1, W),
    spec("llen", 1, 1, 1, R),
    spec("lrange", 1, 1, 1, R),
    // sets
    spec("sadd", 1, 1, 1, W),
    spec("srem", 1, 1, 1, W),
    spec("smembers", 1, 1, 1, R),
    spec("scard", 1, 1, 1, R),
    spec("sismember", 1, 1, 1, R),
    // hashes
    spec("hset", 1, 1, 1, W),
    spec("hget", 1, 1, 1, R),
    spec("hdel", 1, 1, 1, W),
    spec("hgetall", 1, 1, 1, R),
    spec("hmget", 1, 1, 1, R),
    // sorted sets
    spec("zadd", 1, 1, 1, W),
    spec("zrem", 1, 1, 1, W),
    spec("zscore", 1, 1, 1, R),
    spec("zrange", 1, 1, 1, R),
];

static COMMAND_TABLE: Lazy<HashMap<&'static str, &'static CommandSpec>> =
    Lazy::new(|| COMMAND_SPECS.iter().map(|s| (s.name, s)).collect());

pub fn lookup_spec(name: &str) -> Option<&'static CommandSpec> {
    COMMAND_TABLE.get(name).copied()
}

/// Extracts the keys of a command per its key-index descriptor. `argv`
/// includes the command name at position 0.
pub fn command_keys(spec: &CommandSpec, argv: &[Bytes]) -> Result<Vec<Bytes>, PeridotError> {
    if spec.first_key == 0 {
        return Ok(Vec::new());
    }
    let last = if spec.last_key < 0 {
        let idx = argv.len() as i32 + spec.last_key;
        if idx < spec.first_key as i32 {
            return Err(PeridotError::WrongArgumentCount(spec.name.to_string()));
        }
        idx as usize
    } else {
        spec.last_key as usize
    };
    if argv.len() <= spec.first_key || argv.len() <= last {
        return Err(PeridotError::WrongArgumentCount(spec.name.to_string()));
    }
    let mut keys = Vec::new();
    let mut i = spec.first_key;
    while i <= last {
        keys.push(argv[i].clone());
        i += spec.key_step;
    }
    Ok(keys)
}

/// Per-connection routing state owned by the embedding server. `asking` is
/// the one-shot flag set by the ASKING command; `readonly` is the sticky
/// READONLY mode for replica reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutingSession {
    pub asking: bool,
    pub readonly: bool,
}

/// Decides where a command may run. `Ok(())` means this node serves it; any
/// error is either a redirection or a cluster-down condition, formatted
/// exactly as the wire expects (minus the leading dash).
pub fn route(
    state: &ClusterState,
    argv: &[Bytes],
    session: &RoutingSession,
) -> Result<(), PeridotError> {
    let Some(first) = argv.first() else {
        return Ok(());
    };
    let name = String::from_utf8_lossy(first).to_ascii_lowercase();
    let Some(spec) = lookup_spec(&name) else {
        // Keyless or unknown commands are the embedder's business.
        return Ok(());
    };
    let keys = command_keys(spec, argv)?;
    if keys.is_empty() {
        return Ok(());
    }

    let slot = key_hash_slot(&keys[0]);
    if keys.len() > 1 && !keys.iter().all(|k| key_hash_slot(k) == slot) {
        return Err(PeridotError::CrossSlot);
    }

    let Some(owner_id) = state.slots.owner(slot) else {
        return Err(PeridotError::ClusterDown("Hash slot not served".into()));
    };
    if !state.state_ok() {
        return Err(PeridotError::ClusterDown("The cluster is down".into()));
    }

    let my_id = state.my_id();
    if owner_id == my_id {
        // MIGRATING: keys that already moved are answered with ASK.
        if let Some(target_id) = state.slots.migrating_to(slot)
            && keys.iter().any(|k| !state.keyspace.key_exists(k))
        {
            return Err(PeridotError::Ask {
                slot,
                addr: node_addr(state, &target_id)?,
            });
        }
        return Ok(());
    }

    // IMPORTING: served when the client pre-sent ASKING (or the command is
    // asking-safe), except that multi-key requests with missing keys must be
    // retried once the reshard settles.
    if state.slots.importing_from(slot).is_some()
        && (session.asking || spec.flags.contains(CommandFlags::ASKING_SAFE))
    {
        if keys.len() > 1 && keys.iter().any(|k| !state.keyspace.key_exists(k)) {
            return Err(PeridotError::TryAgain);
        }
        return Ok(());
    }

    // A read-only replica of the owner serves reads for READONLY clients.
    if session.readonly && spec.flags.contains(CommandFlags::READONLY) {
        let myself = state.myself();
        let me = myself.read();
        if me.is_replica() && me.replicaof.as_deref() == Some(owner_id.as_str()) {
            return Ok(());
        }
    }

    Err(PeridotError::Moved {
        slot,
        addr: node_addr(state, &owner_id)?,
    })
}

fn node_addr(state: &ClusterState, id: &str) -> Result<String, PeridotError> {
    state
        .nodes
        .get(id)
        .map(|n| n.read().addr())
        .ok_or_else(|| PeridotError::ClusterDown(format!("Slot owner {id} not known")))
}
