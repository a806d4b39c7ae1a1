// src/core/cluster/commands/mod.rs

//! Implements the `CLUSTER` command dispatcher and its subcommands. Parsing
//! works on the raw argument vector (everything after the `CLUSTER` word);
//! the embedding server owns the client protocol.

mod addslots;
mod failover_cmd;
mod forget;
mod info;
mod keyslot;
mod meet;
mod nodes;
mod replicate;
mod reset;
mod setslot;

use crate::core::cluster::slot_map::CLUSTER_SLOTS;
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use bytes::Bytes;
use std::sync::Arc;

/// The mode argument of `CLUSTER FAILOVER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverMode {
    /// Coordinate with the master: pause clients, sync offsets, then elect.
    Default,
    /// Skip the offset handshake but still require the vote.
    Force,
    /// No handshake, no vote; unilateral epoch bump.
    Takeover,
}

/// The sub-options of `CLUSTER SETSLOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotOp {
    Migrating(String),
    Importing(String),
    Node(String),
    Stable,
}

/// All supported `CLUSTER` subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSubcommand {
    Meet { host: String, port: u16 },
    Forget(String),
    Nodes,
    Slots,
    MyId,
    FlushSlots,
    AddSlots(Vec<u16>),
    DelSlots(Vec<u16>),
    SetSlot { slot: u16, op: SetSlotOp },
    Info,
    SaveConfig,
    KeySlot(Bytes),
    CountKeysInSlot(u16),
    GetKeysInSlot { slot: u16, count: usize },
    Replicate(String),
    Replicas(String),
    CountFailureReports(String),
    Failover(FailoverMode),
    SetConfigEpoch(u64),
    Reset { hard: bool },
}

impl ClusterSubcommand {
    /// Parses the arguments following the `CLUSTER` word.
    pub fn parse(args: &[Bytes]) -> Result<Self, PeridotError> {
        if args.is_empty() {
            return Err(PeridotError::WrongArgumentCount("CLUSTER".to_string()));
        }
        let sub = arg_str(args, 0)?.to_ascii_lowercase();
        let cmd = match sub.as_str() {
            "nodes" => exact(args, 1, "CLUSTER NODES", Self::Nodes)?,
            "slots" => exact(args, 1, "CLUSTER SLOTS", Self::Slots)?,
            "myid" => exact(args, 1, "CLUSTER MYID", Self::MyId)?,
            "info" => exact(args, 1, "CLUSTER INFO", Self::Info)?,
            "saveconfig" => exact(args, 1, "CLUSTER SAVECONFIG", Self::SaveConfig)?,
            "flushslots" => exact(args, 1, "CLUSTER FLUSHSLOTS", Self::FlushSlots)?,
            "meet" => {
                if args.len() != 3 {
                    return Err(PeridotError::WrongArgumentCount("CLUSTER MEET".to_string()));
                }
                Self::Meet {
                    host: arg_str(args, 1)?,
                    port: arg_str(args, 2)?.parse()?,
                }
            }
            "forget" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER FORGET".to_string(),
                    ));
                }
                Self::Forget(arg_str(args, 1)?)
            }
            "addslots" | "delslots" => {
                if args.len() < 2 {
                    return Err(PeridotError::WrongArgumentCount(format!(
                        "CLUSTER {}",
                        sub.to_ascii_uppercase()
                    )));
                }
                let slots = args[1..]
                    .iter()
                    .map(parse_slot)
                    .collect::<Result<Vec<_>, _>>()?;
                if sub == "addslots" {
                    Self::AddSlots(slots)
                } else {
                    Self::DelSlots(slots)
                }
            }
            "setslot" => {
                if args.len() < 3 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER SETSLOT".to_string(),
                    ));
                }
                let slot = parse_slot(&args[1])?;
                let op_str = arg_str(args, 2)?.to_ascii_lowercase();
                let op = match op_str.as_str() {
                    "migrating" | "importing" | "node" if args.len() != 4 => {
                        return Err(PeridotError::SyntaxError);
                    }
                    "stable" if args.len() != 3 => return Err(PeridotError::SyntaxError),
                    "migrating" => SetSlotOp::Migrating(arg_str(args, 3)?),
                    "importing" => SetSlotOp::Importing(arg_str(args, 3)?),
                    "node" => SetSlotOp::Node(arg_str(args, 3)?),
                    "stable" => SetSlotOp::Stable,
                    _ => return Err(PeridotError::SyntaxError),
                };
                Self::SetSlot { slot, op }
            }
            "keyslot" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER KEYSLOT".to_string(),
                    ));
                }
                Self::KeySlot(args[1].clone())
            }
            "countkeysinslot" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER COUNTKEYSINSLOT".to_string(),
                    ));
                }
                Self::CountKeysInSlot(parse_slot(&args[1])?)
            }
            "getkeysinslot" => {
                if args.len() != 3 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER GETKEYSINSLOT".to_string(),
                    ));
                }
                Self::GetKeysInSlot {
                    slot: parse_slot(&args[1])?,
                    count: arg_str(args, 2)?.parse().map_err(|_| PeridotError::NotAnInteger)?,
                }
            }
            "replicate" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER REPLICATE".to_string(),
                    ));
                }
                Self::Replicate(arg_str(args, 1)?)
            }
            "slaves" | "replicas" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER SLAVES".to_string(),
                    ));
                }
                Self::Replicas(arg_str(args, 1)?)
            }
            "count-failure-reports" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER COUNT-FAILURE-REPORTS".to_string(),
                    ));
                }
                Self::CountFailureReports(arg_str(args, 1)?)
            }
            "failover" => {
                let mode = match args.len() {
                    1 => FailoverMode::Default,
                    2 => match arg_str(args, 1)?.to_ascii_lowercase().as_str() {
                        "force" => FailoverMode::Force,
                        "takeover" => FailoverMode::Takeover,
                        _ => return Err(PeridotError::SyntaxError),
                    },
                    _ => {
                        return Err(PeridotError::WrongArgumentCount(
                            "CLUSTER FAILOVER".to_string(),
                        ));
                    }
                };
                Self::Failover(mode)
            }
            "set-config-epoch" => {
                if args.len() != 2 {
                    return Err(PeridotError::WrongArgumentCount(
                        "CLUSTER SET-CONFIG-EPOCH".to_string(),
                    ));
                }
                Self::SetConfigEpoch(
                    arg_str(args, 1)?.parse().map_err(|_| PeridotError::NotAnInteger)?,
                )
            }
            "reset" => {
                let hard = match args.len() {
                    1 => false,
                    2 => match arg_str(args, 1)?.to_ascii_lowercase().as_str() {
                        "hard" => true,
                        "soft" => false,
                        _ => return Err(PeridotError::SyntaxError),
                    },
                    _ => {
                        return Err(PeridotError::WrongArgumentCount(
                            "CLUSTER RESET".to_string(),
                        ));
                    }
                };
                Self::Reset { hard }
            }
            other => {
                return Err(PeridotError::InvalidRequest(format!(
                    "Unknown CLUSTER subcommand '{other}'"
                )));
            }
        };
        Ok(cmd)
    }
}

/// Executes a parsed `CLUSTER` subcommand against the engine state.
pub fn execute(
    state: &Arc<ClusterState>,
    cmd: ClusterSubcommand,
) -> Result<Reply, PeridotError> {
    match cmd {
        ClusterSubcommand::Meet { host, port } => meet::execute(state, &host, port),
        ClusterSubcommand::Forget(id) => forget::execute(state, &id),
        ClusterSubcommand::Nodes => nodes::nodes(state),
        ClusterSubcommand::Slots => nodes::slots(state),
        ClusterSubcommand::MyId => Ok(Reply::bulk_from(state.my_id())),
        ClusterSubcommand::FlushSlots => addslots::flushslots(state),
        ClusterSubcommand::AddSlots(slots) => addslots::addslots(state, &slots),
        ClusterSubcommand::DelSlots(slots) => addslots::delslots(state, &slots),
        ClusterSubcommand::SetSlot { slot, op } => setslot::execute(state, slot, &op),
        ClusterSubcommand::Info => info::execute(state),
        ClusterSubcommand::SaveConfig => {
            state.save_config(true)?;
            Ok(Reply::Ok)
        }
        ClusterSubcommand::KeySlot(key) => keyslot::keyslot(&key),
        ClusterSubcommand::CountKeysInSlot(slot) => keyslot::countkeysinslot(state, slot),
        ClusterSubcommand::GetKeysInSlot { slot, count } => {
            keyslot::getkeysinslot(state, slot, count)
        }
        ClusterSubcommand::Replicate(id) => replicate::replicate(state, &id),
        ClusterSubcommand::Replicas(id) => replicate::replicas(state, &id),
        ClusterSubcommand::CountFailureReports(id) => info::count_failure_reports(state, &id),
        ClusterSubcommand::Failover(mode) => failover_cmd::execute(state, mode),
        ClusterSubcommand::SetConfigEpoch(epoch) => reset::set_config_epoch(state, epoch),
        ClusterSubcommand::Reset { hard } => reset::execute(state, hard),
    }
}

fn exact(
    args: &[Bytes],
    want: usize,
    name: &str,
    cmd: ClusterSubcommand,
) -> Result<ClusterSubcommand, PeridotError> {
    if args.len() != want {
        return Err(PeridotError::WrongArgumentCount(name.to_string()));
    }
    Ok(cmd)
}

fn arg_str(args: &[Bytes], index: usize) -> Result<String, PeridotError> {
    args.get(index)
        .map(|b| String::from_utf8_lossy(b).to_string())
        .ok_or(PeridotError::SyntaxError)
}

/// Every operator-facing slot number is validated against [0, 16383].
fn parse_slot(raw: &Bytes) -> Result<u16, PeridotError> {
    let s = std::str::from_utf8(raw).map_err(|_| PeridotError::InvalidSlot)?;
    let slot: u64 = s.parse().map_err(|_| PeridotError::InvalidSlot)?;
    if slot >= CLUSTER_SLOTS as u64 {
        return Err(PeridotError::InvalidSlot);
    }
    Ok(slot as u16)
}
