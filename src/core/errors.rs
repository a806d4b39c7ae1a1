// src/core/errors.rs

//! Defines the primary error type for the cluster engine.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum PeridotError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Syntax error")]
    SyntaxError,

    #[error("Wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("Invalid or out of range slot")]
    InvalidSlot,

    #[error("Unknown node {0}")]
    UnknownNode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Malformed cluster config file: {0}")]
    ConfigCorrupt(String),

    #[error("Cluster bus protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("Replication Error: {0}")]
    ReplicationError(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    // --- Redirections ---
    /// The keys of the request hash to a slot served by a different node.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// A one-shot redirect for a slot that is currently being migrated away.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    /// A multi-key command was attempted on keys in different slots.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// A multi-key request hit a slot in the middle of a resharding.
    #[error("TRYAGAIN Multiple keys request during rehashing of slot")]
    TryAgain,

    /// The cluster is down or a slot is unassigned.
    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),
}

impl PeridotError {
    /// The exact error line an embedding server should put on the wire,
    /// including the leading dash of the error marker.
    pub fn wire_line(&self) -> String {
        format!("-{self}")
    }

    /// Whether this error is a cluster redirection rather than a failure.
    pub fn is_redirection(&self) -> bool {
        matches!(
            self,
            PeridotError::Moved { .. }
                | PeridotError::Ask { .. }
                | PeridotError::CrossSlot
                | PeridotError::TryAgain
                | PeridotError::ClusterDown(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable;
// the Arc makes cloning cheap and shared.
impl Clone for PeridotError {
    fn clone(&self) -> Self {
        match self {
            PeridotError::Io(e) => PeridotError::Io(Arc::clone(e)),
            PeridotError::SyntaxError => PeridotError::SyntaxError,
            PeridotError::WrongArgumentCount(s) => PeridotError::WrongArgumentCount(s.clone()),
            PeridotError::NotAnInteger => PeridotError::NotAnInteger,
            PeridotError::InvalidSlot => PeridotError::InvalidSlot,
            PeridotError::UnknownNode(s) => PeridotError::UnknownNode(s.clone()),
            PeridotError::InvalidRequest(s) => PeridotError::InvalidRequest(s.clone()),
            PeridotError::InvalidState(s) => PeridotError::InvalidState(s.clone()),
            PeridotError::ConfigCorrupt(s) => PeridotError::ConfigCorrupt(s.clone()),
            PeridotError::ProtocolViolation(s) => PeridotError::ProtocolViolation(s.clone()),
            PeridotError::Persistence(s) => PeridotError::Persistence(s.clone()),
            PeridotError::ReplicationError(s) => PeridotError::ReplicationError(s.clone()),
            PeridotError::Internal(s) => PeridotError::Internal(s.clone()),
            PeridotError::Moved { slot, addr } => PeridotError::Moved {
                slot: *slot,
                addr: addr.clone(),
            },
            PeridotError::Ask { slot, addr } => PeridotError::Ask {
                slot: *slot,
                addr: addr.clone(),
            },
            PeridotError::CrossSlot => PeridotError::CrossSlot,
            PeridotError::TryAgain => PeridotError::TryAgain,
            PeridotError::ClusterDown(s) => PeridotError::ClusterDown(s.clone()),
        }
    }
}

impl PartialEq for PeridotError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PeridotError::Io(e1), PeridotError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PeridotError::WrongArgumentCount(s1), PeridotError::WrongArgumentCount(s2)) => {
                s1 == s2
            }
            (PeridotError::UnknownNode(s1), PeridotError::UnknownNode(s2)) => s1 == s2,
            (PeridotError::InvalidRequest(s1), PeridotError::InvalidRequest(s2)) => s1 == s2,
            (PeridotError::InvalidState(s1), PeridotError::InvalidState(s2)) => s1 == s2,
            (PeridotError::ConfigCorrupt(s1), PeridotError::ConfigCorrupt(s2)) => s1 == s2,
            (PeridotError::ProtocolViolation(s1), PeridotError::ProtocolViolation(s2)) => s1 == s2,
            (PeridotError::Persistence(s1), PeridotError::Persistence(s2)) => s1 == s2,
            (PeridotError::ReplicationError(s1), PeridotError::ReplicationError(s2)) => s1 == s2,
            (PeridotError::Internal(s1), PeridotError::Internal(s2)) => s1 == s2,
            (PeridotError::ClusterDown(s1), PeridotError::ClusterDown(s2)) => s1 == s2,
            (
                PeridotError::Moved { slot: s1, addr: a1 },
                PeridotError::Moved { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            (
                PeridotError::Ask { slot: s1, addr: a1 },
                PeridotError::Ask { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PeridotError {
    fn from(e: std::io::Error) -> Self {
        PeridotError::Io(Arc::new(e))
    }
}

impl From<ParseIntError> for PeridotError {
    fn from(_: ParseIntError) -> Self {
        PeridotError::NotAnInteger
    }
}

impl From<std::string::FromUtf8Error> for PeridotError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        PeridotError::ProtocolViolation(e.to_string())
    }
}
