// src/core/cluster/commands/meet.rs

use crate::core::cluster::gossip::{self, now_ms};
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use std::sync::Arc;

/// CLUSTER MEET: starts a handshake toward an operator-provided address.
/// The node enters the table with a random identity; the first PONG renames
/// it to the peer's true identity.
pub fn execute(state: &Arc<ClusterState>, host: &str, port: u16) -> Result<Reply, PeridotError> {
    if port == 0 {
        return Err(PeridotError::InvalidRequest(
            "Invalid TCP port specified".into(),
        ));
    }
    let bus_port = u32::from(port) + u32::from(state.config.bus_port_offset);
    if bus_port > u32::from(u16::MAX) {
        return Err(PeridotError::InvalidRequest(format!(
            "Derived cluster bus port {bus_port} exceeds 65535"
        )));
    }
    // An already-known address is not an error; the handshake is a no-op.
    gossip::handshake_start(state, host, port, bus_port as u16, now_ms());
    Ok(Reply::Ok)
}
