// src/core/cluster/commands/failover_cmd.rs

use super::FailoverMode;
use crate::core::cluster::failover;
use crate::core::cluster::gossip::now_ms;
use crate::core::cluster::state::ClusterState;
use crate::core::{PeridotError, Reply};
use std::sync::Arc;

/// CLUSTER FAILOVER [FORCE|TAKEOVER], executed on a replica.
pub fn execute(state: &Arc<ClusterState>, mode: FailoverMode) -> Result<Reply, PeridotError> {
    let now = now_ms();
    match mode {
        FailoverMode::Default => failover::start_manual_failover(state, now, false)?,
        FailoverMode::Force => failover::start_manual_failover(state, now, true)?,
        FailoverMode::Takeover => failover::takeover(state, now)?,
    }
    Ok(Reply::Ok)
}
