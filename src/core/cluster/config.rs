// src/core/cluster/config.rs

//! Defines the cluster-specific configuration options.

use serde::{Deserialize, Serialize};

/// Holds all configuration settings related to cluster mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// If `true`, the node participates in a cluster.
    #[serde(default)]
    pub enabled: bool,
    /// The path to the persisted node-view file (e.g., `nodes.conf`).
    /// An empty string disables persistence (used by ephemeral test nodes).
    #[serde(default = "default_config_file")]
    pub config_file: String,
    /// The timeout in milliseconds after which a node with an outstanding
    /// ping is considered to be in a PFAIL (possible failure) state.
    #[serde(default = "default_node_timeout")]
    pub node_timeout: u64,
    /// An optional IP address to announce to other nodes in the cluster.
    pub announce_ip: Option<String>,
    /// An optional port to announce for client connections.
    pub announce_port: Option<u16>,
    /// The port offset for the cluster bus.
    /// The bus listens on client_port + bus_port_offset.
    #[serde(default = "default_bus_port_offset")]
    pub bus_port_offset: u16,
    /// A replica only migrates to an orphaned master if its current master
    /// would retain more than this many working replicas after it leaves.
    #[serde(default)]
    pub migration_barrier: usize,
    /// If `true`, the cluster is reported as down whenever any hash slot is
    /// unassigned or owned by a failed master.
    #[serde(default = "default_require_full_coverage")]
    pub require_full_coverage: bool,
    /// Multiplier of `node_timeout` bounding how stale a replica's data may
    /// be for it to still start an election. `0` disables the check.
    #[serde(default = "default_replica_validity_factor")]
    pub replica_validity_factor: u64,
    /// The period, in seconds, at which masters ping their replicas over the
    /// replication channel. Only used by the data-freshness bound above.
    #[serde(default = "default_repl_ping_replica_period")]
    pub repl_ping_replica_period: u64,
    /// How long, in milliseconds, a manual failover may take before all of
    /// its state is discarded.
    #[serde(default = "default_manual_failover_timeout")]
    pub manual_failover_timeout: u64,
    /// If `true`, the node-view file is fsynced on epoch-critical writes.
    #[serde(default)]
    pub config_fsync: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_file: default_config_file(),
            node_timeout: default_node_timeout(),
            announce_ip: None,
            announce_port: None,
            bus_port_offset: default_bus_port_offset(),
            migration_barrier: 0,
            require_full_coverage: default_require_full_coverage(),
            replica_validity_factor: default_replica_validity_factor(),
            repl_ping_replica_period: default_repl_ping_replica_period(),
            manual_failover_timeout: default_manual_failover_timeout(),
            config_fsync: false,
        }
    }
}

fn default_config_file() -> String {
    "nodes.conf".to_string()
}
fn default_node_timeout() -> u64 {
    15000
}
fn default_bus_port_offset() -> u16 {
    10000
}
fn default_require_full_coverage() -> bool {
    true
}
fn default_replica_validity_factor() -> u64 {
    10
}
fn default_repl_ping_replica_period() -> u64 {
    10
}
fn default_manual_failover_timeout() -> u64 {
    5000
}
