// src/config.rs

//! Manages node configuration: loading from a TOML file and validation.

use crate::core::cluster::ClusterConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// The top-level configuration for a cluster node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The address the node binds to, and the default address it announces.
    #[serde(default = "default_host")]
    pub host: String,
    /// The client-facing port. The cluster bus listens on
    /// `port + cluster.bus_port_offset`.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config file '{path}'"))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Invalid config file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        let bus_port = u32::from(self.port) + u32::from(self.cluster.bus_port_offset);
        if bus_port > u32::from(u16::MAX) {
            return Err(anyhow!(
                "Calculated cluster bus port ({bus_port}) exceeds the valid range (max 65535). \
                 Please check 'port' and 'cluster.bus_port_offset'."
            ));
        }
        if self.cluster.node_timeout == 0 {
            return Err(anyhow!("'cluster.node_timeout' must be greater than zero"));
        }
        Ok(())
    }

    /// The address this node announces for client traffic.
    pub fn announced_addr(&self) -> (String, u16) {
        let host = self
            .cluster
            .announce_ip
            .clone()
            .unwrap_or_else(|| self.host.clone());
        let port = self.cluster.announce_port.unwrap_or(self.port);
        (host, port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7700
}
fn default_log_level() -> String {
    "info".to_string()
}
