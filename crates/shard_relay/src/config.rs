//! Configuration management for the shard relay node.
//!
//! This module handles loading, validation, and command-line overrides of the
//! node configuration stored in a TOML file.

use crate::cli::CliArgs;
use serde::{Deserialize, Serialize};
use shard_event_system::ChannelKey;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_peer_timeout() -> u64 {
    3000
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Read from an existing file
    File,
    /// The file was missing and defaults were written to it
    CreatedDefault,
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Escalate recoverable decode failures into errors
    #[serde(default)]
    pub debug: bool,
    /// Identity and runtime sizing of this node
    pub node: NodeSettings,
    /// Relay channel and peer settings
    pub relay: RelaySettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Human-readable node name carried in heartbeats
    pub name: String,
    /// Tokio worker threads (defaults to the number of CPUs)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Relay channel, listener and peer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Channel namespace, the part before the colon
    pub namespace: String,
    /// Channel name, the part after the colon
    pub channel: String,
    /// Address the inbound TCP listener binds to
    pub bind_address: String,
    /// Peers every published event is sent to
    #[serde(default)]
    pub peers: Vec<String>,
    /// Payloads above this many bytes are deflated
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Heartbeat interval in milliseconds (0 to disable)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Bound on connecting or writing to one peer, in milliseconds
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            node: NodeSettings {
                name: "shard-1".to_string(),
                worker_threads: default_worker_threads(),
            },
            relay: RelaySettings {
                namespace: "shard".to_string(),
                channel: "events".to_string(),
                bind_address: "127.0.0.1:7400".to_string(),
                peers: vec![],
                compression_threshold: default_compression_threshold(),
                heartbeat_interval_ms: default_heartbeat_interval(),
                peer_timeout_ms: default_peer_timeout(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration is written to `path`
    /// and returned. Runs before the runtime and logging exist, so it uses
    /// blocking I/O and reports what it did through [`ConfigOrigin`].
    pub fn load_from_file(path: &Path) -> anyhow::Result<(Self, ConfigOrigin)> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok((config, ConfigOrigin::File))
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            std::fs::write(path, toml_content)?;
            Ok((default_config, ConfigOrigin::CreatedDefault))
        }
    }

    /// Applies command-line overrides on top of the file configuration.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(name) = &args.node_name {
            self.node.name = name.clone();
        }
        if let Some(bind_address) = &args.bind_address {
            self.relay.bind_address = bind_address.clone();
        }
        if !args.peers.is_empty() {
            self.relay.peers = args.peers.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.logging.level = log_level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if args.debug {
            self.debug = true;
        }
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.name.trim().is_empty() {
            return Err("Node name cannot be empty".to_string());
        }
        if self.node.worker_threads == 0 {
            return Err("Worker threads must be at least 1".to_string());
        }
        if self.relay.peer_timeout_ms == 0 {
            return Err("Peer timeout must be at least 1ms".to_string());
        }

        if self.relay.namespace.is_empty() || self.relay.channel.is_empty() {
            return Err("Relay namespace and channel cannot be empty".to_string());
        }

        if self.relay.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.relay.bind_address
            ));
        }
        for peer in &self.relay.peers {
            if peer.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid peer address: {peer}"));
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {VALID_LOG_LEVELS:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(&self.relay.namespace, &self.relay.channel)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.bind_address.parse()?)
    }

    pub fn peer_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.relay
            .peers
            .iter()
            .map(|peer| peer.parse::<SocketAddr>().map_err(anyhow::Error::from))
            .collect()
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.peer_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.relay.heartbeat_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
