//! Command-line interface handling for the shard relay node.
//!
//! Every option here overrides the matching configuration file setting.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the node name
    pub node_name: Option<String>,
    /// Optional override for the relay bind address
    pub bind_address: Option<String>,
    /// Peers replacing the configured peer list, if any are given
    pub peers: Vec<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Whether to escalate decode failures
    pub debug: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("relay.toml")),
            node_name: matches.get_one::<String>("name").cloned(),
            bind_address: matches.get_one::<String>("bind").cloned(),
            peers: matches
                .get_many::<String>("peer")
                .map(|peers| peers.cloned().collect())
                .unwrap_or_default(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            debug: matches.get_flag("debug"),
        }
    }
}

/// The clap command definition.
pub fn command() -> Command {
    Command::new("Shard Relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relays events between server shards over TCP")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("relay.toml"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("NAME")
                .help("Node name announced in heartbeats"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Relay bind address (e.g., 127.0.0.1:7400)"),
        )
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("ADDRESS")
                .help("Peer to relay events to; repeat for several peers")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Fail loudly on undecodable relay messages")
                .action(ArgAction::SetTrue),
        )
}
