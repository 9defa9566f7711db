//! Main application entry point for the shard relay node
//!
//! Loads configuration, applies CLI overrides, sets up logging and runs the
//! node on a Tokio runtime sized from the configuration.

mod cli;
mod config;
mod events;
mod logging;
mod node;
mod signals;

use anyhow::anyhow;
use cli::CliArgs;
use config::{AppConfig, ConfigOrigin};
use node::Node;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Configuration is loaded before logging exists, so its problems go to stderr.
    let (mut config, origin) = AppConfig::load_from_file(&args.config_path)?;
    config.apply_cli(&args);
    if let Err(e) = config.validate() {
        return Err(anyhow!("Configuration validation failed: {}", e));
    }

    logging::setup_logging(&config.logging)?;
    display_banner();
    if origin == ConfigOrigin::CreatedDefault {
        info!(
            "📝 Created default configuration file: {}",
            args.config_path.display()
        );
    }
    info!(
        "📂 Config: {} | Node: {} | Workers: {}",
        args.config_path.display(),
        config.node.name,
        config.node.worker_threads
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.node.worker_threads)
        .thread_name("shard-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let node = Node::start(&config).await?;
        node.run_until(signals::shutdown_signal()).await
    })
    .map(|_| info!("👋 Shard relay shutdown complete"))
    .map_err(|e| {
        error!("❌ Application error: {:?}", e);
        e
    })
}

/// Display startup banner using proper logging
fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║            🌟 SHARD RELAY 🌟             ║");
    info!("║                  v{:<8}               ║", version);
    info!("║                                          ║");
    info!("║  🎯 Priority-ordered event bus           ║");
    info!("║  📡 Cross-shard event relay over TCP     ║");
    info!("╚══════════════════════════════════════════╝");
}
