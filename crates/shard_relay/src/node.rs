//! The relay node: a local event bus wired to TCP peers.

use crate::config::AppConfig;
use crate::events::{register_relay_events, ChatRelayed, NodeHeartbeat, NodeMonitor};
use anyhow::Context;
use shard_event_system::{
    Envelope, EventCodec, EventError, EventRelay, EventSystem, EventSystemStats, SenderId,
    TcpTransport,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

pub struct Node {
    name: String,
    sender: SenderId,
    events: Arc<EventSystem>,
    monitor: Arc<NodeMonitor>,
    relay: EventRelay<TcpTransport>,
    heartbeat_interval: Option<Duration>,
    sequence: u64,
    started: Instant,
}

impl Node {
    /// Builds the bus and codec, registers the monitor and opens the relay.
    /// Must run inside the Tokio runtime the node will live on.
    pub async fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let sender = SenderId::new();
        let events = Arc::new(EventSystem::new());

        let codec = EventCodec::new()
            .with_debug_flag(Arc::new(AtomicBool::new(config.debug)))
            .with_compression_threshold(config.relay.compression_threshold);
        register_relay_events(&codec)?;
        let codec = Arc::new(codec);

        let monitor = Arc::new(NodeMonitor::new());
        events.register(&monitor)?;

        let transport = TcpTransport::new(config.bind_addr()?, config.peer_addrs()?)
            .with_peer_timeout(config.peer_timeout());
        let mut relay = EventRelay::new(codec.clone(), transport, config.channel_key());
        relay
            .prepare(refire_inbound(codec, events.clone(), sender))
            .await
            .context("failed to prepare the relay")?;

        info!(
            "🚀 Node {} ({}) relaying {} to {} peer(s)",
            config.node.name,
            sender,
            config.channel_key(),
            config.relay.peers.len()
        );

        Ok(Self {
            name: config.node.name.clone(),
            sender,
            events,
            monitor,
            relay,
            heartbeat_interval: config.heartbeat_interval(),
            sequence: 0,
            started: Instant::now(),
        })
    }

    pub fn monitor(&self) -> &Arc<NodeMonitor> {
        &self.monitor
    }

    /// Address the relay listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.relay.transport().local_addr()
    }

    pub async fn publish_heartbeat(&mut self) -> Result<(), EventError> {
        self.sequence += 1;
        let heartbeat = NodeHeartbeat {
            node: self.name.clone(),
            sender: self.sender,
            sequence: self.sequence,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        };
        self.relay.publish(&self.sender, &heartbeat).await
    }

    /// Shows a chat line locally and relays it to every peer.
    pub async fn publish_chat(&self, author: &str, message: &str) -> Result<(), EventError> {
        let chat = ChatRelayed {
            origin_node: self.name.clone(),
            author: author.to_string(),
            message: message.to_string(),
        };
        self.relay.publish(&self.sender, &chat).await?;
        self.events.fire(chat).await?;
        Ok(())
    }

    /// Heartbeats and relays stdin lines as chat until `shutdown` resolves,
    /// then shuts the node down.
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<EventSystemStats>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.heartbeat_interval.unwrap_or(Duration::from_secs(1)));
        let heartbeat_enabled = self.heartbeat_interval.is_some();
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        info!("✅ Node {} is running, type a line to chat", self.name);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    signal.context("failed to listen for shutdown signals")?;
                    break;
                }
                _ = ticker.tick(), if heartbeat_enabled => {
                    if let Err(e) = self.publish_heartbeat().await {
                        warn!("⚠️ Heartbeat {} not delivered: {}", self.sequence, e);
                    }
                }
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        let author = self.name.clone();
                        if let Err(e) = self.publish_chat(&author, line.trim()).await {
                            warn!("⚠️ Chat line not delivered: {}", e);
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!("stdin closed, chat input disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("⚠️ Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                },
            }
        }

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        self.shutdown()
    }

    /// Closes the relay, clears the registry and returns the final statistics.
    pub fn shutdown(mut self) -> anyhow::Result<EventSystemStats> {
        self.relay.close()?;
        let stats = self.events.get_stats();
        self.events.clear_all();

        info!("📊 Final Statistics:");
        info!("  - Events fired: {}", stats.events_fired);
        info!("  - Dispatches completed: {}", stats.dispatches_completed);
        info!("  - Dispatch failures: {}", stats.dispatch_failures);
        info!("  - Handlers invoked: {}", stats.handlers_invoked);
        info!("  - Peers seen: {}", self.monitor.peers().len());
        Ok(stats)
    }
}

/// Inbound callback: decode every envelope from another node and fire it
/// into the local bus.
fn refire_inbound(
    codec: Arc<EventCodec>,
    events: Arc<EventSystem>,
    own_sender: SenderId,
) -> impl Fn(Envelope) + Send + Sync + 'static {
    move |envelope: Envelope| {
        if envelope.sender == own_sender {
            return;
        }

        match codec.try_decode(&envelope.payload) {
            Ok(Some(decoded)) => {
                let name = decoded.event_name();
                let completion = decoded.fire_into(&events);
                tokio::spawn(async move {
                    if let Err(e) = completion.await {
                        warn!("⚠️ Relayed {} failed locally: {}", name, e);
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!("❌ Undecodable message from {}: {}", envelope.sender, e);
            }
        }
    }
}
