//! Events this node relays, and the listener that watches them.

use serde::{Deserialize, Serialize};
use shard_event_system::{Event, EventCodec, EventError, HandlerDecl, Listener, Priority, SenderId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

/// Periodic liveness announcement from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node: String,
    pub sender: SenderId,
    pub sequence: u64,
    pub uptime_ms: u64,
}

impl Event for NodeHeartbeat {
    fn event_name() -> &'static str {
        "shard:node_heartbeat"
    }
}

/// A chat line typed on one node and shown on all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRelayed {
    pub origin_node: String,
    pub author: String,
    pub message: String,
}

impl Event for ChatRelayed {
    fn event_name() -> &'static str {
        "shard:chat_relayed"
    }
}

/// Registers every event type the node can receive.
pub fn register_relay_events(codec: &EventCodec) -> Result<(), EventError> {
    codec.register::<NodeHeartbeat>()?;
    codec.register::<ChatRelayed>()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub node: String,
    pub last_sequence: u64,
    pub heartbeats: u64,
}

/// Tracks peers from their heartbeats and logs relayed chat.
#[derive(Debug, Default)]
pub struct NodeMonitor {
    peers: Mutex<HashMap<SenderId, PeerStatus>>,
    chat_lines: AtomicU64,
}

impl NodeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        let mut peers: Vec<PeerStatus> = self
            .peers
            .lock()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default();
        peers.sort_by(|a, b| a.node.cmp(&b.node));
        peers
    }

    pub fn chat_lines(&self) -> u64 {
        self.chat_lines.load(Ordering::Relaxed)
    }

    fn on_heartbeat(&self, heartbeat: &mut NodeHeartbeat) -> anyhow::Result<()> {
        let mut peers = self
            .peers
            .lock()
            .map_err(|_| anyhow::anyhow!("peer table lock poisoned"))?;

        match peers.get_mut(&heartbeat.sender) {
            Some(status) => {
                status.last_sequence = heartbeat.sequence;
                status.heartbeats += 1;
            }
            None => {
                info!(
                    "🤝 Discovered peer {} ({}), up for {}ms",
                    heartbeat.node, heartbeat.sender, heartbeat.uptime_ms
                );
                peers.insert(
                    heartbeat.sender,
                    PeerStatus {
                        node: heartbeat.node.clone(),
                        last_sequence: heartbeat.sequence,
                        heartbeats: 1,
                    },
                );
            }
        }
        Ok(())
    }

    fn on_chat(&self, chat: &mut ChatRelayed) -> anyhow::Result<()> {
        self.chat_lines.fetch_add(1, Ordering::Relaxed);
        info!("💬 [{}] <{}> {}", chat.origin_node, chat.author, chat.message);
        Ok(())
    }
}

impl Listener for NodeMonitor {
    fn handlers(&self) -> Vec<HandlerDecl<Self>> {
        vec![
            HandlerDecl::new("on_heartbeat", Priority::Monitor, Self::on_heartbeat),
            HandlerDecl::new("on_chat", Priority::Monitor, Self::on_chat),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_event_system::EventSystem;
    use std::sync::Arc;

    fn heartbeat(sender: SenderId, sequence: u64) -> NodeHeartbeat {
        NodeHeartbeat {
            node: "shard-2".to_string(),
            sender,
            sequence,
            uptime_ms: sequence * 1000,
        }
    }

    #[test]
    fn relay_events_register_once() {
        let codec = EventCodec::new();
        register_relay_events(&codec).unwrap();
        register_relay_events(&codec).unwrap();
        assert_eq!(
            codec.registered_names(),
            vec!["shard:chat_relayed", "shard:node_heartbeat"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_tracks_peers_and_chat() {
        let events = EventSystem::new();
        let monitor = Arc::new(NodeMonitor::new());
        events.register(&monitor).unwrap();

        let sender = SenderId::new();
        events.fire(heartbeat(sender, 1)).await.unwrap();
        events.fire(heartbeat(sender, 2)).await.unwrap();
        events
            .fire(ChatRelayed {
                origin_node: "shard-2".to_string(),
                author: "steve".to_string(),
                message: "hi".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            monitor.peers(),
            vec![PeerStatus {
                node: "shard-2".to_string(),
                last_sequence: 2,
                heartbeats: 2,
            }]
        );
        assert_eq!(monitor.chat_lines(), 1);
    }
}
