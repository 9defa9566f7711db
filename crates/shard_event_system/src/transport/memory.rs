/// In-process transport backed by broadcast channels
use super::{InboundHandler, Transport};
use crate::types::{ChannelKey, Envelope, SenderId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct HubMessage {
    origin: u64,
    /// Only this node receives the message, when set.
    target: Option<u64>,
    envelope: Envelope,
}

/// Shared switchboard that in-process transports publish through.
///
/// Clones share the same channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    channels: Arc<DashMap<ChannelKey, broadcast::Sender<HubMessage>>>,
    next_node: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            node: self.next_node.fetch_add(1, Ordering::Relaxed),
            subscription: None,
        }
    }

    fn sender(&self, channel: &ChannelKey) -> broadcast::Sender<HubMessage> {
        self.channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of transports currently listening on `channel`.
    pub fn subscriber_count(&self, channel: &ChannelKey) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// A [`Transport`] endpoint on a [`MemoryHub`]. It never receives its own
/// messages. Targeted sends address endpoints by [`MemoryTransport::node_id`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    node: u64,
    subscription: Option<JoinHandle<()>>,
}

impl MemoryTransport {
    /// Hub-unique id of this endpoint.
    pub fn node_id(&self) -> u64 {
        self.node
    }

    fn publish(&self, channel: &ChannelKey, target: Option<u64>, sender: &SenderId, payload: &[u8]) {
        let message = HubMessage {
            origin: self.node,
            target,
            envelope: Envelope {
                sender: *sender,
                payload: payload.to_vec(),
            },
        };

        // No listeners is not an error: the message simply has no audience.
        if self.hub.sender(channel).send(message).is_err() {
            debug!("Nobody is listening on {}", channel);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Peer = u64;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&mut self, channel: &ChannelKey, inbound: InboundHandler) -> io::Result<()> {
        if self.subscription.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "memory transport is already open",
            ));
        }

        // Subscribe before returning so nothing published afterwards is missed.
        let mut receiver = self.hub.sender(channel).subscribe();
        let node = self.node;
        let channel_name = channel.to_string();

        self.subscription = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if message.origin == node => {}
                    Ok(message) if message.target.is_some_and(|target| target != node) => {}
                    Ok(message) => inbound(message.envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "⚠️ Memory transport on {} lagged", channel_name);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        debug!("🔌 Memory transport {} opened {}", self.node, channel);
        Ok(())
    }

    async fn send(&self, channel: &ChannelKey, sender: &SenderId, payload: &[u8]) -> io::Result<()> {
        self.publish(channel, None, sender, payload);
        Ok(())
    }

    async fn send_to(
        &self,
        peer: &u64,
        channel: &ChannelKey,
        sender: &SenderId,
        payload: &[u8],
    ) -> io::Result<()> {
        self.publish(channel, Some(*peer), sender, payload);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
            debug!("🔌 Memory transport {} closed", self.node);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
