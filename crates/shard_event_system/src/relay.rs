//! Cross-process event relay.
//!
//! An [`EventRelay`] pairs the [`EventCodec`] with a [`Transport`]: events
//! published on one node arrive as bytes on every other node listening on the
//! same channel. Receiving never fires anything by itself; the caller decodes
//! with [`EventRelay::receive`] and decides whether to re-fire the result into
//! its own [`EventSystem`](crate::EventSystem) via
//! [`DecodedEvent::fire_into`].

use crate::events::{EventError, RelayEvent};
use crate::serialization::{DecodedEvent, EventCodec};
use crate::transport::{InboundHandler, Transport};
use crate::types::{ChannelKey, Envelope, SenderId};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Publishes events to, and decodes events from, one remote channel.
///
/// The relay owns its transport between [`prepare`](Self::prepare) and
/// [`close`](Self::close). Dropping a prepared relay closes it.
pub struct EventRelay<T: Transport> {
    codec: Arc<EventCodec>,
    transport: T,
    channel: ChannelKey,
    prepared: bool,
}

impl<T: Transport> std::fmt::Debug for EventRelay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("transport", &self.transport.name())
            .field("channel", &self.channel)
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl<T: Transport> EventRelay<T> {
    pub fn new(codec: Arc<EventCodec>, transport: T, channel: ChannelKey) -> Self {
        Self {
            codec,
            transport,
            channel,
            prepared: false,
        }
    }

    pub fn codec(&self) -> &Arc<EventCodec> {
        &self.codec
    }

    pub fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Opens the channel and installs `on_receive` for every inbound message.
    ///
    /// If opening fails, whatever the transport acquired is released again
    /// and the relay stays unprepared.
    pub async fn prepare<F>(&mut self, on_receive: F) -> Result<(), EventError>
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        if self.prepared {
            return Err(EventError::RelayAlreadyPrepared(self.channel.to_string()));
        }

        let inbound: InboundHandler = Arc::new(on_receive);
        if let Err(source) = self.transport.open(&self.channel, inbound).await {
            error!(
                "❌ Failed to open {} transport on {}: {}",
                self.transport.name(),
                self.channel,
                source
            );
            if let Err(e) = self.transport.close() {
                error!("❌ Failed to release {} transport: {}", self.transport.name(), e);
            }
            return Err(EventError::Transport {
                channel: self.channel.to_string(),
                source,
            });
        }

        self.prepared = true;
        info!("📡 Relay prepared on {} via {}", self.channel, self.transport.name());
        Ok(())
    }

    /// Encodes `event` and sends it on the relay's channel.
    pub async fn publish<E: RelayEvent>(&self, sender: &SenderId, event: &E) -> Result<(), EventError> {
        self.ensure_prepared()?;
        let bytes = self.codec.encode(event).map_err(|e| {
            error!("❌ Error while encoding {}: {}", E::event_name(), e);
            e
        })?;
        self.publish_bytes(sender, &bytes).await
    }

    /// Encodes `event` and sends it to a single recipient on the relay's
    /// channel, such as the node a player is connected through.
    pub async fn publish_to<E: RelayEvent>(
        &self,
        peer: &T::Peer,
        sender: &SenderId,
        event: &E,
    ) -> Result<(), EventError> {
        self.ensure_prepared()?;
        let bytes = self.codec.encode(event).map_err(|e| {
            error!("❌ Error while encoding {}: {}", E::event_name(), e);
            e
        })?;

        self.transport
            .send_to(peer, &self.channel, sender, &bytes)
            .await
            .map_err(|source| {
                error!(
                    "❌ Failed to send {} to {} on {}: {}",
                    E::event_name(),
                    peer,
                    self.channel,
                    source
                );
                EventError::Transport {
                    channel: self.channel.to_string(),
                    source,
                }
            })?;

        debug!("📤 Sent {} to {} on {}", E::event_name(), peer, self.channel);
        Ok(())
    }

    /// Sends an already-encoded event.
    pub async fn publish_bytes(&self, sender: &SenderId, bytes: &[u8]) -> Result<(), EventError> {
        self.ensure_prepared()?;

        self.transport
            .send(&self.channel, sender, bytes)
            .await
            .map_err(|source| {
                error!(
                    "❌ Failed to publish {} bytes on {}: {}",
                    bytes.len(),
                    self.channel,
                    source
                );
                EventError::Transport {
                    channel: self.channel.to_string(),
                    source,
                }
            })?;

        debug!("📤 Published {} bytes on {} as {}", bytes.len(), self.channel, sender);
        Ok(())
    }

    /// Decodes one inbound message. See [`EventCodec::try_decode`] for the
    /// failure policy.
    pub fn receive(&self, bytes: &[u8]) -> Result<Option<DecodedEvent>, EventError> {
        self.codec.try_decode(bytes)
    }

    /// Releases the channel. Closing an unprepared or closed relay is a no-op.
    pub fn close(&mut self) -> Result<(), EventError> {
        if !self.prepared {
            return Ok(());
        }
        self.prepared = false;

        self.transport.close().map_err(|source| {
            error!("❌ Failed to close relay on {}: {}", self.channel, source);
            EventError::Transport {
                channel: self.channel.to_string(),
                source,
            }
        })?;

        info!("🔌 Relay on {} closed", self.channel);
        Ok(())
    }

    fn ensure_prepared(&self) -> Result<(), EventError> {
        if self.prepared {
            Ok(())
        } else {
            Err(EventError::RelayNotPrepared(self.channel.to_string()))
        }
    }
}

impl<T: Transport> Drop for EventRelay<T> {
    fn drop(&mut self) {
        // close() already logs failures.
        let _ = self.close();
    }
}
