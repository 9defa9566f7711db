//! # Shard Event System
//!
//! A priority-ordered, type-routed event bus for server shards, plus a relay
//! that carries selected events to other processes as bytes.
//!
//! ## Core Features
//!
//! - **Type Routing**: events are delivered to handlers registered for their exact type
//! - **Priorities**: handlers run from `Lowest` to `Monitor`, registration order breaking ties
//! - **Async Dispatch**: every fire runs on the Tokio blocking pool and returns an awaitable [`Completion`]
//! - **Explicit Listeners**: a [`Listener`] declares its handlers; no reflection involved
//! - **Relay**: [`EventRelay`] publishes events through a pluggable [`Transport`]
//! - **Integrity**: encoded frames carry a CRC, so damaged input fails to decode
//!
//! ## Architecture Overview
//!
//! - [`HandlerRegistry`] maps event types to prioritized handler entries.
//! - [`EventSystem`] snapshots the registry on every fire and runs the handlers in order.
//! - [`EventCodec`] turns registered event types into frames and back.
//! - [`EventRelay`] combines the codec with a [`Transport`] bound to one [`ChannelKey`].
//!
//! ## Quick Start Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use shard_event_system::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct PlayerJoined { name: String }
//! impl Event for PlayerJoined {
//!     fn event_name() -> &'static str { "player:joined" }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EventError> {
//!     let events = EventSystem::new();
//!     events.on("greet", Priority::Normal, |event: &mut PlayerJoined| {
//!         println!("welcome, {}", event.name);
//!         Ok(())
//!     });
//!     events.fire(PlayerJoined { name: "steve".into() }).await?;
//!
//!     // Relay the same event to another node in this process.
//!     let codec = Arc::new(EventCodec::new());
//!     codec.register::<PlayerJoined>()?;
//!     let hub = MemoryHub::new();
//!     let channel = ChannelKey::new("demo", "events");
//!
//!     let mut remote = EventRelay::new(codec.clone(), hub.transport(), channel.clone());
//!     remote.prepare(|envelope| println!("{} bytes from {}", envelope.payload.len(), envelope.sender)).await?;
//!
//!     let mut local = EventRelay::new(codec, hub.transport(), channel);
//!     local.prepare(|_| {}).await?;
//!     local.publish(&SenderId::new(), &PlayerJoined { name: "alex".into() }).await?;
//!
//!     local.close()?;
//!     remote.close()?;
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod relay;
pub mod serialization;
pub mod system;
pub mod transport;
pub mod types;

pub use events::{
    AnyEvent, DecodeError, Event, EventError, EventType, HandlerIdentity, Priority, RelayEvent,
};
pub use relay::EventRelay;
pub use serialization::{DecodedEvent, EventCodec};
pub use system::{
    Completion, EventSystem, EventSystemStats, HandlerDecl, HandlerRegistry, Listener,
    ListenerHandler, ListenerId, ParamType,
};
pub use transport::{InboundHandler, MemoryHub, MemoryTransport, TcpTransport, Transport};
pub use types::{ChannelKey, Envelope, SenderId};

// Transport implementors need the same attribute the trait is declared with.
pub use async_trait::async_trait;
