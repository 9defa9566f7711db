//! # Relay identity types
//!
//! - [`SenderId`] - Unique identifier of the node that published an event
//! - [`ChannelKey`] - Namespaced name of a relay channel

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a publishing node.
///
/// Every envelope on the wire carries the sender's id so receivers can tell
/// shards apart and ignore their own traffic.
///
/// # Examples
///
/// ```rust
/// use shard_event_system::SenderId;
///
/// let sender = SenderId::new();
/// let parsed = SenderId::from_str(&sender.to_string()).unwrap();
/// assert_eq!(sender, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(pub Uuid);

impl SenderId {
    /// Creates a new random sender ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a sender ID from its hyphenated string form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::str::FromStr for SenderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

impl Default for SenderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a relay channel, formed as `namespace:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}:{name}"))
    }

    /// Wraps an already-joined channel key, as read off the wire.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message as delivered by a transport: who sent it and exactly one
/// encoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: SenderId,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_id_round_trips_through_strings_and_bytes() {
        let sender = SenderId::new();
        assert_eq!(sender.to_string().parse::<SenderId>().unwrap(), sender);
        assert_eq!(SenderId::from_bytes(*sender.as_bytes()), sender);
        assert!(SenderId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn channel_key_joins_namespace_and_name() {
        let key = ChannelKey::new("shard", "events");
        assert_eq!(key.as_str(), "shard:events");
        assert_eq!(key, ChannelKey::from_raw("shard:events"));
    }
}
