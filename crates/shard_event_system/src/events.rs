//! Event model: the base contract for dispatchable payloads, handler
//! priorities, and the error taxonomy shared by the whole crate.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;

/// Trait that all dispatchable events implement.
///
/// The concrete type is the routing key: an event fired as `A` only reaches
/// handlers registered for exactly `A`. The default [`Event::event_name`] is
/// the Rust type path; events that cross a process boundary should override it
/// with a stable wire name so both ends agree regardless of crate layout.
pub trait Event: Any + Send + Sync + fmt::Debug {
    /// Stable name used in logs and on the wire.
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// Events that can be encoded by the codec and relayed to other processes.
pub trait RelayEvent: Event + Serialize + DeserializeOwned {}

impl<T> RelayEvent for T where T: Event + Serialize + DeserializeOwned {}

/// A type-erased event as seen by handler trampolines.
pub type AnyEvent = dyn Any + Send + Sync + 'static;

/// Runtime identity of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: E::event_name(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Handler priority. Lower slots run first; `Monitor` runs last and is meant
/// for handlers that only observe the final state of an event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Monitor,
}

impl Priority {
    /// Every priority in execution order.
    pub const ALL: [Priority; 6] = [
        Priority::Lowest,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Highest,
        Priority::Monitor,
    ];

    /// Integer slot used for ordering.
    pub const fn slot(self) -> u8 {
        match self {
            Priority::Lowest => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Highest => 4,
            Priority::Monitor => 5,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Lowest => "LOWEST",
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Highest => "HIGHEST",
            Priority::Monitor => "MONITOR",
        };
        f.write_str(name)
    }
}

/// Identifies one registered handler in logs and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerIdentity {
    pub listener: &'static str,
    pub handler: String,
    pub event: &'static str,
    pub priority: Priority,
}

impl fmt::Display for HandlerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({}) @ {}",
            self.listener, self.handler, self.event, self.priority
        )
    }
}

/// Errors produced by the event system.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A listener declared a handler whose parameter is not an event type.
    #[error("handler contract violation in {listener}::{handler}: {reason}")]
    HandlerContractViolation {
        listener: &'static str,
        handler: String,
        reason: String,
    },
    /// A handler failed; the dispatch it belonged to was aborted.
    #[error("handler {handler} failed: {source}")]
    HandlerInvocation {
        handler: HandlerIdentity,
        #[source]
        source: anyhow::Error,
    },
    /// The event could not be represented in the wire format.
    #[error("failed to encode event {event}: {reason}")]
    Encode { event: &'static str, reason: String },
    /// The payload could not be turned back into an event.
    #[error("failed to decode event payload: {0}")]
    Decode(#[from] DecodeError),
    /// The transport reported an I/O failure.
    #[error("transport failure on channel {channel}: {source}")]
    Transport {
        channel: String,
        #[source]
        source: std::io::Error,
    },
    /// Two different types claimed the same wire name.
    #[error("event name `{name}` is already bound to another type")]
    EventNameConflict { name: &'static str },
    #[error("relay channel {0} is not prepared")]
    RelayNotPrepared(String),
    #[error("relay channel {0} is already prepared")]
    RelayAlreadyPrepared(String),
    /// The dispatch never ran to completion (no runtime, or the runtime shut down).
    #[error("dispatch of {event} aborted: {reason}")]
    DispatchAborted { event: &'static str, reason: String },
}

/// Reasons a payload fails to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("payload does not start with the event frame magic")]
    BadMagic,
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame flags {0:#04x}")]
    UnknownFlags(u8),
    #[error("checksum mismatch: frame says {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("event name is not valid utf-8")]
    MalformedName,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
    #[error("payload decompression failed: {0}")]
    Decompression(#[source] std::io::Error),
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("payload of {event} does not match its type: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Unnamed;
    impl Event for Unnamed {}

    #[derive(Debug)]
    struct Named;
    impl Event for Named {
        fn event_name() -> &'static str {
            "test:named"
        }
    }

    #[test]
    fn priority_slots_follow_declaration_order() {
        let slots: Vec<u8> = Priority::ALL.iter().map(|p| p.slot()).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
        assert!(Priority::Normal < Priority::Monitor);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn event_names_default_to_type_path() {
        assert!(Unnamed::event_name().ends_with("Unnamed"));
        assert_eq!(Named::event_name(), "test:named");
        assert_eq!(EventType::of::<Named>().name(), "test:named");
        assert_ne!(EventType::of::<Named>(), EventType::of::<Unnamed>());
    }

    #[test]
    fn handler_identity_display() {
        let identity = HandlerIdentity {
            listener: "Chat",
            handler: "on_message".to_string(),
            event: "chat:message",
            priority: Priority::High,
        };
        assert_eq!(identity.to_string(), "Chat::on_message(chat:message) @ HIGH");
    }
}
