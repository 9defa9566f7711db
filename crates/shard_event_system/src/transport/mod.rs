//! Transport layer abstractions for relaying encoded events between processes.
//!
//! A transport moves opaque byte messages on a named channel. It provides the
//! message boundaries; each message it delivers is exactly one encoded event.
//!
//! - [`MemoryTransport`] connects relays inside one process through a [`MemoryHub`].
//! - [`TcpTransport`] listens for peers and writes length-prefixed frames to them.

use crate::types::{ChannelKey, Envelope, SenderId};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;

mod memory;
mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::{read_frame, write_frame, TcpTransport, MAX_FRAME_LEN};

/// Callback a transport invokes for every inbound message on its channel.
pub type InboundHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// A byte-message channel shared with other processes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address of a single recipient, for targeted sends.
    type Peer: fmt::Display + Send + Sync;

    /// Short name of the transport for logging.
    fn name(&self) -> &'static str;

    /// Starts listening on `channel`, delivering inbound messages to `inbound`.
    ///
    /// On failure, anything acquired while opening is released again.
    async fn open(&mut self, channel: &ChannelKey, inbound: InboundHandler) -> io::Result<()>;

    /// Sends one message. Returns once the bytes are handed off, without
    /// waiting for any remote acknowledgement.
    async fn send(&self, channel: &ChannelKey, sender: &SenderId, payload: &[u8]) -> io::Result<()>;

    /// Sends one message to a single recipient instead of every listener.
    async fn send_to(
        &self,
        peer: &Self::Peer,
        channel: &ChannelKey,
        sender: &SenderId,
        payload: &[u8],
    ) -> io::Result<()>;

    /// Stops listening and releases the channel. Closing twice is a no-op.
    fn close(&mut self) -> io::Result<()>;
}
