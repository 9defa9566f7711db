/// TCP transport: an inbound listener plus outbound connections to known peers
use super::{InboundHandler, Transport};
use crate::types::{ChannelKey, Envelope, SenderId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Default bound on connecting to, or writing to, one peer.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(3);

const SENDER_LEN: usize = 16;

/// Outbound connection to one peer. Each peer has its own lock, so a slow
/// peer only holds up writes to itself.
type PeerSlot = Arc<Mutex<Option<TcpStream>>>;

/// Relays frames over plain TCP.
///
/// Each frame is `u32 len | u16 channel_len | channel | sender uuid[16] | payload`,
/// where `len` counts everything after itself. Outbound connections are
/// opened lazily on first send and re-dialed once if a write fails. Peers are
/// written to concurrently, and every connect or write gives up after the
/// peer timeout.
pub struct TcpTransport {
    bind_address: SocketAddr,
    peers: Vec<SocketAddr>,
    peer_timeout: Duration,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    connections: DashMap<SocketAddr, PeerSlot>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("bind_address", &self.bind_address)
            .field("peers", &self.peers)
            .field("peer_timeout", &self.peer_timeout)
            .field("local_addr", &self.local_addr)
            .field("open", &self.accept_task.is_some())
            .finish()
    }
}

impl TcpTransport {
    pub fn new(bind_address: SocketAddr, peers: Vec<SocketAddr>) -> Self {
        Self {
            bind_address,
            peers,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            local_addr: None,
            accept_task: None,
            connections: DashMap::new(),
        }
    }

    pub fn with_peer_timeout(mut self, peer_timeout: Duration) -> Self {
        self.peer_timeout = peer_timeout;
        self
    }

    /// Address the listener actually bound, once open. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn add_peer(&mut self, peer: SocketAddr) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    async fn send_to_peer(&self, peer: SocketAddr, frame: &[u8]) -> io::Result<()> {
        // Clone the slot out so the map itself is never locked across I/O.
        let slot = self.connections.entry(peer).or_default().clone();
        let mut connection = slot.lock().await;

        if let Some(stream) = connection.as_mut() {
            match self.bounded(peer, "write", stream.write_all(frame)).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("⚠️ Connection to {} broke ({}), reconnecting", peer, e);
                    *connection = None;
                }
            }
        }

        let mut stream = self.bounded(peer, "connect", TcpStream::connect(peer)).await?;
        stream.set_nodelay(true)?;
        self.bounded(peer, "write", stream.write_all(frame)).await?;
        debug!("🔗 Connected to peer {}", peer);
        *connection = Some(stream);
        Ok(())
    }

    async fn bounded<T>(
        &self,
        peer: SocketAddr,
        operation: &str,
        io: impl std::future::Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        match timeout(self.peer_timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{operation} to {peer} timed out after {:?}", self.peer_timeout),
            )),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Peer = SocketAddr;

    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn open(&mut self, channel: &ChannelKey, inbound: InboundHandler) -> io::Result<()> {
        if self.accept_task.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "tcp transport is already open",
            ));
        }

        let listener = TcpListener::bind(self.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let channel = channel.clone();

        info!("🌐 TCP transport listening on {} for {}", local_addr, channel);
        self.local_addr = Some(local_addr);
        self.accept_task = Some(tokio::spawn(accept_loop(listener, channel, inbound)));
        Ok(())
    }

    async fn send(&self, channel: &ChannelKey, sender: &SenderId, payload: &[u8]) -> io::Result<()> {
        let frame = encode_frame(channel, sender, payload)?;
        let frame = &frame;

        let results = join_all(self.peers.iter().map(|peer| async move {
            let result = self.send_to_peer(*peer, frame).await;
            if let Err(e) = &result {
                warn!("⚠️ Failed to send to peer {}: {}", peer, e);
            }
            result
        }))
        .await;

        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    async fn send_to(
        &self,
        peer: &SocketAddr,
        channel: &ChannelKey,
        sender: &SenderId,
        payload: &[u8],
    ) -> io::Result<()> {
        let frame = encode_frame(channel, sender, payload)?;
        self.send_to_peer(*peer, &frame).await.map_err(|e| {
            warn!("⚠️ Failed to send to peer {}: {}", peer, e);
            e
        })
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(task) = self.accept_task.take() {
            // Aborting the accept loop drops its JoinSet, which aborts every reader.
            task.abort();
            // Dropping the slots closes every outbound stream.
            self.connections.clear();
            self.local_addr = None;
            info!("🔌 TCP transport on {} closed", self.bind_address);
        }
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn accept_loop(listener: TcpListener, channel: ChannelKey, inbound: InboundHandler) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("🔗 Accepted relay connection from {}", peer);
                    let channel = channel.clone();
                    let inbound = inbound.clone();
                    readers.spawn(read_connection(stream, peer, channel, inbound));
                }
                Err(e) => {
                    error!("❌ Failed to accept relay connection: {}", e);
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    channel: ChannelKey,
    inbound: InboundHandler,
) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some((frame_channel, envelope))) => {
                if frame_channel == channel {
                    inbound(envelope);
                } else {
                    debug!("Ignoring frame for {} from {}", frame_channel, peer);
                }
            }
            Ok(None) => {
                debug!("🔌 Peer {} disconnected", peer);
                break;
            }
            Err(e) => {
                warn!("⚠️ Dropping connection from {}: {}", peer, e);
                break;
            }
        }
    }
}

fn encode_frame(channel: &ChannelKey, sender: &SenderId, payload: &[u8]) -> io::Result<Vec<u8>> {
    let channel = channel.as_str().as_bytes();
    let channel_len = u16::try_from(channel.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "channel name too long"))?;
    let body_len = 2 + channel.len() + SENDER_LEN + payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {body_len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }

    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&channel_len.to_be_bytes());
    frame.extend_from_slice(channel);
    frame.extend_from_slice(sender.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes one frame to an arbitrary stream.
pub async fn write_frame<W>(
    writer: &mut W,
    channel: &ChannelKey,
    sender: &SenderId,
    payload: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(channel, sender, payload)?;
    writer.write_all(&frame).await
}

/// Reads one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<(ChannelKey, Envelope)>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Message too large"));
    }
    if len < 2 + SENDER_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Frame too short"));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let channel_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let sender_start = 2 + channel_len;
    if sender_start + SENDER_LEN > len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Channel name overruns frame"));
    }

    let channel = std::str::from_utf8(&body[2..sender_start])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Channel name is not UTF-8"))?;
    let mut sender = [0u8; SENDER_LEN];
    sender.copy_from_slice(&body[sender_start..sender_start + SENDER_LEN]);

    Ok(Some((
        ChannelKey::from_raw(channel),
        Envelope {
            sender: SenderId::from_bytes(sender),
            payload: body[sender_start + SENDER_LEN..].to_vec(),
        },
    )))
}
