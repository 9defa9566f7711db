//! Event codec: turns an event into a self-describing byte frame and back.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! magic[2] = BF 4E | version[1] | flags[1] | name_len u16 | name (utf-8)
//! | payload_len u32 | payload (JSON, optionally deflated) | crc32 u32
//! ```
//!
//! The trailing CRC covers every byte before it, so a frame damaged in
//! transit fails to decode instead of producing a different event.

use crate::events::{AnyEvent, DecodeError, Event, EventError, RelayEvent};
use crate::system::{Completion, EventSystem};
use dashmap::DashMap;
use flate2::Crc;
use std::any::TypeId;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

const FRAME_MAGIC: [u8; 2] = [0xBF, 0x4E];
const FRAME_VERSION: u8 = 1;
const FLAG_DEFLATE: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_DEFLATE;
/// magic + version + flags + name_len
const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;
const MIN_FRAME_LEN: usize = HEADER_LEN + 4 + CRC_LEN;
/// Default cap on a payload, after decompression.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

type DecodeFn = fn(&[u8]) -> Result<DecodedEvent, DecodeError>;

#[derive(Clone, Copy)]
struct Decoder {
    type_id: TypeId,
    decode: DecodeFn,
}

/// Encodes events into frames and decodes frames back into events whose
/// types were registered with [`EventCodec::register`].
pub struct EventCodec {
    decoders: DashMap<&'static str, Decoder>,
    debug: Arc<AtomicBool>,
    compression_threshold: Option<usize>,
    max_payload_len: usize,
}

impl fmt::Debug for EventCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&'static str> = self.decoders.iter().map(|entry| *entry.key()).collect();
        names.sort_unstable();
        f.debug_struct("EventCodec")
            .field("event_types", &names)
            .field("debug", &self.debug_enabled())
            .field("compression_threshold", &self.compression_threshold)
            .field("max_payload_len", &self.max_payload_len)
            .finish()
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCodec {
    pub fn new() -> Self {
        Self {
            decoders: DashMap::new(),
            debug: Arc::new(AtomicBool::new(false)),
            compression_threshold: None,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }

    /// Shares a debug flag with the rest of the process. While it is set,
    /// recoverable decode failures are returned as errors instead of being
    /// logged and dropped.
    pub fn with_debug_flag(mut self, debug: Arc<AtomicBool>) -> Self {
        self.debug = debug;
        self
    }

    /// Deflates payloads larger than `threshold` bytes when that makes them smaller.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = Some(threshold);
        self
    }

    /// Largest payload `decode` accepts, measured after decompression.
    pub fn with_max_payload_len(mut self, limit: usize) -> Self {
        self.max_payload_len = limit;
        self
    }

    pub fn debug_flag(&self) -> &Arc<AtomicBool> {
        &self.debug
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    /// Makes `E` decodable by this codec.
    ///
    /// Registering the same type twice is harmless; binding a second type to
    /// an existing wire name is an error.
    pub fn register<E: RelayEvent>(&self) -> Result<(), EventError> {
        let name = E::event_name();
        let decoder = Decoder {
            type_id: TypeId::of::<E>(),
            decode: decode_as::<E>,
        };

        match self.decoders.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().type_id != decoder.type_id {
                    return Err(EventError::EventNameConflict { name });
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!("📝 Registered codec for {}", name);
                slot.insert(decoder);
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// Wire names this codec can decode, sorted.
    pub fn registered_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.decoders.iter().map(|entry| *entry.key()).collect();
        names.sort_unstable();
        names
    }

    /// Encodes one event into a frame.
    pub fn encode<E: RelayEvent>(&self, event: &E) -> Result<Vec<u8>, EventError> {
        let name = E::event_name();
        let encode_error = |reason: String| EventError::Encode { event: name, reason };

        let json = serde_json::to_vec(event).map_err(|e| encode_error(e.to_string()))?;
        let (payload, flags) = match self.compression_threshold {
            Some(threshold) if json.len() > threshold => match deflate(&json) {
                Ok(compressed) if compressed.len() < json.len() => (compressed, FLAG_DEFLATE),
                Ok(_) => (json, 0),
                Err(e) => return Err(encode_error(format!("compression failed: {e}"))),
            },
            _ => (json, 0),
        };

        let name_len = u16::try_from(name.len())
            .map_err(|_| encode_error(format!("event name is {} bytes long", name.len())))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| encode_error(format!("payload is {} bytes long", payload.len())))?;

        let mut frame =
            Vec::with_capacity(MIN_FRAME_LEN + name.len() + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.push(flags);
        frame.extend_from_slice(&name_len.to_be_bytes());
        frame.extend_from_slice(name.as_bytes());
        frame.extend_from_slice(&payload_len.to_be_bytes());
        frame.extend_from_slice(&payload);

        let checksum = crc32(&frame);
        frame.extend_from_slice(&checksum.to_be_bytes());
        Ok(frame)
    }

    /// Decodes a frame, failing on any malformed, damaged or unknown input.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedEvent, EventError> {
        Ok(self.decode_frame(bytes)?)
    }

    /// Decodes a frame under the recoverable failure policy: failures are
    /// logged and yield `None`, unless the debug flag is set, in which case
    /// they are returned.
    pub fn try_decode(&self, bytes: &[u8]) -> Result<Option<DecodedEvent>, EventError> {
        match self.decode(bytes) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                error!("❌ Error while decoding event ({} bytes): {}", bytes.len(), e);
                if self.debug_enabled() {
                    Err(e)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<DecodedEvent, DecodeError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(DecodeError::Truncated {
                needed: MIN_FRAME_LEN,
                available: bytes.len(),
            });
        }

        let (body, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32(body);
        if expected != computed {
            return Err(DecodeError::ChecksumMismatch { expected, computed });
        }

        let mut reader = FrameReader::new(body);
        if reader.take(2)? != FRAME_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = reader.u8()?;
        if version != FRAME_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flags = reader.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(DecodeError::UnknownFlags(flags));
        }

        let name_len = usize::from(reader.u16()?);
        let name = std::str::from_utf8(reader.take(name_len)?)
            .map_err(|_| DecodeError::MalformedName)?;
        let payload_len = reader.u32()? as usize;
        if payload_len > self.max_payload_len {
            return Err(DecodeError::PayloadTooLarge {
                limit: self.max_payload_len,
            });
        }
        let payload = reader.take(payload_len)?;
        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }

        let decoder = self
            .decoders
            .get(name)
            .map(|entry| *entry.value())
            .ok_or_else(|| DecodeError::UnknownEventType(name.to_string()))?;

        if flags & FLAG_DEFLATE != 0 {
            let inflated = inflate(payload, self.max_payload_len)?;
            (decoder.decode)(&inflated)
        } else {
            (decoder.decode)(payload)
        }
    }
}

fn decode_as<E: RelayEvent>(payload: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let event: E = serde_json::from_slice(payload).map_err(|source| DecodeError::Payload {
        event: E::event_name().to_string(),
        source,
    })?;
    Ok(DecodedEvent::new(event))
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::{write::DeflateEncoder, Compression};

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates at most `limit` bytes; anything beyond that is refused, not buffered.
fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    use flate2::read::DeflateDecoder;

    let mut decoder = DeflateDecoder::new(data).take(limit as u64 + 1);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(DecodeError::Decompression)?;
    if inflated.len() > limit {
        return Err(DecodeError::PayloadTooLarge { limit });
    }
    Ok(inflated)
}

struct FrameReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                needed: self.position + len,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// An event reconstructed from a frame, with its concrete type erased.
///
/// Recover the type with [`DecodedEvent::downcast`], or hand it back to a
/// local bus with [`DecodedEvent::fire_into`], which fires it as its concrete
/// type.
pub struct DecodedEvent {
    name: &'static str,
    type_id: TypeId,
    value: Box<AnyEvent>,
    refire: fn(Box<AnyEvent>, &EventSystem) -> Completion<DecodedEvent>,
    debug: fn(&AnyEvent, &mut fmt::Formatter<'_>) -> fmt::Result,
}

impl DecodedEvent {
    pub fn new<E: RelayEvent>(event: E) -> Self {
        Self {
            name: E::event_name(),
            type_id: TypeId::of::<E>(),
            value: Box::new(event),
            refire: refire_as::<E>,
            debug: debug_as::<E>,
        }
    }

    /// Wire name of the decoded event.
    pub fn event_name(&self) -> &'static str {
        self.name
    }

    pub fn is<E: Event>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    /// Recovers the concrete event, or gives the decoded event back unchanged.
    pub fn downcast<E: Event>(self) -> Result<E, Self> {
        let Self {
            name,
            type_id,
            value,
            refire,
            debug,
        } = self;

        value.downcast::<E>().map(|event| *event).map_err(|value| Self {
            name,
            type_id,
            value,
            refire,
            debug,
        })
    }

    /// Fires the event into a local bus as its concrete type.
    pub fn fire_into(self, events: &EventSystem) -> Completion<DecodedEvent> {
        (self.refire)(self.value, events)
    }
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.debug)(self.value.as_ref(), f)
    }
}

fn refire_as<E: RelayEvent>(value: Box<AnyEvent>, events: &EventSystem) -> Completion<DecodedEvent> {
    match value.downcast::<E>() {
        Ok(event) => events.fire(*event).map(DecodedEvent::new),
        Err(_) => Completion::failed(
            E::event_name(),
            EventError::DispatchAborted {
                event: E::event_name(),
                reason: "decoded value does not match its recorded type".to_string(),
            },
        ),
    }
}

fn debug_as<E: RelayEvent>(value: &AnyEvent, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value.downcast_ref::<E>() {
        Some(event) => fmt::Debug::fmt(event, f),
        None => write!(f, "<{}>", E::event_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Priority;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        value: u32,
    }
    impl Event for Ping {
        fn event_name() -> &'static str {
            "test:ping"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ChatLine {
        sender: String,
        text: String,
        mentions: Vec<String>,
    }
    impl Event for ChatLine {
        fn event_name() -> &'static str {
            "test:chat_line"
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor {
        value: u32,
    }
    impl Event for Impostor {
        fn event_name() -> &'static str {
            "test:ping"
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct GridSnapshot {
        cells: HashMap<(u8, u8), u8>,
    }
    impl Event for GridSnapshot {}

    fn codec() -> EventCodec {
        let codec = EventCodec::new();
        codec.register::<Ping>().unwrap();
        codec.register::<ChatLine>().unwrap();
        codec
    }

    #[test]
    fn round_trip_preserves_type_and_fields() {
        let codec = codec();
        let chat = ChatLine {
            sender: "steve".to_string(),
            text: "gg".to_string(),
            mentions: vec!["alex".to_string()],
        };

        let decoded = codec.decode(&codec.encode(&chat).unwrap()).unwrap();
        assert_eq!(decoded.event_name(), "test:chat_line");
        assert!(decoded.is::<ChatLine>());
        assert!(!decoded.is::<Ping>());
        assert_eq!(decoded.downcast::<ChatLine>().unwrap(), chat);
    }

    #[test]
    fn frame_starts_with_magic_and_names_the_event() {
        let frame = codec().encode(&Ping { value: 1 }).unwrap();
        assert_eq!(&frame[0..2], &FRAME_MAGIC);
        assert_eq!(frame[2], FRAME_VERSION);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]) as usize, "test:ping".len());
        assert_eq!(&frame[6..6 + "test:ping".len()], b"test:ping");
    }

    #[test]
    fn corrupted_byte_is_rejected() {
        let codec = codec();
        let mut frame = codec.encode(&Ping { value: 1 }).unwrap();
        let last_payload_byte = frame.len() - CRC_LEN - 2;
        frame[last_payload_byte] ^= 0x01;

        let err = codec.decode(&frame).unwrap_err();
        assert!(matches!(err, EventError::Decode(DecodeError::ChecksumMismatch { .. })));

        // Recoverable by default...
        assert!(codec.try_decode(&frame).unwrap().is_none());
        // ...escalated while debugging.
        codec.set_debug(true);
        assert!(codec.try_decode(&frame).is_err());
    }

    #[test]
    fn truncated_frames_fail() {
        let codec = codec();
        let frame = codec.encode(&Ping { value: 1 }).unwrap();

        assert!(matches!(
            codec.decode(&frame[..5]).unwrap_err(),
            EventError::Decode(DecodeError::Truncated { .. })
        ));
        // Cutting the frame short also breaks the checksum.
        assert!(codec.decode(&frame[..frame.len() - 1]).is_err());
        assert!(codec.decode(&[]).is_err());
    }

    #[test]
    fn unknown_event_type_fails_on_the_receiving_side() {
        let sender = codec();
        let receiver = EventCodec::new();
        receiver.register::<Ping>().unwrap();

        let frame = sender
            .encode(&ChatLine {
                sender: "a".to_string(),
                text: "b".to_string(),
                mentions: Vec::new(),
            })
            .unwrap();

        let err = receiver.decode(&frame).unwrap_err();
        assert!(matches!(
            err,
            EventError::Decode(DecodeError::UnknownEventType(ref name)) if name == "test:chat_line"
        ));
    }

    #[test]
    fn unserializable_event_is_an_encode_failure() {
        let mut cells = HashMap::new();
        cells.insert((1, 2), 3);

        let err = codec().encode(&GridSnapshot { cells }).unwrap_err();
        assert!(matches!(err, EventError::Encode { .. }));
    }

    #[test]
    fn wire_name_conflicts_are_rejected() {
        let codec = codec();
        assert!(codec.register::<Ping>().is_ok());
        assert!(matches!(
            codec.register::<Impostor>().unwrap_err(),
            EventError::EventNameConflict { name: "test:ping" }
        ));
        assert_eq!(codec.registered_names(), vec!["test:chat_line", "test:ping"]);
    }

    #[test]
    fn large_payloads_are_compressed_and_restored() {
        let codec = EventCodec::new().with_compression_threshold(64);
        codec.register::<ChatLine>().unwrap();
        let chat = ChatLine {
            sender: "server".to_string(),
            text: "lorem ipsum ".repeat(100),
            mentions: vec!["everyone".to_string(); 20],
        };

        let frame = codec.encode(&chat).unwrap();
        assert_eq!(frame[3] & FLAG_DEFLATE, FLAG_DEFLATE);
        assert!(frame.len() < serde_json::to_vec(&chat).unwrap().len());
        assert_eq!(codec.decode(&frame).unwrap().downcast::<ChatLine>().unwrap(), chat);
    }

    #[test]
    fn small_payloads_stay_uncompressed() {
        let codec = EventCodec::new().with_compression_threshold(64);
        codec.register::<Ping>().unwrap();

        let frame = codec.encode(&Ping { value: 9 }).unwrap();
        assert_eq!(frame[3], 0);
    }

    #[test]
    fn oversized_inflated_payload_is_refused() {
        let sender = EventCodec::new().with_compression_threshold(64);
        sender.register::<ChatLine>().unwrap();
        let receiver = EventCodec::new().with_max_payload_len(4 * 1024);
        receiver.register::<ChatLine>().unwrap();

        // Highly compressible: the frame is small but inflates past the limit.
        let frame = sender
            .encode(&ChatLine {
                sender: "flood".to_string(),
                text: " ".repeat(64 * 1024),
                mentions: Vec::new(),
            })
            .unwrap();
        assert_eq!(frame[3] & FLAG_DEFLATE, FLAG_DEFLATE);
        assert!(frame.len() < 4 * 1024);

        assert!(matches!(
            receiver.decode(&frame).unwrap_err(),
            EventError::Decode(DecodeError::PayloadTooLarge { limit: 4096 })
        ));
    }

    #[test]
    fn oversized_plain_payload_is_refused() {
        let codec = EventCodec::new().with_max_payload_len(8);
        codec.register::<Ping>().unwrap();

        let frame = codec.encode(&Ping { value: 123_456 }).unwrap();
        assert!(matches!(
            codec.decode(&frame).unwrap_err(),
            EventError::Decode(DecodeError::PayloadTooLarge { limit: 8 })
        ));
    }

    #[test]
    fn downcast_to_wrong_type_returns_the_event() {
        let codec = codec();
        let decoded = codec.decode(&codec.encode(&Ping { value: 3 }).unwrap()).unwrap();

        let decoded = decoded.downcast::<ChatLine>().unwrap_err();
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { value: 3 }));
        assert_eq!(format!("{decoded:?}"), "Ping { value: 3 }");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn decoded_event_refires_as_its_concrete_type() {
        let codec = codec();
        let events = EventSystem::new();
        events.on("bump", Priority::Normal, |ping: &mut Ping| {
            ping.value += 10;
            Ok(())
        });

        let decoded = codec.decode(&codec.encode(&Ping { value: 1 }).unwrap()).unwrap();
        let fired = decoded.fire_into(&events).await.unwrap();
        assert_eq!(fired.downcast::<Ping>().unwrap(), Ping { value: 11 });
    }
}
