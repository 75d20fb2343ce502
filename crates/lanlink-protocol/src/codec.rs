//! The wire codec: one [`Message`] ⇄ one compressed, length-prefixed frame.
//!
//! ```text
//! body   = [from_id:1][to_id:1][routing_tag:1][app_tag:1]
//!          [value_len:4][value][data_len:4][data]
//! frame  = [compressed_len:4][deflate(body)]
//! ```
//!
//! All integers are little-endian. The length prefix counts only the
//! compressed bytes after it, so a reader can peel exactly one frame off a
//! buffer that holds several back-to-back.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};

use crate::{Message, PeerId, ProtocolError, RoutingTag};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the fixed part of a body (ids, tags and both length fields).
const BODY_HEADER_SIZE: usize = 4 + 4 + 4;

/// Tunables for [`WireCodec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest frame accepted, applied both to the compressed length prefix
    /// and to the decompressed body. Default: 16 MiB.
    pub max_frame_size: u32,

    /// DEFLATE level, 0 (store) to 9 (smallest). Default: 6.
    pub compression_level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            compression_level: 6,
        }
    }
}

/// Encodes and decodes single frames.
///
/// Stateless apart from its configuration, so one instance can be shared by
/// every connection of a host.
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    /// Creates a codec with the given configuration.
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encodes `message` into a complete frame, length prefix included.
    ///
    /// # Errors
    /// [`ProtocolError::FrameTooLarge`] if the body or the compressed frame
    /// exceeds `max_frame_size`; [`ProtocolError::Encode`] if compression
    /// fails.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let body = encode_body(message);
        self.check_size(body.len() as u64)?;

        let level = Compression::new(self.config.compression_level.min(9));
        let mut encoder = DeflateEncoder::new(Vec::new(), level);
        encoder.write_all(&body).map_err(ProtocolError::Encode)?;
        let compressed = encoder.finish().map_err(ProtocolError::Encode)?;
        self.check_size(compressed.len() as u64)?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + compressed.len());
        frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        frame.extend_from_slice(&compressed);
        Ok(frame)
    }

    /// Decodes the first frame in `buf`, returning the message and the
    /// bytes that follow it.
    ///
    /// Call again on the remainder until it is empty to drain a buffer that
    /// holds several frames.
    ///
    /// # Errors
    /// [`ProtocolError::CorruptFrame`] if the buffer is shorter than the
    /// prefix or than the length it states, if decompression fails, or if
    /// the body is malformed. [`ProtocolError::FrameTooLarge`] if the stated
    /// length exceeds `max_frame_size`.
    pub fn decode<'a>(
        &self,
        buf: &'a [u8],
    ) -> Result<(Message, &'a [u8]), ProtocolError> {
        let len = match read_length_prefix(buf) {
            Some(len) => len,
            None => {
                return Err(ProtocolError::CorruptFrame(format!(
                    "need {LENGTH_PREFIX_SIZE} bytes for the length prefix, have {}",
                    buf.len()
                )));
            }
        };
        self.check_size(len as u64)?;

        let end = LENGTH_PREFIX_SIZE + len;
        if buf.len() < end {
            return Err(ProtocolError::CorruptFrame(format!(
                "length prefix says {len} bytes, only {} available",
                buf.len() - LENGTH_PREFIX_SIZE
            )));
        }

        let body = self.decompress(&buf[LENGTH_PREFIX_SIZE..end])?;
        let message = decode_body(&body)?;
        Ok((message, &buf[end..]))
    }

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let max = u64::from(self.config.max_frame_size);
        let mut body = Vec::new();
        // Read one byte past the limit so an oversized body is detectable
        // without inflating all of it.
        DeflateDecoder::new(compressed)
            .take(max + 1)
            .read_to_end(&mut body)
            .map_err(|e| ProtocolError::CorruptFrame(format!("decompression failed: {e}")))?;
        self.check_size(body.len() as u64)?;
        Ok(body)
    }

    fn check_size(&self, size: u64) -> Result<(), ProtocolError> {
        if size > u64::from(self.config.max_frame_size) {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }
}

/// Reads the little-endian length prefix, if enough bytes are present.
fn read_length_prefix(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix) as usize)
}

fn encode_body(message: &Message) -> Vec<u8> {
    let value = message.value().as_bytes();
    let data = message.data();

    let mut body = Vec::with_capacity(BODY_HEADER_SIZE + value.len() + data.len());
    body.push(message.from_id().0);
    body.push(message.to_id().0);
    body.push(message.routing_tag().as_byte());
    body.push(message.app_tag());
    body.extend_from_slice(&(value.len() as u32).to_le_bytes());
    body.extend_from_slice(value);
    body.extend_from_slice(&(data.len() as u32).to_le_bytes());
    body.extend_from_slice(data);
    body
}

fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let mut reader = BodyReader { buf: body, pos: 0 };

    let from_id = PeerId(reader.u8()?);
    let to_id = PeerId(reader.u8()?);
    let routing_tag = RoutingTag::try_from(reader.u8()?).map_err(|byte| {
        ProtocolError::CorruptFrame(format!("unknown routing tag {byte}"))
    })?;
    let app_tag = reader.u8()?;

    let value_len = reader.u32()? as usize;
    let value = std::str::from_utf8(reader.take(value_len)?)
        .map_err(|e| ProtocolError::CorruptFrame(format!("value is not UTF-8: {e}")))?
        .to_owned();

    let data_len = reader.u32()? as usize;
    let data = reader.take(data_len)?.to_vec();

    if reader.pos != body.len() {
        return Err(ProtocolError::CorruptFrame(format!(
            "{} trailing bytes after message body",
            body.len() - reader.pos
        )));
    }

    Ok(Message::new(routing_tag, from_id, to_id)
        .with_app_tag(app_tag)
        .with_value(value)
        .with_data(data))
}

/// Bounds-checked cursor over a decompressed body.
struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                ProtocolError::CorruptFrame(format!(
                    "body truncated: wanted {n} bytes at offset {}, body is {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| ProtocolError::CorruptFrame("short length field".into()))?;
        Ok(u32::from_le_bytes(bytes))
    }
}

// ---------------------------------------------------------------------------
// FrameBuffer
// ---------------------------------------------------------------------------

/// Reassembles frames from a byte stream.
///
/// TCP delivers bytes, not frames: one read may end halfway through a frame
/// or carry several. Push every chunk the transport hands over, then pull
/// messages until [`next_message`](Self::next_message) returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    codec: WireCodec,
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Creates an empty buffer that decodes with `codec`.
    pub fn new(codec: WireCodec) -> Self {
        Self {
            codec,
            buf: Vec::new(),
        }
    }

    /// Appends bytes received from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet hold a whole
    /// frame.
    ///
    /// # Errors
    /// Any error from [`WireCodec::decode`] on a complete frame, or
    /// [`ProtocolError::FrameTooLarge`] as soon as a length prefix exceeds
    /// the ceiling. Either way the stream is unusable afterwards.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(len) = read_length_prefix(&self.buf) else {
            return Ok(None);
        };
        self.codec.check_size(len as u64)?;
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        let (message, rest) = self.codec.decode(&self.buf)?;
        let consumed = self.buf.len() - rest.len();
        self.buf.drain(..consumed);
        Ok(Some(message))
    }
}
