//! # Framing
//!
//! Vault messages travel in a checksummed envelope:
//!
//! ```text
//! "MNEM" | version u8 | length u32_be | message | crc32 u32_be
//! ```
//!
//! The CRC covers everything before it. It catches a broken stream, not an
//! attacker; authenticity comes from the challenge and the session cipher.
//! The header is validated as soon as it is buffered, so a peer announcing
//! an oversized message is refused before its body arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{MAX_MESSAGE_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION};

/// Magic, version and length
pub const FRAME_HEADER_SIZE: usize = 9;

/// CRC trailer size
pub const FRAME_CRC_SIZE: usize = 4;

fn checksum(framed: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(framed);
    hasher.finalize()
}

/// Wrap one message for the wire
pub fn encode_frame(message: &[u8]) -> ProtocolResult<Bytes> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: message.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + message.len() + FRAME_CRC_SIZE);
    buf.put_slice(&PROTOCOL_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);
    let crc = checksum(&buf);
    buf.put_u32(crc);
    Ok(buf.freeze())
}

/// Message length announced by a buffered header
fn announced_length(header: &[u8]) -> ProtocolResult<usize> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if magic != PROTOCOL_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: PROTOCOL_MAGIC,
            actual: magic,
        });
    }
    if header[4] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[4]));
    }

    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(length)
}

/// Reassembles messages from stream reads
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete message, `None` until one is fully buffered
    pub fn decode(&mut self) -> ProtocolResult<Option<Bytes>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let length = announced_length(&self.buffer[..FRAME_HEADER_SIZE])?;

        let body_end = FRAME_HEADER_SIZE + length;
        if self.buffer.len() < body_end + FRAME_CRC_SIZE {
            return Ok(None);
        }

        let mut framed = self.buffer.split_to(body_end + FRAME_CRC_SIZE);
        let expected = checksum(&framed[..body_end]);
        let actual = (&framed[body_end..]).get_u32();
        if actual != expected {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        framed.truncate(body_end);
        framed.advance(FRAME_HEADER_SIZE);
        Ok(Some(framed.freeze()))
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
