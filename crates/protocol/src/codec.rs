//! Message serialization and framing using postcard
//!
//! Messages are serialized with postcard and, when written to a byte stream,
//! prefixed with their length:
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! Redirection payloads are bounded by USB transfer sizes, so frames larger
//! than 4 MiB are rejected before allocation.

use crate::{CURRENT_VERSION, Message, ProtocolVersion, error::ProtocolError, error::Result};

#[cfg(feature = "async")]
use tokio::io::AsyncReadExt;

/// Maximum allowed frame size (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Encode a message to bytes using postcard
///
/// # Example
/// ```
/// use protocol::{Message, RedirMessage, CURRENT_VERSION, encode_message};
///
/// let msg = Message {
///     version: CURRENT_VERSION,
///     payload: RedirMessage::Data { data: vec![0xAA; 8] },
/// };
/// let bytes = encode_message(&msg).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(ProtocolError::from)
}

/// Decode a message from bytes using postcard
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate protocol version compatibility
///
/// Major versions must match; minor differences are tolerated and feature
/// use is gated by capabilities instead.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.major != CURRENT_VERSION.major {
        return Err(ProtocolError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

fn check_frame_len(length: usize) -> Result<()> {
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Encode a message with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{ChannelCapabilities, Message, RedirMessage, CURRENT_VERSION};
/// use protocol::{decode_framed, encode_framed};
///
/// let msg = Message {
///     version: CURRENT_VERSION,
///     payload: RedirMessage::Capabilities(ChannelCapabilities { compression: true }),
/// };
/// let framed = encode_framed(&msg).unwrap();
/// let decoded = decode_framed(&framed).unwrap();
/// assert_eq!(decoded.payload, msg.payload);
/// ```
pub fn encode_framed(message: &Message) -> Result<Vec<u8>> {
    let message_bytes = encode_message(message)?;
    let message_len = message_bytes.len();
    check_frame_len(message_len)?;

    let mut frame = Vec::with_capacity(4 + message_len);
    frame.extend_from_slice(&(message_len as u32).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Decode a framed message
pub fn decode_framed(frame: &[u8]) -> Result<Message> {
    let Some(prefix) = frame.first_chunk::<4>() else {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4,
            actual: frame.len(),
        });
    };

    let length = u32::from_be_bytes(*prefix) as usize;
    check_frame_len(length)?;

    if frame.len() < 4 + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4 + length,
            actual: frame.len(),
        });
    }

    decode_message(&frame[4..4 + length])
}

/// Async: read a framed message from an async reader
///
/// Returns `None` when the stream ends at a frame boundary; ending anywhere
/// else is an I/O error.
#[cfg(feature = "async")]
pub async fn read_framed_async<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    if reader.read(&mut len_bytes[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_bytes[1..]).await?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    check_frame_len(length)?;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes).await?;

    decode_message(&message_bytes).map(Some)
}
