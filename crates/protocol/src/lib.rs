//! Wire protocol for the USB redirection channel
//!
//! This crate defines the messages exchanged over a virtual USB port between
//! the client and the remote machine, LZ4 payload compression, and
//! postcard-based framing.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, RedirMessage, CURRENT_VERSION};
//! use protocol::{encode_message, decode_message};
//!
//! let msg = Message {
//!     version: CURRENT_VERSION,
//!     payload: RedirMessage::Data { data: vec![1, 2, 3] },
//! };
//!
//! let bytes = encode_message(&msg).unwrap();
//! let decoded = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.version, CURRENT_VERSION);
//! ```
//!
//! # Compressed Payloads
//!
//! ```
//! use protocol::{CompressionType, compress_payload, decompress_payload};
//!
//! let payload = vec![0u8; 4096];
//! let compressed = compress_payload(CompressionType::Lz4, &payload);
//! let restored = decompress_payload(
//!     CompressionType::Lz4,
//!     &compressed,
//!     payload.len() as u32,
//! )
//! .unwrap();
//! assert_eq!(restored, payload);
//! ```

pub mod codec;
pub mod compression;
pub mod error;
pub mod messages;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message,
    validate_version,
};

#[cfg(feature = "async")]
pub use codec::read_framed_async;
pub use compression::{CompressionType, compress_payload, decompress_payload};
pub use error::{ProtocolError, Result};
pub use messages::{ChannelCapabilities, CompressedData, Message, RedirMessage};
pub use version::{CURRENT_VERSION, ProtocolVersion};
