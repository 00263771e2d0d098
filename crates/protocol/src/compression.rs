//! Payload compression for redirection data
//!
//! Payloads are compressed as raw LZ4 blocks. The block itself carries no
//! length, so the uncompressed size travels next to it in
//! [`CompressedData`](crate::CompressedData).

use crate::codec::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Compression algorithm tag carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    Lz4,
}

/// Compress a payload
pub fn compress_payload(kind: CompressionType, input: &[u8]) -> Vec<u8> {
    match kind {
        CompressionType::Lz4 => lz4_flex::block::compress(input),
    }
}

/// Decompress a payload, checking it against the announced size
///
/// The size comes from the peer, so anything larger than a frame may carry
/// is rejected before the output buffer is allocated.
pub fn decompress_payload(
    kind: CompressionType,
    compressed: &[u8],
    uncompressed_size: u32,
) -> Result<Vec<u8>> {
    if uncompressed_size == 0 {
        return Err(ProtocolError::EmptyCompressedPayload);
    }
    let expected = uncompressed_size as usize;
    if expected > MAX_FRAME_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: expected,
            max: MAX_FRAME_SIZE,
        });
    }

    let decoded = match kind {
        CompressionType::Lz4 => lz4_flex::block::decompress(compressed, expected)?,
    };

    if decoded.len() != expected {
        return Err(ProtocolError::SizeMismatch {
            expected,
            actual: decoded.len(),
        });
    }
    Ok(decoded)
}
