//! Redirection channel message definitions
//!
//! A virtual USB port carries three kinds of messages:
//! - a capability announcement, sent once when the channel comes up
//! - raw redirection data produced or consumed by the redirection host
//! - transport-compressed redirection data

use crate::compression::CompressionType;
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Top-level message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message payload
    pub payload: RedirMessage,
}

/// Capabilities a peer advertises for its end of the channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    /// Peer accepts `RedirMessage::CompressedData`
    pub compression: bool,
}

/// Compressed redirection data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedData {
    /// Algorithm used for `data`
    pub algorithm: CompressionType,
    /// Length of the payload once decompressed
    pub uncompressed_size: u32,
    /// Compressed bytes
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// All message types carried by a redirection channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirMessage {
    /// Capability announcement
    Capabilities(ChannelCapabilities),

    /// Raw redirection data
    Data {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Transport-compressed redirection data
    CompressedData(CompressedData),
}

impl RedirMessage {
    /// Size of the redirection payload as carried on the wire
    pub fn wire_payload_len(&self) -> usize {
        match self {
            RedirMessage::Capabilities(_) => 0,
            RedirMessage::Data { data } => data.len(),
            RedirMessage::CompressedData(compressed) => compressed.data.len(),
        }
    }
}
