//! Wire side of a redirection channel
//!
//! Outbound messages go through a [`WireTransport`]; inbound frames are read
//! off a byte stream with [`receive_message`].

use protocol::{
    CURRENT_VERSION, ChannelCapabilities, Message, ProtocolError, RedirMessage, encode_framed,
    read_framed_async, validate_version,
};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(#[from] ProtocolError),

    #[error("bad frame from peer: {0}")]
    Decode(ProtocolError),
}

/// Outbound half of a virtual USB wire connection
pub trait WireTransport: Send + Sync {
    /// Queue a message for the remote side; never blocks
    fn send(&self, message: RedirMessage) -> Result<(), TransportError>;

    /// Whether the peer advertised support for compressed data
    fn peer_supports_compression(&self) -> bool;

    /// Record the capabilities the peer announced
    fn set_peer_capabilities(&self, capabilities: ChannelCapabilities);

    /// Connection to a local or otherwise trusted endpoint
    fn is_local(&self) -> bool;
}

/// Transport writing length-prefixed postcard frames into a byte pipe
///
/// Whatever drains the receiving end (a socket writer task, a test) sees
/// exactly the frames produced by [`encode_framed`].
pub struct FramedTransport {
    tx: async_channel::Sender<Vec<u8>>,
    peer_compression: AtomicBool,
    local: bool,
}

impl FramedTransport {
    pub fn new(tx: async_channel::Sender<Vec<u8>>, local: bool) -> Self {
        Self {
            tx,
            peer_compression: AtomicBool::new(false),
            local,
        }
    }

    /// Transport plus the receiving end of its frame pipe
    pub fn pipe(local: bool) -> (Self, async_channel::Receiver<Vec<u8>>) {
        let (tx, rx) = async_channel::unbounded();
        (Self::new(tx, local), rx)
    }

    /// Announce our own capabilities to the peer
    pub fn send_capabilities(&self) -> Result<(), TransportError> {
        self.send(RedirMessage::Capabilities(ChannelCapabilities {
            compression: true,
        }))
    }
}

impl WireTransport for FramedTransport {
    fn send(&self, message: RedirMessage) -> Result<(), TransportError> {
        let payload_len = message.wire_payload_len();
        let frame = encode_framed(&Message {
            version: CURRENT_VERSION,
            payload: message,
        })?;
        trace!("Sending frame: {} bytes ({} payload)", frame.len(), payload_len);
        self.tx.try_send(frame).map_err(|_| TransportError::Closed)
    }

    fn peer_supports_compression(&self) -> bool {
        self.peer_compression.load(Ordering::Acquire)
    }

    fn set_peer_capabilities(&self, capabilities: ChannelCapabilities) {
        self.peer_compression
            .store(capabilities.compression, Ordering::Release);
    }

    fn is_local(&self) -> bool {
        self.local
    }
}

/// Read the next message the peer sent
///
/// Returns `None` when the stream ends cleanly between frames. Peers on an
/// older minor version cannot read compressed data, so a compression
/// capability they announce is dropped.
pub async fn receive_message<R>(reader: &mut R) -> Result<Option<RedirMessage>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let Some(message) = read_framed_async(reader)
        .await
        .map_err(TransportError::Decode)?
    else {
        return Ok(None);
    };
    validate_version(&message.version).map_err(TransportError::Decode)?;

    let payload = match message.payload {
        RedirMessage::Capabilities(capabilities)
            if capabilities.compression && !message.version.supports_compression() =>
        {
            debug!("Peer {} cannot read compressed data", message.version);
            RedirMessage::Capabilities(ChannelCapabilities { compression: false })
        }
        payload => payload,
    };
    Ok(Some(payload))
}
