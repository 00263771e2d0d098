//! Redirection side: virtual USB ports towards the remote machine

pub mod channel;
pub mod host;
pub mod transport;

pub use channel::{ChannelState, DeviceFailure, RedirChannel};
pub use host::{BindingTag, HostError, HostFactory, HostNotifier, HostReadError, RedirectionHost};
pub use transport::{FramedTransport, TransportError, WireTransport, receive_message};
