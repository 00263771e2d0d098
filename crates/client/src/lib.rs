//! USB redirection client
//!
//! Discovers local USB devices and redirects them to a remote machine over
//! virtual USB ports multiplexed on a display-protocol connection.
//!
//! - [`usb`]: native side (backend, registry, filters, event thread, ACL helper)
//! - [`redirect`]: redirection channels, host sessions and wire transport
//! - [`manager`]: the [`DeviceManager`] tying both together
//! - [`session`]: per-session ownership of the manager
//! - [`testing`]: in-memory doubles for tests

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod redirect;
pub mod session;
pub mod testing;
pub mod usb;

pub use error::{RedirectDenial, Result, UsbRedirError};
pub use events::{ChannelObserver, DeviceManagerObserver, ManagerEvent};
pub use manager::{DeviceManager, ManagerSettings};
pub use redirect::{ChannelState, FramedTransport, HostFactory, RedirectionHost, WireTransport};
pub use session::Session;
pub use usb::{FilterRules, RusbBackend, UsbBackend};
