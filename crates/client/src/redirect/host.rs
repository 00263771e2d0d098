//! Redirection host interface
//!
//! The redirection host packages raw USB transfers of an attached device
//! into the redirection wire format and back. It is an external library as
//! far as this crate is concerned; channels drive it through
//! [`RedirectionHost`] and receive its asynchronous notifications through a
//! [`HostNotifier`].

use crate::usb::backend::UsbDeviceHandle;
use crate::usb::filter::FilterRules;
use common::usb_types::DeviceErrorKind;
use common::{UsbEvent, UsbWorker};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("device rejected by redirection host: {0}")]
    Rejected(String),

    #[error("redirection host failure: {0}")]
    Failed(String),
}

/// Failure while parsing guest-bound data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("redirection host read failed: {kind}")]
pub struct HostReadError {
    pub kind: DeviceErrorKind,
}

/// One redirection host session, owned by a channel
pub trait RedirectionHost: Send {
    /// Attach an opened device
    ///
    /// On failure the host has already closed the handle.
    fn attach(&mut self, handle: Box<dyn UsbDeviceHandle>) -> Result<(), HostError>;

    /// Detach the current device, handing its handle back for closing
    fn detach(&mut self) -> Option<Box<dyn UsbDeviceHandle>>;

    /// Feed data received from the remote side
    fn read_guest_data(&mut self, data: &[u8]) -> Result<(), HostReadError>;

    /// Take all data queued for the remote side, if any
    fn take_guest_data(&mut self) -> Option<Vec<u8>>;

    /// Filter the remote side published, if it published one
    fn guest_filter(&self) -> Option<FilterRules>;
}

/// Creates host sessions for channels
///
/// Installing a factory on a channel is what gives it a USB context.
pub trait HostFactory: Send + Sync {
    fn create(
        &self,
        channel_id: u32,
        notifier: HostNotifier,
    ) -> Result<Box<dyn RedirectionHost>, HostError>;
}

/// Which device binding of a channel is current
///
/// The channel advances it whenever a device is bound or released, so an
/// error queued under one binding is never applied to the next.
#[derive(Debug, Clone, Default)]
pub struct BindingTag(Arc<AtomicU64>);

impl BindingTag {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Route by which a host reports asynchronous conditions to the event loop
///
/// Safe to call from the background USB thread.
#[derive(Clone)]
pub struct HostNotifier {
    channel_id: u32,
    binding: BindingTag,
    sink: UsbWorker,
}

impl HostNotifier {
    pub fn new(channel_id: u32, binding: BindingTag, sink: UsbWorker) -> Self {
        Self {
            channel_id,
            binding,
            sink,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Guest-bound data is waiting to be flushed
    pub fn data_pending(&self) {
        self.notify(UsbEvent::DataPending {
            channel_id: self.channel_id,
        });
    }

    /// The attached device failed; the channel will be force-disconnected
    pub fn device_error(&self, kind: DeviceErrorKind) {
        warn!("Channel {}: device error reported ({})", self.channel_id, kind);
        self.notify(UsbEvent::DeviceError {
            channel_id: self.channel_id,
            binding: self.binding.current(),
            kind,
        });
    }

    fn notify(&self, event: UsbEvent) {
        // Blocking on a full queue from a runtime thread would stall the
        // loop that drains it
        let result = if tokio::runtime::Handle::try_current().is_ok() {
            self.sink.post_event(event)
        } else {
            self.sink.send_event(event)
        };

        if let Err(e) = result {
            error!("Channel {}: failed to queue host event: {}", self.channel_id, e);
        }
    }
}
