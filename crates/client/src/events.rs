//! Notifications emitted by the device manager
//!
//! Observers are invoked synchronously on the task that caused the
//! notification, so implementations should return quickly.

use crate::error::UsbRedirError;
use crate::usb::registry::RegisteredDevice;
use async_channel::{Receiver, Sender, unbounded};
use common::usb_types::DeviceErrorKind;
use tracing::warn;

pub trait DeviceManagerObserver: Send + Sync {
    fn device_added(&self, _device: &RegisteredDevice) {}

    fn device_removed(&self, _device: &RegisteredDevice) {}

    /// An automatic connect (auto-connect or redirect-on-connect) failed
    fn auto_connect_failed(&self, _device: &RegisteredDevice, _error: &UsbRedirError) {}

    /// A redirected device failed and was force-disconnected
    fn device_error(&self, _device: &RegisteredDevice, _error: &UsbRedirError) {}
}

/// Owned form of a notification
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    DeviceAdded(RegisteredDevice),
    DeviceRemoved(RegisteredDevice),
    AutoConnectFailed {
        device: RegisteredDevice,
        reason: String,
        cancelled: bool,
    },
    DeviceError {
        device: RegisteredDevice,
        kind: DeviceErrorKind,
        reason: String,
    },
}

impl ManagerEvent {
    pub fn device(&self) -> &RegisteredDevice {
        match self {
            ManagerEvent::DeviceAdded(device) | ManagerEvent::DeviceRemoved(device) => device,
            ManagerEvent::AutoConnectFailed { device, .. }
            | ManagerEvent::DeviceError { device, .. } => device,
        }
    }

    pub(crate) fn auto_connect_failed(device: &RegisteredDevice, error: &UsbRedirError) -> Self {
        ManagerEvent::AutoConnectFailed {
            device: device.clone(),
            reason: error.to_string(),
            cancelled: error.is_cancelled(),
        }
    }

    pub(crate) fn device_error(device: &RegisteredDevice, error: &UsbRedirError) -> Self {
        ManagerEvent::DeviceError {
            device: device.clone(),
            kind: error
                .device_error_kind()
                .unwrap_or(DeviceErrorKind::Unknown),
            reason: error.to_string(),
        }
    }
}

/// Observer forwarding notifications into an async channel
pub struct ChannelObserver {
    tx: Sender<ManagerEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<ManagerEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ManagerEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("Dropping device manager notification: receiver closed");
        }
    }
}

impl DeviceManagerObserver for ChannelObserver {
    fn device_added(&self, device: &RegisteredDevice) {
        self.forward(ManagerEvent::DeviceAdded(device.clone()));
    }

    fn device_removed(&self, device: &RegisteredDevice) {
        self.forward(ManagerEvent::DeviceRemoved(device.clone()));
    }

    fn auto_connect_failed(&self, device: &RegisteredDevice, error: &UsbRedirError) {
        self.forward(ManagerEvent::auto_connect_failed(device, error));
    }

    fn device_error(&self, device: &RegisteredDevice, error: &UsbRedirError) {
        self.forward(ManagerEvent::device_error(device, error));
    }
}
