//! Native USB backend interface
//!
//! The device manager and redirection channels are written once against
//! [`UsbBackend`]; each platform supplies an implementation. The backend is
//! shared between the event loop (enumeration, open) and the background
//! event thread (`handle_events`), so implementations must be `Send + Sync`.

use common::usb_types::{AddressingMode, DeviceInfo, DeviceKey};
use common::UsbWorker;
use std::time::Duration;
use thiserror::Error;

/// Native USB failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("device not found")]
    NotFound,

    #[error("access denied")]
    Access,

    #[error("device is busy")]
    Busy,

    #[error("operation not supported")]
    NotSupported,

    #[error("USB context unavailable: {0}")]
    Context(String),

    #[error("driver installation failed: {0}")]
    Driver(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusb::Error> for BackendError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NotFound | rusb::Error::NoDevice => BackendError::NotFound,
            rusb::Error::Access => BackendError::Access,
            rusb::Error::Busy => BackendError::Busy,
            rusb::Error::NotSupported => BackendError::NotSupported,
            other => BackendError::Other(other.to_string()),
        }
    }
}

/// An opened native device handle
///
/// Owned exclusively by one redirection channel while bound.
pub trait UsbDeviceHandle: Send {
    /// Identity of the device this handle was opened for
    fn key(&self) -> DeviceKey;

    /// Release the handle, returning interfaces to the host OS
    ///
    /// A handle that is dropped without being closed is released as well.
    fn close(self: Box<Self>);
}

/// Keeps a hotplug callback registered; dropping it unregisters
pub trait HotplugRegistration: Send {}

/// Capability set of a native USB stack
pub trait UsbBackend: Send + Sync {
    /// How devices are identified on this backend
    fn addressing_mode(&self) -> AddressingMode;

    /// List the devices currently present
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, BackendError>;

    /// Open the device currently matching `key`
    ///
    /// The device is looked up afresh rather than through a retained
    /// reference, so a handle invalidated by a driver swap is not reused.
    fn open(&self, key: &DeviceKey) -> Result<Box<dyn UsbDeviceHandle>, BackendError>;

    /// Register for hotplug notifications
    ///
    /// Arrivals and removals are delivered as `UsbEvent`s through `sink`
    /// from whatever thread the native stack reports them on. Returns
    /// `Ok(None)` when the platform has no hotplug support.
    fn subscribe_hotplug(
        &self,
        sink: UsbWorker,
    ) -> Result<Option<Box<dyn HotplugRegistration>>, BackendError>;

    /// Process pending native events, blocking for at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<(), BackendError>;

    /// Prepare a device for redirection (e.g. swap in a generic driver)
    fn install_driver(&self, _device: &DeviceInfo) -> Result<(), BackendError> {
        Ok(())
    }

    /// Undo `install_driver` once the device is no longer redirected
    fn uninstall_driver(&self, _device: &DeviceInfo) -> Result<(), BackendError> {
        Ok(())
    }

    /// Whether `install_driver`/`uninstall_driver` do anything here
    fn needs_driver_install(&self) -> bool {
        false
    }
}
