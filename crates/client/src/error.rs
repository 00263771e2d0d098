//! Error domain of the redirection API
//!
//! Everything the device manager and channels report to callers is folded
//! into [`UsbRedirError`], with enough detail for a UI message.

use crate::redirect::host::HostError;
use crate::redirect::transport::TransportError;
use crate::usb::acl::AclError;
use crate::usb::backend::BackendError;
use crate::usb::filter::FilterParseError;
use common::usb_types::{DeviceErrorKind, DeviceKey};
use std::fmt;
use thiserror::Error;

/// Why a device cannot be redirected right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectDenial {
    /// Redirection is disabled for the session
    Disabled,
    /// The session has no USB channels
    NoChannels,
    /// The remote side's filter refuses the device
    BlockedByGuestFilter,
    /// Every channel is in use
    NoFreeChannel,
    /// The device is not in the registry
    UnknownDevice,
}

impl fmt::Display for RedirectDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            RedirectDenial::Disabled => "USB redirection is disabled",
            RedirectDenial::NoChannels => "The connected VM is not configured for USB redirection",
            RedirectDenial::BlockedByGuestFilter => "Some USB devices are blocked by host policy",
            RedirectDenial::NoFreeChannel => "There are not enough free USB channels",
            RedirectDenial::UnknownDevice => "Unknown USB device",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Error)]
pub enum UsbRedirError {
    #[error("USB redirection channel busy")]
    ChannelBusy,

    #[error("USB redirection context not set")]
    ContextNotSet,

    #[error("Device {0} is already connected")]
    AlreadyConnected(DeviceKey),

    #[error("No free USB channel")]
    NoFreeChannel,

    #[error("Device {0} not found")]
    DeviceNotFound(DeviceKey),

    #[error("{0}")]
    Denied(RedirectDenial),

    #[error(transparent)]
    AccessControl(#[from] AclError),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Could not open device: {0}")]
    Open(BackendError),

    #[error("USB error: {0}")]
    Usb(#[from] BackendError),

    #[error("Unknown USB channel {0}")]
    UnknownChannel(u32),

    #[error("Driver installation failed: {0}")]
    Driver(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("{description} {kind}")]
    Device {
        kind: DeviceErrorKind,
        description: String,
    },

    #[error("Invalid filter: {0}")]
    FilterParse(#[from] FilterParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to start USB event thread: {0}")]
    EventThread(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl UsbRedirError {
    /// Cancellation is an outcome, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            UsbRedirError::Cancelled | UsbRedirError::AccessControl(AclError::Cancelled)
        )
    }

    /// Sub-reason of a device error
    pub fn device_error_kind(&self) -> Option<DeviceErrorKind> {
        match self {
            UsbRedirError::Device { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, UsbRedirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_kinds() {
        assert!(UsbRedirError::Cancelled.is_cancelled());
        assert!(UsbRedirError::from(AclError::Cancelled).is_cancelled());
        assert!(!UsbRedirError::from(AclError::UnexpectedEof).is_cancelled());
        assert!(!UsbRedirError::ChannelBusy.is_cancelled());
    }

    #[test]
    fn test_messages() {
        assert_eq!(UsbRedirError::NoFreeChannel.to_string(), "No free USB channel");

        let error = UsbRedirError::Device {
            kind: DeviceErrorKind::DeviceLost,
            description: "Test Device [1234:5678] at 1-2".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Test Device [1234:5678] at 1-2 disconnected (fatal I/O error)"
        );

        let denied = UsbRedirError::Denied(RedirectDenial::NoFreeChannel);
        assert_eq!(denied.to_string(), "There are not enough free USB channels");
    }
}
