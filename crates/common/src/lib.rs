//! Common utilities for the USB redirection workspace
//!
//! This crate provides functionality shared between the native USB backend
//! and the redirection core: USB value types, the async channel bridge that
//! carries events from the background USB thread to the event loop, error
//! handling and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{UsbBridge, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::{setup_logging, setup_test_logging};
pub use usb_types::{AddressingMode, DeviceDescriptor, DeviceErrorKind, DeviceInfo, DeviceKey};
