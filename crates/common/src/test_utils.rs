//! Test utilities for the USB redirection workspace
//!
//! Device builders and async helpers used by tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_info, create_mock_hid_device};
//!
//! let device = create_mock_device_info(1, 2, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(create_mock_hid_device(1, 3).class, 0x03);
//! ```

use crate::usb_types::DeviceInfo;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceInfo at the given bus position
///
/// # Arguments
/// * `bus` - Bus number
/// * `address` - Device address on the bus
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_device_info(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    create_mock_device_info_with_class(bus, address, vendor_id, product_id, 0x00)
}

/// Create a mock DeviceInfo with a specific device class
pub fn create_mock_device_info_with_class(
    bus: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
    class: u8,
) -> DeviceInfo {
    DeviceInfo {
        bus_number: bus,
        device_address: address,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        class,
        subclass: 0x00,
        protocol: 0x00,
        interface_classes: Vec::new(),
        has_isochronous: false,
        manufacturer: Some(format!("Test Manufacturer {}", address)),
        product: Some(format!("Test Product {}", address)),
        serial_number: Some(format!("SN{:03}{:03}", bus, address)),
    }
}

/// Create a mock mass storage device
pub fn create_mock_mass_storage_device(bus: u8, address: u8) -> DeviceInfo {
    create_mock_device_info_with_class(bus, address, 0x0781, 0x5581, 0x08)
}

/// Create a mock HID device (keyboard/mouse)
pub fn create_mock_hid_device(bus: u8, address: u8) -> DeviceInfo {
    create_mock_device_info_with_class(bus, address, 0x046d, 0xc52b, 0x03)
}

/// Create a mock hub device
pub fn create_mock_hub_device(bus: u8, address: u8) -> DeviceInfo {
    create_mock_device_info_with_class(bus, address, 0x05e3, 0x0608, 0x09)
}

/// Create a mock webcam: composite device with isochronous video endpoints
pub fn create_mock_webcam_device(bus: u8, address: u8) -> DeviceInfo {
    let mut device = create_mock_device_info_with_class(bus, address, 0x046d, 0x0825, 0xef);
    device.interface_classes = vec![0x0e, 0x0e, 0x01, 0x01];
    device.has_isochronous = true;
    device
}

/// Create a list of distinct mock devices on bus 1
pub fn create_mock_device_list(count: u8) -> Vec<DeviceInfo> {
    (1..=count)
        .map(|i| create_mock_device_info(1, i, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// Create a compressible bulk payload
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 8) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_list_is_distinct() {
        let devices = create_mock_device_list(4);
        assert_eq!(devices.len(), 4);
        for (i, a) in devices.iter().enumerate() {
            for b in devices.iter().skip(i + 1) {
                assert_ne!(a.device_address, b.device_address);
            }
        }
    }

    #[test]
    fn test_webcam_is_composite_iso() {
        let cam = create_mock_webcam_device(2, 7);
        assert_eq!(cam.class, crate::usb_types::CLASS_MISC);
        assert!(cam.has_isochronous);
        assert!(!cam.interface_classes.is_empty());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
