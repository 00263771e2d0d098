//! USB value types shared between the native backend and the redirection core

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB class code for hubs; hubs are never redirected
pub const CLASS_HUB: u8 = 0x09;
/// Device class meaning "defined per interface"
pub const CLASS_PER_INTERFACE: u8 = 0x00;
/// Miscellaneous device class (interface association)
pub const CLASS_MISC: u8 = 0xef;

/// How a backend tells devices apart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingMode {
    /// Bus number and device address (stable while plugged in)
    #[default]
    BusAddress,
    /// Vendor and product id; devices sharing both are indistinguishable
    VendorProduct,
}

/// Identity key of a physical device within the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKey {
    BusAddress { bus: u8, address: u8 },
    VendorProduct { vendor_id: u16, product_id: u16 },
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::BusAddress { bus, address } => write!(f, "{}-{}", bus, address),
            DeviceKey::VendorProduct {
                vendor_id,
                product_id,
            } => write!(f, "{:04x}:{:04x}", vendor_id, product_id),
        }
    }
}

/// The descriptor fields filter rules are evaluated against
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bDeviceClass
    pub class: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub bcd_device: u16,
    /// bInterfaceClass of each interface in the active configuration
    pub interface_classes: Vec<u8>,
}

/// A physical USB device as reported by the native backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interface_classes: Vec<u8>,
    /// Any endpoint in the active configuration is isochronous
    pub has_isochronous: bool,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    /// Identity key under the given addressing mode
    pub fn key(&self, mode: AddressingMode) -> DeviceKey {
        match mode {
            AddressingMode::BusAddress => DeviceKey::BusAddress {
                bus: self.bus_number,
                address: self.device_address,
            },
            AddressingMode::VendorProduct => DeviceKey::VendorProduct {
                vendor_id: self.vendor_id,
                product_id: self.product_id,
            },
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            class: self.class,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            bcd_device: self.bcd_device,
            interface_classes: self.interface_classes.clone(),
        }
    }

    pub fn is_hub(&self) -> bool {
        self.class == CLASS_HUB
    }

    /// Human readable description, e.g. `Logitech USB Receiver [046d:c52b] at 1-4`
    pub fn description(&self) -> String {
        let manufacturer = self.manufacturer.as_deref().unwrap_or("USB");
        let product = self.product.as_deref().unwrap_or("Device");
        format!(
            "{} {} [{:04x}:{:04x}] at {}-{}",
            manufacturer.trim(),
            product.trim(),
            self.vendor_id,
            self.product_id,
            self.bus_number,
            self.device_address
        )
    }
}

/// Why a redirected device failed while traffic was flowing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceErrorKind {
    /// Inbound redirection data could not be parsed
    ParseError,
    /// The device was rejected by the remote side
    DeviceRejected,
    /// The device disappeared or hit a fatal I/O error
    DeviceLost,
    Unknown,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::ParseError => write!(f, "redirection protocol parse error"),
            DeviceErrorKind::DeviceRejected => write!(f, "rejected by the remote side"),
            DeviceErrorKind::DeviceLost => write!(f, "disconnected (fatal I/O error)"),
            DeviceErrorKind::Unknown => write!(f, "unknown error"),
        }
    }
}
