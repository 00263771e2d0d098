//! Registry of physically present devices
//!
//! The registry owns every known [`DeviceInfo`] and hands out identity keys
//! instead of references. Insertion order is preserved so policy scans are
//! deterministic. Only the event loop mutates it.

use common::usb_types::{AddressingMode, DeviceInfo, DeviceKey};
use tracing::debug;

/// Result of offering a device to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Newly registered
    Added(DeviceKey),
    /// A device with the same key is already present
    Duplicate(DeviceKey),
    /// Device class is never redirected (hubs)
    Skipped,
}

/// How a device came to be registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Present during the initial enumeration
    Coldplug,
    /// Reported by a hotplug event
    Hotplug,
}

#[derive(Debug, Clone)]
pub struct RegisteredDevice {
    pub key: DeviceKey,
    pub info: DeviceInfo,
    pub arrival: Arrival,
}

#[derive(Debug)]
pub struct DeviceRegistry {
    mode: AddressingMode,
    devices: Vec<RegisteredDevice>,
}

impl DeviceRegistry {
    pub fn new(mode: AddressingMode) -> Self {
        Self {
            mode,
            devices: Vec::new(),
        }
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        self.mode
    }

    /// Register a device unless its key is taken or its class is excluded
    pub fn add(&mut self, info: DeviceInfo, arrival: Arrival) -> AddOutcome {
        if info.is_hub() {
            debug!(
                "Skipping hub {:04x}:{:04x} at {}-{}",
                info.vendor_id, info.product_id, info.bus_number, info.device_address
            );
            return AddOutcome::Skipped;
        }

        let key = info.key(self.mode);
        if self.find(&key).is_some() {
            debug!("Device {} already registered", key);
            return AddOutcome::Duplicate(key);
        }

        debug!("Registered device {}: {}", key, info.description());
        self.devices.push(RegisteredDevice { key, info, arrival });
        AddOutcome::Added(key)
    }

    /// Remove a device; `None` if no device has this key
    pub fn remove(&mut self, key: &DeviceKey) -> Option<RegisteredDevice> {
        let index = self.devices.iter().position(|d| d.key == *key)?;
        Some(self.devices.remove(index))
    }

    pub fn find(&self, key: &DeviceKey) -> Option<&RegisteredDevice> {
        self.devices.iter().find(|d| d.key == *key)
    }

    /// Devices in registration order
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
