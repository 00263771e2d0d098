//! libusb backend via rusb
//!
//! Enumerates devices, opens them for redirection (detaching kernel drivers
//! and claiming every interface of the active configuration), and forwards
//! libusb hotplug callbacks onto the event bridge.

use crate::usb::backend::{BackendError, HotplugRegistration, UsbBackend, UsbDeviceHandle};
use common::usb_types::{AddressingMode, DeviceInfo, DeviceKey};
use common::{UsbEvent, UsbWorker};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Backend over a libusb context
pub struct RusbBackend {
    context: Context,
    mode: AddressingMode,
}

impl RusbBackend {
    /// Create a backend with its own libusb context
    pub fn new(mode: AddressingMode) -> Result<Self, BackendError> {
        let context = Context::new().map_err(|e| BackendError::Context(e.to_string()))?;
        Ok(Self { context, mode })
    }

    fn find_device(&self, key: &DeviceKey) -> Result<Device<Context>, BackendError> {
        let devices = self.context.devices()?;
        devices
            .iter()
            .find(|device| device_key(device, self.mode).as_ref() == Some(key))
            .ok_or(BackendError::NotFound)
    }
}

impl UsbBackend for RusbBackend {
    fn addressing_mode(&self) -> AddressingMode {
        self.mode
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        let devices = self.context.devices()?;
        let mut infos = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            match device_info(&device, true) {
                Ok(info) => infos.push(info),
                Err(e) => warn!(
                    "Skipping device at {}-{}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        debug!("Enumerated {} devices", infos.len());
        Ok(infos)
    }

    fn open(&self, key: &DeviceKey) -> Result<Box<dyn UsbDeviceHandle>, BackendError> {
        let device = self.find_device(key)?;
        let handle = RusbDeviceHandle::open(device, *key)?;
        Ok(Box::new(handle))
    }

    fn subscribe_hotplug(
        &self,
        sink: UsbWorker,
    ) -> Result<Option<Box<dyn HotplugRegistration>>, BackendError> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hotplug support on this platform");
            return Ok(None);
        }

        let forwarder = HotplugForwarder {
            sink,
            mode: self.mode,
        };
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(forwarder))?;

        debug!("Hot-plug callbacks registered");
        Ok(Some(Box::new(RusbHotplugRegistration {
            _registration: registration,
        })))
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), BackendError> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct RusbHotplugRegistration {
    _registration: Registration<Context>,
}

impl HotplugRegistration for RusbHotplugRegistration {}

/// Forwards libusb hotplug callbacks to the event loop
struct HotplugForwarder {
    sink: UsbWorker,
    mode: AddressingMode,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        // libusb forbids I/O from inside hotplug callbacks, so no strings
        match device_info(&device, false) {
            Ok(info) => {
                debug!(
                    "Hot-plug: device arrived (bus={}, addr={})",
                    info.bus_number, info.device_address
                );
                if let Err(e) = self.sink.send_event(UsbEvent::DeviceArrived { device: info }) {
                    error!("Failed to forward DeviceArrived event: {}", e);
                }
            }
            Err(e) => warn!("Hot-plug: unreadable device descriptor: {}", e),
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let Some(key) = device_key(&device, self.mode) else {
            warn!(
                "Hot-plug: cannot identify departed device at {}-{}",
                device.bus_number(),
                device.address()
            );
            return;
        };
        debug!("Hot-plug: device left ({})", key);
        if let Err(e) = self.sink.send_event(UsbEvent::DeviceLeft { key }) {
            error!("Failed to forward DeviceLeft event: {}", e);
        }
    }
}

/// An opened device with its claimed interfaces
struct RusbDeviceHandle {
    key: DeviceKey,
    handle: DeviceHandle<Context>,
    claimed_interfaces: Vec<u8>,
}

impl RusbDeviceHandle {
    fn open(device: Device<Context>, key: DeviceKey) -> Result<Self, BackendError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", key, e);
            BackendError::from(e)
        })?;
        debug!("Opened device {}", key);

        let config = device.active_config_descriptor()?;
        let mut opened = Self {
            key,
            handle,
            claimed_interfaces: Vec::new(),
        };

        for interface in config.interfaces() {
            let number = interface.number();

            match opened.handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {} on {}", number, key);
                    if let Err(e) = opened.handle.detach_kernel_driver(number) {
                        warn!("Failed to detach kernel driver from interface {}: {}", number, e);
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("Kernel driver state unknown for interface {}: {}", number, e),
            }

            if let Err(e) = opened.handle.claim_interface(number) {
                warn!("Failed to claim interface {} on {}: {}", number, key, e);
                opened.release();
                return Err(e.into());
            }
            opened.claimed_interfaces.push(number);
        }

        Ok(opened)
    }

    /// Release claimed interfaces and hand them back to kernel drivers
    fn release(&mut self) {
        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = self.handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
    }
}

impl UsbDeviceHandle for RusbDeviceHandle {
    fn key(&self) -> DeviceKey {
        self.key
    }

    fn close(mut self: Box<Self>) {
        self.release();
        debug!("Closed device {}", self.key);
    }
}

impl Drop for RusbDeviceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn device_key(device: &Device<Context>, mode: AddressingMode) -> Option<DeviceKey> {
    match mode {
        AddressingMode::BusAddress => Some(DeviceKey::BusAddress {
            bus: device.bus_number(),
            address: device.address(),
        }),
        AddressingMode::VendorProduct => {
            let desc = device.device_descriptor().ok()?;
            Some(DeviceKey::VendorProduct {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            })
        }
    }
}

/// Encode a rusb version back into its bcd form
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16 & 0x0f) << 4)
        | (version.sub_minor() as u16 & 0x0f)
}

fn device_info(device: &Device<Context>, read_strings: bool) -> Result<DeviceInfo, BackendError> {
    let descriptor = device.device_descriptor()?;

    let mut interface_classes = Vec::new();
    let mut has_isochronous = false;
    if let Ok(config) = device.active_config_descriptor() {
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.setting_number() == 0 {
                    interface_classes.push(alt.class_code());
                }
                has_isochronous |= alt
                    .endpoint_descriptors()
                    .any(|ep| ep.transfer_type() == rusb::TransferType::Isochronous);
            }
        }
    }

    let (manufacturer, product, serial_number) = if read_strings {
        read_string_descriptors(device, &descriptor)
    } else {
        (None, None, None)
    };

    Ok(DeviceInfo {
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: version_to_bcd(descriptor.device_version()),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        interface_classes,
        has_isochronous,
        manufacturer,
        product,
        serial_number,
    })
}

fn read_string_descriptors(
    device: &Device<Context>,
    descriptor: &rusb::DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let Ok(handle) = device.open() else {
        return (None, None, None);
    };

    let read = |index: Option<u8>| index.and_then(|i| handle.read_string_descriptor_ascii(i).ok());
    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}
