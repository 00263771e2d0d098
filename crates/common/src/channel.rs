//! Async channel bridge between the background USB thread and the event loop
//!
//! Everything that happens on the background thread (hotplug callbacks,
//! redirection host notifications) is turned into a [`UsbEvent`] and pushed
//! through this bridge. The event loop is the only place that mutates the
//! device registry or channel state in response.

use crate::usb_types::{DeviceErrorKind, DeviceInfo, DeviceKey};
use async_channel::{Receiver, Sender, bounded};

/// Events produced off the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// Device hot-plugged
    DeviceArrived { device: DeviceInfo },

    /// Device unplugged
    DeviceLeft { key: DeviceKey },

    /// The redirection host of a channel has guest-bound data queued
    DataPending { channel_id: u32 },

    /// The redirection host of a channel hit a device error
    ///
    /// `binding` identifies the device binding the error was raised under.
    DeviceError {
        channel_id: u32,
        binding: u64,
        kind: DeviceErrorKind,
    },
}

/// Event-loop side of the bridge
#[derive(Clone)]
pub struct UsbBridge {
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Receive the next event
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an event if one is queued
    pub fn try_recv_event(&self) -> Option<UsbEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.event_rx.len()
    }
}

/// Background-thread side of the bridge
#[derive(Clone)]
pub struct UsbWorker {
    event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Send an event to the event loop (blocking)
    ///
    /// Used from threads that are not driven by the async runtime.
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Queue an event without blocking
    ///
    /// Used from inside the event loop itself, where blocking on a full
    /// queue would deadlock.
    pub fn post_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Create the event bridge
///
/// Returns (UsbBridge for the event loop, UsbWorker for producers)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (event_tx, event_rx) = bounded(256);

    (UsbBridge { event_rx }, UsbWorker { event_tx })
}
