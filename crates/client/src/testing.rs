//! In-memory doubles for exercising the redirection core without hardware
//!
//! ```
//! use client::testing::MockBackend;
//! use client::usb::UsbBackend;
//! use common::test_utils::create_mock_hid_device;
//!
//! let backend = MockBackend::new();
//! backend.add_device(create_mock_hid_device(1, 2));
//! assert_eq!(backend.enumerate().unwrap().len(), 1);
//! ```

use crate::error::UsbRedirError;
use crate::events::{DeviceManagerObserver, ManagerEvent};
use crate::redirect::host::{HostError, HostFactory, HostNotifier, HostReadError, RedirectionHost};
use crate::redirect::transport::{TransportError, WireTransport};
use crate::usb::backend::{BackendError, HotplugRegistration, UsbBackend, UsbDeviceHandle};
use crate::usb::filter::FilterRules;
use crate::usb::registry::RegisteredDevice;
use common::usb_types::{AddressingMode, DeviceErrorKind, DeviceInfo, DeviceKey};
use common::{UsbEvent, UsbWorker};
use protocol::{ChannelCapabilities, RedirMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Driver hook invocation recorded by [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Install(DeviceKey),
    Uninstall(DeviceKey),
}

#[derive(Default)]
struct MockBackendState {
    devices: Vec<DeviceInfo>,
    open_failures: HashMap<DeviceKey, BackendError>,
    open_delay: Option<Duration>,
    event_delay: Option<Duration>,
    opens: usize,
    hotplug: Option<UsbWorker>,
    driver_calls: Vec<DriverCall>,
}

/// Backend over an in-memory device list
pub struct MockBackend {
    mode: AddressingMode,
    state: Mutex<MockBackendState>,
    open_handles: Arc<Mutex<Vec<DeviceKey>>>,
    polls: AtomicUsize,
    needs_driver_install: AtomicBool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_mode(AddressingMode::BusAddress)
    }

    pub fn with_mode(mode: AddressingMode) -> Self {
        Self {
            mode,
            state: Mutex::new(MockBackendState::default()),
            open_handles: Arc::new(Mutex::new(Vec::new())),
            polls: AtomicUsize::new(0),
            needs_driver_install: AtomicBool::new(false),
        }
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        let backend = Self::new();
        lock(&backend.state).devices = devices;
        backend
    }

    /// Make a device present without announcing it
    pub fn add_device(&self, device: DeviceInfo) {
        lock(&self.state).devices.push(device);
    }

    /// Plug a device in, announcing it to the hotplug subscriber
    pub fn plug(&self, device: DeviceInfo) {
        let sink = {
            let mut state = lock(&self.state);
            state.devices.push(device.clone());
            state.hotplug.clone()
        };
        if let Some(sink) = sink
            && let Err(e) = sink.post_event(UsbEvent::DeviceArrived { device })
        {
            warn!("Mock hotplug arrival dropped: {}", e);
        }
    }

    /// Unplug a device, announcing it to the hotplug subscriber
    pub fn unplug(&self, key: DeviceKey) {
        let sink = {
            let mut state = lock(&self.state);
            let mode = self.mode;
            state.devices.retain(|device| device.key(mode) != key);
            state.hotplug.clone()
        };
        if let Some(sink) = sink
            && let Err(e) = sink.post_event(UsbEvent::DeviceLeft { key })
        {
            warn!("Mock hotplug removal dropped: {}", e);
        }
    }

    /// Make opening `key` fail with `error`
    pub fn fail_open(&self, key: DeviceKey, error: BackendError) {
        lock(&self.state).open_failures.insert(key, error);
    }

    /// Make every open block for `delay` first
    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = Some(delay);
    }

    /// Make each `handle_events` call block for up to `delay`
    pub fn set_event_delay(&self, delay: Duration) {
        lock(&self.state).event_delay = Some(delay);
    }

    pub fn set_needs_driver_install(&self, needed: bool) {
        self.needs_driver_install.store(needed, Ordering::SeqCst);
    }

    /// Devices with a handle currently open
    pub fn open_devices(&self) -> Vec<DeviceKey> {
        lock(&self.open_handles).clone()
    }

    /// Successful opens so far
    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn driver_calls(&self) -> Vec<DriverCall> {
        lock(&self.state).driver_calls.clone()
    }

    pub fn has_hotplug_subscriber(&self) -> bool {
        lock(&self.state).hotplug.is_some()
    }

    /// Calls to `handle_events` so far
    pub fn event_polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

struct MockHotplugRegistration;

impl HotplugRegistration for MockHotplugRegistration {}

struct MockDeviceHandle {
    key: DeviceKey,
    open_handles: Arc<Mutex<Vec<DeviceKey>>>,
}

impl UsbDeviceHandle for MockDeviceHandle {
    fn key(&self) -> DeviceKey {
        self.key
    }

    fn close(self: Box<Self>) {}
}

impl Drop for MockDeviceHandle {
    fn drop(&mut self) {
        let mut open = lock(&self.open_handles);
        if let Some(index) = open.iter().position(|key| *key == self.key) {
            open.remove(index);
        }
    }
}

impl UsbBackend for MockBackend {
    fn addressing_mode(&self) -> AddressingMode {
        self.mode
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        Ok(lock(&self.state).devices.clone())
    }

    fn open(&self, key: &DeviceKey) -> Result<Box<dyn UsbDeviceHandle>, BackendError> {
        let delay = lock(&self.state).open_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        if let Some(error) = state.open_failures.get(key) {
            return Err(error.clone());
        }
        if !state.devices.iter().any(|d| d.key(self.mode) == *key) {
            return Err(BackendError::NotFound);
        }

        state.opens += 1;
        lock(&self.open_handles).push(*key);
        Ok(Box::new(MockDeviceHandle {
            key: *key,
            open_handles: Arc::clone(&self.open_handles),
        }))
    }

    fn subscribe_hotplug(
        &self,
        sink: UsbWorker,
    ) -> Result<Option<Box<dyn HotplugRegistration>>, BackendError> {
        lock(&self.state).hotplug = Some(sink);
        Ok(Some(Box::new(MockHotplugRegistration)))
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.state)
            .event_delay
            .unwrap_or(Duration::from_millis(5));
        std::thread::sleep(timeout.min(delay));
        Ok(())
    }

    fn install_driver(&self, device: &DeviceInfo) -> Result<(), BackendError> {
        lock(&self.state)
            .driver_calls
            .push(DriverCall::Install(device.key(self.mode)));
        Ok(())
    }

    fn uninstall_driver(&self, device: &DeviceInfo) -> Result<(), BackendError> {
        lock(&self.state)
            .driver_calls
            .push(DriverCall::Uninstall(device.key(self.mode)));
        Ok(())
    }

    fn needs_driver_install(&self) -> bool {
        self.needs_driver_install.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockHostState {
    handle: Option<Box<dyn UsbDeviceHandle>>,
    received: Vec<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    guest_filter: Option<FilterRules>,
    attach_error: Option<HostError>,
    read_error: Option<DeviceErrorKind>,
}

/// Test-side view of one [`MockHost`]
#[derive(Clone)]
pub struct MockHostControl {
    state: Arc<Mutex<MockHostState>>,
    notifier: HostNotifier,
}

impl MockHostControl {
    /// Device currently attached to the host
    pub fn attached(&self) -> Option<DeviceKey> {
        lock(&self.state).handle.as_ref().map(|handle| handle.key())
    }

    /// Data received from the remote side, one entry per message
    pub fn received(&self) -> Vec<Vec<u8>> {
        lock(&self.state).received.clone()
    }

    /// Queue guest-bound data and signal it like a real host would
    pub fn queue_guest_data(&self, data: Vec<u8>) {
        lock(&self.state).outbound.push_back(data);
        self.notifier.data_pending();
    }

    pub fn fail_next_read(&self, kind: DeviceErrorKind) {
        lock(&self.state).read_error = Some(kind);
    }

    pub fn fail_next_attach(&self, error: HostError) {
        lock(&self.state).attach_error = Some(error);
    }

    /// Report an asynchronous device failure
    pub fn report_device_error(&self, kind: DeviceErrorKind) {
        self.notifier.device_error(kind);
    }

    pub fn set_guest_filter(&self, filter: Option<FilterRules>) {
        lock(&self.state).guest_filter = filter;
    }
}

/// Redirection host recording everything it is asked to do
pub struct MockHost {
    state: Arc<Mutex<MockHostState>>,
}

impl RedirectionHost for MockHost {
    fn attach(&mut self, handle: Box<dyn UsbDeviceHandle>) -> Result<(), HostError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.attach_error.take() {
            handle.close();
            return Err(error);
        }
        state.handle = Some(handle);
        Ok(())
    }

    fn detach(&mut self) -> Option<Box<dyn UsbDeviceHandle>> {
        lock(&self.state).handle.take()
    }

    fn read_guest_data(&mut self, data: &[u8]) -> Result<(), HostReadError> {
        let mut state = lock(&self.state);
        if let Some(kind) = state.read_error.take() {
            return Err(HostReadError { kind });
        }
        state.received.push(data.to_vec());
        Ok(())
    }

    fn take_guest_data(&mut self) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.outbound.is_empty() {
            return None;
        }
        Some(state.outbound.drain(..).flatten().collect())
    }

    fn guest_filter(&self) -> Option<FilterRules> {
        lock(&self.state).guest_filter.clone()
    }
}

/// Factory handing out [`MockHost`]s and keeping their controls by channel
#[derive(Default)]
pub struct MockHostFactory {
    hosts: Mutex<HashMap<u32, MockHostControl>>,
    created: AtomicUsize,
    guest_filter: Mutex<Option<FilterRules>>,
}

impl MockHostFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guest filter every subsequently created host publishes
    pub fn with_guest_filter(filter: FilterRules) -> Self {
        let factory = Self::new();
        *lock(&factory.guest_filter) = Some(filter);
        factory
    }

    /// Control of the latest host created for `channel_id`
    pub fn host(&self, channel_id: u32) -> Option<MockHostControl> {
        lock(&self.hosts).get(&channel_id).cloned()
    }

    pub fn hosts_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl HostFactory for MockHostFactory {
    fn create(
        &self,
        channel_id: u32,
        notifier: HostNotifier,
    ) -> Result<Box<dyn RedirectionHost>, HostError> {
        let state = Arc::new(Mutex::new(MockHostState {
            guest_filter: lock(&self.guest_filter).clone(),
            ..MockHostState::default()
        }));

        lock(&self.hosts).insert(
            channel_id,
            MockHostControl {
                state: Arc::clone(&state),
                notifier,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHost { state }))
    }
}

/// Transport keeping every sent message in memory
pub struct RecordingTransport {
    sent: Mutex<Vec<RedirMessage>>,
    peer_compression: AtomicBool,
    local: bool,
}

impl RecordingTransport {
    pub fn new(peer_compression: bool, local: bool) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            peer_compression: AtomicBool::new(peer_compression),
            local,
        }
    }

    pub fn sent(&self) -> Vec<RedirMessage> {
        lock(&self.sent).clone()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl WireTransport for RecordingTransport {
    fn send(&self, message: RedirMessage) -> Result<(), TransportError> {
        lock(&self.sent).push(message);
        Ok(())
    }

    fn peer_supports_compression(&self) -> bool {
        self.peer_compression.load(Ordering::SeqCst)
    }

    fn set_peer_capabilities(&self, capabilities: ChannelCapabilities) {
        self.peer_compression
            .store(capabilities.compression, Ordering::SeqCst);
    }

    fn is_local(&self) -> bool {
        self.local
    }
}

/// Observer keeping every notification in order
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ManagerEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ManagerEvent> {
        lock(&self.events).clone()
    }

    pub fn added(&self) -> Vec<DeviceKey> {
        self.keys(|event| matches!(event, ManagerEvent::DeviceAdded(_)))
    }

    pub fn removed(&self) -> Vec<DeviceKey> {
        self.keys(|event| matches!(event, ManagerEvent::DeviceRemoved(_)))
    }

    pub fn auto_connect_failures(&self) -> Vec<DeviceKey> {
        self.keys(|event| matches!(event, ManagerEvent::AutoConnectFailed { .. }))
    }

    pub fn device_errors(&self) -> Vec<(DeviceKey, DeviceErrorKind)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ManagerEvent::DeviceError { device, kind, .. } => Some((device.key, *kind)),
                _ => None,
            })
            .collect()
    }

    fn keys(&self, filter: impl Fn(&ManagerEvent) -> bool) -> Vec<DeviceKey> {
        lock(&self.events)
            .iter()
            .filter(|event| filter(event))
            .map(|event| event.device().key)
            .collect()
    }
}

impl DeviceManagerObserver for RecordingObserver {
    fn device_added(&self, device: &RegisteredDevice) {
        lock(&self.events).push(ManagerEvent::DeviceAdded(device.clone()));
    }

    fn device_removed(&self, device: &RegisteredDevice) {
        lock(&self.events).push(ManagerEvent::DeviceRemoved(device.clone()));
    }

    fn auto_connect_failed(&self, device: &RegisteredDevice, error: &UsbRedirError) {
        lock(&self.events).push(ManagerEvent::auto_connect_failed(device, error));
    }

    fn device_error(&self, device: &RegisteredDevice, error: &UsbRedirError) {
        lock(&self.events).push(ManagerEvent::device_error(device, error));
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
