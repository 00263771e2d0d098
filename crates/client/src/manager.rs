//! USB device manager
//!
//! Owns the device registry and the session's redirection channels, applies
//! the auto-connect and redirect-on-connect policies and exposes the
//! connect/disconnect API.
//!
//! Events from the background USB thread (hotplug, host notifications)
//! arrive over the [`common::UsbBridge`] and are handled by the event loop
//! started with [`DeviceManager::spawn_event_loop`]. A device is bound to at
//! most one channel: picking and binding a channel happen under the channel
//! set lock.

use crate::error::{RedirectDenial, Result, UsbRedirError};
use crate::events::DeviceManagerObserver;
use crate::redirect::channel::{ChannelState, DeviceFailure, RedirChannel};
use crate::redirect::host::HostFactory;
use crate::redirect::transport::{WireTransport, receive_message};
use crate::usb::acl::AclHelper;
use crate::usb::backend::{HotplugRegistration, UsbBackend};
use crate::usb::event_thread::EventThread;
use crate::usb::filter::{DEFAULT_AUTO_CONNECT_FILTER, FilterParseError, FilterRule, FilterRules};
use crate::usb::registry::{AddOutcome, Arrival, DeviceRegistry, RegisteredDevice};
use common::usb_types::{DeviceInfo, DeviceKey};
use common::{UsbBridge, UsbEvent, UsbWorker, create_usb_bridge};
use protocol::RedirMessage;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime policy of a device manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub redirection_enabled: bool,
    /// Connect hot-plugged devices automatically
    pub auto_connect: bool,
    pub auto_connect_filter: FilterRules,
    /// Devices to redirect as soon as a channel becomes available
    pub redirect_on_connect: Option<FilterRules>,
    /// Outbound payloads larger than this may be compressed
    pub compression_threshold: usize,
    /// Helper to ask for device access before opening
    pub acl_helper: Option<AclHelper>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        let auto_connect_filter = DEFAULT_AUTO_CONNECT_FILTER
            .parse()
            .unwrap_or_else(|_| FilterRules::new(vec![FilterRule::any(true)]));
        Self {
            redirection_enabled: true,
            auto_connect: true,
            auto_connect_filter,
            redirect_on_connect: None,
            compression_threshold: 1000,
            acl_helper: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Counts in-flight connects for `is_redirecting`, even if the connect
/// future is dropped
struct RedirectingGuard<'a>(&'a AtomicUsize);

impl<'a> RedirectingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RedirectingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Event-thread listener taken for one connect
///
/// Handed back on drop unless the device ended up connected.
struct ListenerGuard<'a> {
    events: &'a EventThread,
    armed: bool,
}

impl<'a> ListenerGuard<'a> {
    fn start(events: &'a EventThread) -> Result<Self> {
        events
            .start_listening()
            .map_err(|e| UsbRedirError::EventThread(e.to_string()))?;
        Ok(Self {
            events,
            armed: true,
        })
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.events.stop_listening();
        }
    }
}

/// Driver installed for a connect, uninstalled again on drop unless kept
struct DriverGuard<'a> {
    manager: &'a DeviceManager,
    info: Option<DeviceInfo>,
}

impl DriverGuard<'_> {
    fn keep(mut self) {
        self.info = None;
    }
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        if let Some(info) = self.info.take() {
            self.manager.spawn_driver_uninstall(info);
        }
    }
}

struct Inner {
    backend: Arc<dyn UsbBackend>,
    registry: Mutex<DeviceRegistry>,
    channels: Mutex<Vec<Arc<RedirChannel>>>,
    settings: Mutex<ManagerSettings>,
    observers: Mutex<Vec<Arc<dyn DeviceManagerObserver>>>,
    events: EventThread,
    bridge: UsbBridge,
    worker: UsbWorker,
    hotplug: Mutex<Option<Box<dyn HotplugRegistration>>>,
    next_channel_id: AtomicU32,
    redirecting: AtomicUsize,
    initialized: AtomicBool,
    shutdown: CancellationToken,
}

/// Shared handle to a device manager
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn UsbBackend>, settings: ManagerSettings) -> Self {
        let (bridge, worker) = create_usb_bridge();
        let mode = backend.addressing_mode();

        Self {
            inner: Arc::new(Inner {
                events: EventThread::new(Arc::clone(&backend)),
                backend,
                registry: Mutex::new(DeviceRegistry::new(mode)),
                channels: Mutex::new(Vec::new()),
                settings: Mutex::new(settings),
                observers: Mutex::new(Vec::new()),
                bridge,
                worker,
                hotplug: Mutex::new(None),
                next_channel_id: AtomicU32::new(1),
                redirecting: AtomicUsize::new(0),
                initialized: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enumerate present devices and subscribe to hotplug events
    ///
    /// Devices found here are announced but never auto-connected. Calling
    /// it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let backend = Arc::clone(&self.inner.backend);
        let present = tokio::task::spawn_blocking(move || backend.enumerate())
            .await
            .map_err(|e| UsbRedirError::Task(e.to_string()))??;

        info!("Found {} USB devices", present.len());
        for device in present {
            self.device_arrived(device, Arrival::Coldplug);
        }

        match self.inner.backend.subscribe_hotplug(self.inner.worker.clone())? {
            Some(registration) => {
                // Hotplug callbacks only fire from inside handle_events
                self.inner
                    .events
                    .start_listening()
                    .map_err(|e| UsbRedirError::EventThread(e.to_string()))?;
                *lock(&self.inner.hotplug) = Some(registration);
                debug!("Hot-plug monitoring enabled");
            }
            None => warn!("Hot-plug not available, device list will not update"),
        }

        Ok(())
    }

    /// Process bridge events until [`shutdown`](Self::shutdown)
    pub async fn run(&self) {
        info!("Device manager event loop started");
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = self.inner.bridge.recv_event() => event,
            };

            match event {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    error!("USB event bridge failed: {}", e);
                    break;
                }
            }
        }
        info!("Device manager event loop stopped");
    }

    pub fn spawn_event_loop(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    /// Disconnect every device and stop listening for events
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let channels: Vec<_> = lock(&self.inner.channels).clone();
        for channel in channels {
            if channel.disconnect_device().is_some() {
                self.inner.events.stop_listening();
            }
        }

        if lock(&self.inner.hotplug).take().is_some() {
            self.inner.events.stop_listening();
        }
        info!("Device manager shut down");
    }

    pub async fn handle_event(&self, event: UsbEvent) {
        match event {
            UsbEvent::DeviceArrived { device } => self.device_arrived(device, Arrival::Hotplug),
            UsbEvent::DeviceLeft { key } => self.device_left(key).await,
            UsbEvent::DataPending { channel_id } => {
                if let Some(channel) = self.channel(channel_id)
                    && let Err(e) = channel.flush()
                {
                    warn!("Channel {}: failed to send data: {}", channel_id, e);
                }
            }
            UsbEvent::DeviceError {
                channel_id,
                binding,
                kind,
            } => {
                if let Some(failure) = self
                    .channel(channel_id)
                    .and_then(|channel| channel.fail_binding(binding, kind))
                {
                    self.device_failed(&failure);
                }
            }
        }
    }

    fn device_arrived(&self, info: DeviceInfo, arrival: Arrival) {
        let outcome = lock(&self.inner.registry).add(info, arrival);
        let AddOutcome::Added(key) = outcome else {
            return;
        };

        let registered = lock(&self.inner.registry).find(&key).cloned();
        let Some(device) = registered else {
            return;
        };

        info!("USB device added: {}", device.info.description());
        self.notify(|observer| observer.device_added(&device));

        if arrival == Arrival::Hotplug {
            self.auto_connect(device);
        }
    }

    fn auto_connect(&self, device: RegisteredDevice) {
        {
            let settings = lock(&self.inner.settings);
            if !settings.auto_connect {
                return;
            }
            if !settings.auto_connect_filter.matches(&device.info.descriptor()) {
                debug!("{} excluded by auto-connect filter", device.key);
                return;
            }
        }

        if let Err(denial) = self.can_redirect_device(&device.key) {
            debug!("Not auto-connecting {}: {}", device.key, denial);
            return;
        }

        info!("Auto-connecting {}", device.info.description());
        self.spawn_policy_connect(device);
    }

    /// Connect in the background, reporting failure as auto-connect-failed
    fn spawn_policy_connect(&self, device: RegisteredDevice) {
        let manager = self.clone();
        tokio::spawn(async move {
            let cancel = manager.inner.shutdown.child_token();
            if let Err(e) = manager.connect_device(&device.key, &cancel).await {
                warn!("Automatic connect of {} failed: {}", device.key, e);
                manager.notify(|observer| observer.auto_connect_failed(&device, &e));
            }
        });
    }

    async fn device_left(&self, key: DeviceKey) {
        if lock(&self.inner.registry).find(&key).is_none() {
            info!("Removed device {} not found in registry", key);
            return;
        }

        if let Err(e) = self.disconnect_device_async(&key).await {
            warn!("Error disconnecting removed device {}: {}", key, e);
        }

        let removed = lock(&self.inner.registry).remove(&key);
        if let Some(device) = removed {
            info!("USB device removed: {}", device.info.description());
            self.notify(|observer| observer.device_removed(&device));
        }
    }

    fn device_failed(&self, failure: &DeviceFailure) {
        if failure.released {
            self.inner.events.stop_listening();
            if let Some(device) = &failure.device {
                self.spawn_driver_uninstall(device.info.clone());
            }
        }

        if let Some(device) = &failure.device {
            let error = failure.to_error();
            warn!("{}", error);
            self.notify(|observer| observer.device_error(device, &error));
        }
    }

    fn notify(&self, f: impl Fn(&dyn DeviceManagerObserver)) {
        let observers: Vec<_> = lock(&self.inner.observers).clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn DeviceManagerObserver>) {
        lock(&self.inner.observers).push(observer);
    }

    fn channel(&self, id: u32) -> Option<Arc<RedirChannel>> {
        lock(&self.inner.channels)
            .iter()
            .find(|channel| channel.id() == id)
            .cloned()
    }

    fn channel_for(&self, key: &DeviceKey) -> Option<Arc<RedirChannel>> {
        lock(&self.inner.channels)
            .iter()
            .find(|channel| channel.device_key().as_ref() == Some(key))
            .cloned()
    }

    /// Register a new virtual USB port, returning its id
    ///
    /// Without a host factory the channel exists but cannot connect devices.
    /// A new channel triggers the redirect-on-connect policy.
    pub fn add_channel(
        &self,
        transport: Arc<dyn WireTransport>,
        factory: Option<Arc<dyn HostFactory>>,
    ) -> Result<u32> {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let threshold = lock(&self.inner.settings).compression_threshold;
        let channel = Arc::new(RedirChannel::new(
            id,
            transport,
            self.inner.worker.clone(),
            threshold,
        ));
        if let Some(factory) = factory {
            channel.set_context(factory)?;
        }

        lock(&self.inner.channels).push(channel);
        info!("USB channel {} added", id);

        self.check_redirect_on_connect();
        Ok(id)
    }

    /// Drop a channel whose wire connection went away
    pub fn remove_channel(&self, id: u32) -> Option<RegisteredDevice> {
        let channel = {
            let mut channels = lock(&self.inner.channels);
            let index = channels.iter().position(|channel| channel.id() == id)?;
            channels.remove(index)
        };

        info!("USB channel {} removed", id);
        let released = channel.disconnect_device();
        if let Some(device) = &released {
            self.inner.events.stop_listening();
            self.spawn_driver_uninstall(device.info.clone());
        }
        released
    }

    /// Reset a channel after a protocol reset or migration
    pub async fn reset_channel(&self, id: u32, migrating: bool) -> Result<()> {
        let channel = self.channel(id).ok_or(UsbRedirError::UnknownChannel(id))?;
        if let Some(device) = channel.reset(migrating) {
            self.inner.events.stop_listening();
            self.uninstall_driver(device.info).await?;
        }
        Ok(())
    }

    /// Route a message received on channel `id`
    ///
    /// A device error force-disconnects the device, notifies observers and
    /// is returned.
    pub fn handle_channel_message(&self, id: u32, message: RedirMessage) -> Result<()> {
        let channel = self.channel(id).ok_or(UsbRedirError::UnknownChannel(id))?;
        channel.handle_message(message).map_err(|failure| {
            self.device_failed(&failure);
            failure.to_error()
        })
    }

    /// Feed frames read off the wire of channel `id` into
    /// [`handle_channel_message`](Self::handle_channel_message)
    ///
    /// Returns once the peer closes the stream or the manager shuts down. A
    /// device error caused by a message is reported to observers and the
    /// pump carries on; a frame that cannot be decoded ends it with an error.
    pub async fn pump_channel<R>(&self, id: u32, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                received = receive_message(&mut reader) => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("Channel {}: peer closed the wire", id);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Channel {}: {}", id, e);
                    return Err(e.into());
                }
            };

            match self.handle_channel_message(id, message) {
                Ok(()) => {}
                Err(e @ UsbRedirError::UnknownChannel(_)) => return Err(e),
                Err(e) => debug!("Channel {}: {}", id, e),
            }
        }
    }

    fn check_redirect_on_connect(&self) {
        let Some(filter) = lock(&self.inner.settings).redirect_on_connect.clone() else {
            return;
        };

        let connected: Vec<DeviceKey> = lock(&self.inner.channels)
            .iter()
            .filter_map(|channel| channel.device_key())
            .collect();

        let candidate = lock(&self.inner.registry)
            .iter()
            .filter(|device| !connected.contains(&device.key))
            .find(|device| filter.matches(&device.info.descriptor()))
            .cloned();

        let Some(device) = candidate else {
            debug!("No device matches the redirect-on-connect filter");
            return;
        };

        if let Err(denial) = self.can_redirect_device(&device.key) {
            debug!("Not redirecting {} on connect: {}", device.key, denial);
            return;
        }

        info!("Redirecting {} on connect", device.info.description());
        self.spawn_policy_connect(device);
    }

    /// Check whether `key` could be redirected now
    pub fn can_redirect_device(&self, key: &DeviceKey) -> std::result::Result<(), RedirectDenial> {
        if !lock(&self.inner.settings).redirection_enabled {
            return Err(RedirectDenial::Disabled);
        }

        let device = lock(&self.inner.registry).find(key).cloned();
        let channels: Vec<_> = lock(&self.inner.channels).clone();

        if channels.is_empty() {
            return Err(RedirectDenial::NoChannels);
        }
        if channels
            .iter()
            .any(|channel| channel.device_key().as_ref() == Some(key))
        {
            return Ok(());
        }

        let Some(device) = device else {
            return Err(RedirectDenial::UnknownDevice);
        };

        if let Some(filter) = channels.iter().find_map(|channel| channel.guest_filter())
            && !filter.check_device(&device.info.descriptor())
        {
            return Err(RedirectDenial::BlockedByGuestFilter);
        }

        if !channels.iter().any(|channel| channel.is_free()) {
            return Err(RedirectDenial::NoFreeChannel);
        }
        Ok(())
    }

    /// Redirect a device through the first free channel
    ///
    /// Dropping the returned future before it completes leaves the device
    /// unbound, as if the connect had failed.
    pub async fn connect_device(&self, key: &DeviceKey, cancel: &CancellationToken) -> Result<()> {
        let registered = lock(&self.inner.registry).find(key).cloned();
        let device = registered.ok_or(UsbRedirError::DeviceNotFound(*key))?;

        let _redirecting = RedirectingGuard::new(&self.inner.redirecting);
        self.install_driver(&device.info).await?;
        let driver = DriverGuard {
            manager: self,
            info: Some(device.info.clone()),
        };

        let result = self.connect_registered(device.clone(), cancel).await;
        match &result {
            Ok(()) => driver.keep(),
            Err(e) => {
                if e.is_cancelled() {
                    info!("Connect of {} cancelled", device.key);
                } else {
                    warn!("Failed to connect {}: {}", device.key, e);
                }
                // The driver belongs to the connection that already exists
                if matches!(e, UsbRedirError::AlreadyConnected(_)) {
                    driver.keep();
                }
            }
        }
        result
    }

    async fn connect_registered(
        &self,
        device: RegisteredDevice,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let listener = ListenerGuard::start(&self.inner.events)?;

        let channel = self.bind_free_channel(&device)?;
        let acl = lock(&self.inner.settings).acl_helper.clone();
        channel
            .connect_bound(Arc::clone(&self.inner.backend), acl.as_ref(), cancel)
            .await?;

        listener.keep();
        Ok(())
    }

    /// Pick a free channel and bind `device` to it
    fn bind_free_channel(&self, device: &RegisteredDevice) -> Result<Arc<RedirChannel>> {
        let channels = lock(&self.inner.channels);
        if channels
            .iter()
            .any(|channel| channel.device_key() == Some(device.key))
        {
            return Err(UsbRedirError::AlreadyConnected(device.key));
        }

        let channel = channels
            .iter()
            .find(|channel| channel.is_free())
            .cloned()
            .ok_or(UsbRedirError::NoFreeChannel)?;
        channel.bind_device(device.clone())?;
        Ok(channel)
    }

    /// Disconnect a device if it is bound to a channel
    ///
    /// Driver cleanup, where the backend needs it, continues in the
    /// background.
    pub fn disconnect_device(&self, key: &DeviceKey) -> Option<RegisteredDevice> {
        let released = self.release_device(key)?;
        self.spawn_driver_uninstall(released.info.clone());
        Some(released)
    }

    /// Disconnect a device and wait for driver cleanup
    pub async fn disconnect_device_async(&self, key: &DeviceKey) -> Result<()> {
        if let Some(released) = self.release_device(key) {
            self.uninstall_driver(released.info).await?;
        }
        Ok(())
    }

    fn release_device(&self, key: &DeviceKey) -> Option<RegisteredDevice> {
        let Some(channel) = self.channel_for(key) else {
            debug!("Device {} is not connected", key);
            return None;
        };

        let released = channel.disconnect_device()?;
        self.inner.events.stop_listening();
        Some(released)
    }

    async fn install_driver(&self, info: &DeviceInfo) -> Result<()> {
        if !self.inner.backend.needs_driver_install() {
            return Ok(());
        }

        let backend = Arc::clone(&self.inner.backend);
        let info = info.clone();
        tokio::task::spawn_blocking(move || backend.install_driver(&info))
            .await
            .map_err(|e| UsbRedirError::Task(e.to_string()))?
            .map_err(|e| UsbRedirError::Driver(e.to_string()))
    }

    async fn uninstall_driver(&self, info: DeviceInfo) -> Result<()> {
        if !self.inner.backend.needs_driver_install() {
            return Ok(());
        }

        let backend = Arc::clone(&self.inner.backend);
        tokio::task::spawn_blocking(move || backend.uninstall_driver(&info))
            .await
            .map_err(|e| UsbRedirError::Task(e.to_string()))?
            .map_err(|e| UsbRedirError::Driver(e.to_string()))
    }

    fn spawn_driver_uninstall(&self, info: DeviceInfo) {
        if !self.inner.backend.needs_driver_install() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to uninstall driver for {}", info.description());
            return;
        };

        let manager = self.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.uninstall_driver(info).await {
                warn!("{}", e);
            }
        });
    }

    /// Devices in registration order
    pub fn devices(&self) -> Vec<RegisteredDevice> {
        lock(&self.inner.registry).iter().cloned().collect()
    }

    pub fn devices_with_filter(&self, filter: &FilterRules) -> Vec<RegisteredDevice> {
        lock(&self.inner.registry)
            .iter()
            .filter(|device| filter.matches(&device.info.descriptor()))
            .cloned()
            .collect()
    }

    pub fn is_device_connected(&self, key: &DeviceKey) -> bool {
        self.channel_for(key).is_some()
    }

    /// Whether a connect is in progress
    pub fn is_redirecting(&self) -> bool {
        self.inner.redirecting.load(Ordering::SeqCst) > 0
    }

    pub fn channel_ids(&self) -> Vec<u32> {
        lock(&self.inner.channels)
            .iter()
            .map(|channel| channel.id())
            .collect()
    }

    pub fn channel_state(&self, id: u32) -> Option<ChannelState> {
        self.channel(id).map(|channel| channel.state())
    }

    pub fn channel_device(&self, id: u32) -> Option<DeviceKey> {
        self.channel(id).and_then(|channel| channel.device_key())
    }

    /// Number of event-thread listeners (connected devices plus hotplug)
    pub fn event_listeners(&self) -> usize {
        self.inner.events.listeners()
    }

    pub fn set_redirection_enabled(&self, enabled: bool) {
        lock(&self.inner.settings).redirection_enabled = enabled;
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        lock(&self.inner.settings).auto_connect = enabled;
    }

    pub fn auto_connect_filter(&self) -> FilterRules {
        lock(&self.inner.settings).auto_connect_filter.clone()
    }

    /// Replace the auto-connect filter; on a parse error the old one stays
    pub fn set_auto_connect_filter(&self, rules: &str) -> std::result::Result<(), FilterParseError> {
        let filter: FilterRules = rules.parse().inspect_err(|e| {
            warn!("Rejected auto-connect filter '{}': {}", rules, e);
        })?;
        debug!("Auto-connect filter set to {}", filter);
        lock(&self.inner.settings).auto_connect_filter = filter;
        Ok(())
    }

    pub fn redirect_on_connect(&self) -> Option<FilterRules> {
        lock(&self.inner.settings).redirect_on_connect.clone()
    }

    /// Replace the redirect-on-connect filter; `None` disables the policy
    pub fn set_redirect_on_connect(
        &self,
        rules: Option<&str>,
    ) -> std::result::Result<(), FilterParseError> {
        let filter = rules.map(str::parse::<FilterRules>).transpose()?;
        lock(&self.inner.settings).redirect_on_connect = filter;
        Ok(())
    }
}
