//! Redirection channel: one virtual USB port
//!
//! A channel binds at most one device at a time and walks it through
//!
//! ```text
//! Disconnected -> [WaitingForAccess ->] Connected -> Disconnected
//!                  WaitingForAccess -> Disconnecting -> Disconnected
//! ```
//!
//! Binding, unbinding, every state transition and the native close of the
//! device all happen under the channel mutex. The mutex is never held
//! across an await: the access request and the native open run unlocked
//! and re-check the state when they complete. A connect that is dropped
//! before reaching `Connected` unbinds its device.

use crate::error::{Result, UsbRedirError};
use crate::redirect::host::{BindingTag, HostFactory, HostNotifier, RedirectionHost};
use crate::redirect::transport::{TransportError, WireTransport};
use crate::usb::acl::{AclError, AclGrant, AclHelper};
use crate::usb::backend::UsbBackend;
use crate::usb::filter::FilterRules;
use crate::usb::registry::RegisteredDevice;
use common::UsbWorker;
use common::usb_types::{DeviceErrorKind, DeviceKey};
use protocol::{CompressedData, CompressionType, RedirMessage, compress_payload, decompress_payload};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    /// Waiting for the access-control helper
    WaitingForAccess,
    Connected,
    /// A pending connect was cancelled and has not resolved yet
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::WaitingForAccess => "waiting-for-access",
            ChannelState::Connected => "connected",
            ChannelState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// A device error detected by a channel
#[derive(Debug, Clone)]
pub struct DeviceFailure {
    /// Device bound when the error happened
    pub device: Option<RegisteredDevice>,
    /// Whether the device was connected and has now been closed and unbound
    pub released: bool,
    pub kind: DeviceErrorKind,
}

impl DeviceFailure {
    pub fn to_error(&self) -> UsbRedirError {
        let description = self
            .device
            .as_ref()
            .map(|d| d.info.description())
            .unwrap_or_else(|| "USB device".to_string());
        UsbRedirError::Device {
            kind: self.kind,
            description,
        }
    }
}

struct ChannelInner {
    state: ChannelState,
    device: Option<RegisteredDevice>,
    host: Option<Box<dyn RedirectionHost>>,
    factory: Option<Arc<dyn HostFactory>>,
    grant: Option<AclGrant>,
    access_cancel: Option<CancellationToken>,
    binding: BindingTag,
}

impl ChannelInner {
    fn is_free(&self) -> bool {
        self.state == ChannelState::Disconnected && self.device.is_none()
    }

    /// Close the device, drop its access grant and unbind it
    fn release(&mut self) -> Option<RegisteredDevice> {
        if let Some(handle) = self.host.as_mut().and_then(|host| host.detach()) {
            handle.close();
        }
        self.grant = None;
        self.access_cancel = None;
        self.state = ChannelState::Disconnected;
        self.binding.advance();
        self.device.take()
    }

    /// Turn a pending access request into a cancellation
    fn cancel_access(&mut self) {
        self.state = ChannelState::Disconnecting;
        if let Some(token) = &self.access_cancel {
            token.cancel();
        }
    }
}

pub struct RedirChannel {
    id: u32,
    inner: Mutex<ChannelInner>,
    transport: Arc<dyn WireTransport>,
    sink: UsbWorker,
    compression_threshold: usize,
}

impl RedirChannel {
    /// Create a channel for an established wire connection
    ///
    /// Host notifications are delivered through `sink`. The channel cannot
    /// connect devices until [`set_context`](Self::set_context) is called.
    pub fn new(
        id: u32,
        transport: Arc<dyn WireTransport>,
        sink: UsbWorker,
        compression_threshold: usize,
    ) -> Self {
        Self {
            id,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Disconnected,
                device: None,
                host: None,
                factory: None,
                grant: None,
                access_cancel: None,
                binding: BindingTag::default(),
            }),
            transport,
            sink,
            compression_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn device(&self) -> Option<RegisteredDevice> {
        self.lock().device.clone()
    }

    pub fn device_key(&self) -> Option<DeviceKey> {
        self.lock().device.as_ref().map(|d| d.key)
    }

    /// Disconnected with no device bound
    pub fn is_free(&self) -> bool {
        self.lock().is_free()
    }

    /// Tag of the current device binding
    pub fn binding(&self) -> u64 {
        self.lock().binding.current()
    }

    pub fn has_context(&self) -> bool {
        self.lock().host.is_some()
    }

    pub fn transport(&self) -> &Arc<dyn WireTransport> {
        &self.transport
    }

    /// Filter published by the remote side of this channel
    pub fn guest_filter(&self) -> Option<FilterRules> {
        self.lock().host.as_ref().and_then(|host| host.guest_filter())
    }

    /// Install the host factory and create this channel's host session
    pub fn set_context(&self, factory: Arc<dyn HostFactory>) -> Result<()> {
        let binding = self.lock().binding.clone();
        let host = factory.create(self.id, HostNotifier::new(self.id, binding, self.sink.clone()))?;

        let mut inner = self.lock();
        if !inner.is_free() {
            return Err(UsbRedirError::ChannelBusy);
        }
        inner.host = Some(host);
        inner.factory = Some(factory);
        debug!("Channel {}: redirection context set", self.id);
        Ok(())
    }

    /// Reserve the channel for `device`
    ///
    /// Fails without side effects when the channel has no context or is not
    /// free.
    pub fn bind_device(&self, device: RegisteredDevice) -> Result<()> {
        let mut inner = self.lock();
        if inner.host.is_none() {
            return Err(UsbRedirError::ContextNotSet);
        }
        if !inner.is_free() {
            return Err(UsbRedirError::ChannelBusy);
        }

        debug!("Channel {}: bound {}", self.id, device.key);
        inner.device = Some(device);
        inner.binding.advance();
        Ok(())
    }

    /// Connect `device` to this channel
    ///
    /// With an access-control helper the channel first waits for a grant;
    /// cancelling `cancel` (or calling [`disconnect_device`]) during that
    /// wait resolves the call with [`UsbRedirError::Cancelled`]. Once the
    /// native open is under way cancellation no longer applies. Dropping
    /// the returned future before it completes unbinds the device.
    ///
    /// [`disconnect_device`]: Self::disconnect_device
    pub async fn connect_device(
        &self,
        device: RegisteredDevice,
        backend: Arc<dyn UsbBackend>,
        acl: Option<&AclHelper>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.bind_device(device)?;
        self.connect_bound(backend, acl, cancel).await
    }

    /// Finish connecting the device reserved by [`bind_device`](Self::bind_device)
    pub async fn connect_bound(
        &self,
        backend: Arc<dyn UsbBackend>,
        acl: Option<&AclHelper>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (bound, binding) = {
            let inner = self.lock();
            (inner.device.clone(), inner.binding.current())
        };
        let Some(device) = bound else {
            return Err(UsbRedirError::Cancelled);
        };
        let _pending = PendingConnect {
            channel: self,
            binding,
        };

        let grant = match acl {
            Some(helper) => Some(self.acquire_access(helper, &device, cancel).await?),
            None => None,
        };

        let key = device.key;
        let opened = tokio::task::spawn_blocking(move || backend.open(&key)).await;

        let mut inner = self.lock();
        let handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!("Channel {}: failed to open {}: {}", self.id, key, e);
                inner.release();
                return Err(UsbRedirError::Open(e));
            }
            Err(e) => {
                error!("Channel {}: open task failed: {}", self.id, e);
                inner.release();
                return Err(UsbRedirError::Task(e.to_string()));
            }
        };

        if inner.state == ChannelState::Disconnecting {
            info!("Channel {}: connect of {} cancelled during open", self.id, key);
            handle.close();
            inner.release();
            return Err(UsbRedirError::Cancelled);
        }

        let Some(host) = inner.host.as_mut() else {
            handle.close();
            inner.release();
            return Err(UsbRedirError::ContextNotSet);
        };
        if let Err(e) = host.attach(handle) {
            warn!("Channel {}: host refused {}: {}", self.id, key, e);
            inner.release();
            return Err(e.into());
        }

        inner.grant = grant;
        inner.access_cancel = None;
        inner.state = ChannelState::Connected;
        info!(
            "Channel {}: {} connected ({})",
            self.id,
            key,
            device.info.description()
        );
        Ok(())
    }

    async fn acquire_access(
        &self,
        helper: &AclHelper,
        device: &RegisteredDevice,
        cancel: &CancellationToken,
    ) -> Result<AclGrant> {
        let token = cancel.child_token();
        {
            let mut inner = self.lock();
            inner.state = ChannelState::WaitingForAccess;
            inner.access_cancel = Some(token.clone());
        }
        debug!("Channel {}: waiting for access to {}", self.id, device.key);

        let result = helper
            .acquire(device.info.bus_number, device.info.device_address, &token)
            .await;

        let mut inner = self.lock();
        if inner.state == ChannelState::Disconnecting {
            // Resolves as cancelled even if the grant came through
            info!("Channel {}: access request for {} cancelled", self.id, device.key);
            inner.release();
            return Err(UsbRedirError::Cancelled);
        }

        match result {
            Ok(grant) => {
                inner.access_cancel = None;
                Ok(grant)
            }
            Err(AclError::Cancelled) => {
                inner.state = ChannelState::Disconnecting;
                info!("Channel {}: access request for {} cancelled", self.id, device.key);
                inner.release();
                Err(UsbRedirError::Cancelled)
            }
            Err(e) => {
                warn!("Channel {}: access to {} failed: {}", self.id, device.key, e);
                inner.release();
                Err(e.into())
            }
        }
    }

    /// Disconnect the bound device
    ///
    /// Connected devices are closed and unbound right away and returned.
    /// A pending access request is cancelled instead; its connect call
    /// releases the device when it resolves. No-op otherwise.
    pub fn disconnect_device(&self) -> Option<RegisteredDevice> {
        let mut inner = self.lock();
        match inner.state {
            ChannelState::Disconnected | ChannelState::Disconnecting => None,
            ChannelState::WaitingForAccess => {
                info!("Channel {}: cancelling pending connect", self.id);
                inner.cancel_access();
                None
            }
            ChannelState::Connected => {
                let device = inner.release();
                if let Some(device) = &device {
                    info!("Channel {}: {} disconnected", self.id, device.key);
                }
                device
            }
        }
    }

    /// Return to idle after a protocol reset or migration
    ///
    /// Disconnects the device if any, then replaces the host session.
    pub fn reset(&self, migrating: bool) -> Option<RegisteredDevice> {
        let released = self.disconnect_device();

        let mut inner = self.lock();
        if let Some(factory) = inner.factory.clone() {
            let notifier = HostNotifier::new(self.id, inner.binding.clone(), self.sink.clone());
            match factory.create(self.id, notifier) {
                Ok(host) => inner.host = Some(host),
                Err(e) => {
                    error!("Channel {}: failed to recreate host: {}", self.id, e);
                    inner.host = None;
                }
            }
        }

        info!(
            "Channel {}: reset{}",
            self.id,
            if migrating { " for migration" } else { "" }
        );
        released
    }

    /// Force-disconnect the bound device after a device error
    pub fn fail_device(&self, kind: DeviceErrorKind) -> DeviceFailure {
        let mut inner = self.lock();
        let device = inner.device.clone();
        let released = match inner.state {
            ChannelState::Connected => {
                inner.release();
                true
            }
            ChannelState::WaitingForAccess => {
                inner.cancel_access();
                false
            }
            ChannelState::Disconnected | ChannelState::Disconnecting => false,
        };

        if let Some(device) = &device {
            warn!("Channel {}: {} failed: {}", self.id, device.key, kind);
        }
        DeviceFailure {
            device,
            released,
            kind,
        }
    }

    /// Force-disconnect after an error the host reported asynchronously
    ///
    /// Only applies while the binding the error was raised under is still
    /// current and connected; otherwise the error is stale and ignored.
    pub fn fail_binding(&self, binding: u64, kind: DeviceErrorKind) -> Option<DeviceFailure> {
        let mut inner = self.lock();
        if inner.binding.current() != binding || inner.state != ChannelState::Connected {
            debug!(
                "Channel {}: ignoring device error ({}) from an earlier binding",
                self.id, kind
            );
            return None;
        }

        let device = inner.release();
        if let Some(device) = &device {
            warn!("Channel {}: {} failed: {}", self.id, device.key, kind);
        }
        Some(DeviceFailure {
            device,
            released: true,
            kind,
        })
    }

    /// Handle one message received from the remote side
    pub fn handle_message(&self, message: RedirMessage) -> std::result::Result<(), DeviceFailure> {
        let data = match message {
            RedirMessage::Capabilities(capabilities) => {
                debug!(
                    "Channel {}: peer capabilities {:?}",
                    self.id, capabilities
                );
                self.transport.set_peer_capabilities(capabilities);
                return Ok(());
            }
            RedirMessage::Data { data } => data,
            RedirMessage::CompressedData(compressed) => match decompress_payload(
                compressed.algorithm,
                &compressed.data,
                compressed.uncompressed_size,
            ) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Channel {}: bad compressed data: {}", self.id, e);
                    return Err(self.fail_device(DeviceErrorKind::ParseError));
                }
            },
        };

        let read = {
            let mut inner = self.lock();
            match inner.host.as_mut() {
                Some(host) => host.read_guest_data(&data),
                None => {
                    warn!("Channel {}: data without redirection context dropped", self.id);
                    return Ok(());
                }
            }
        };

        read.map_err(|e| self.fail_device(e.kind))
    }

    /// Send whatever the host has queued for the remote side
    ///
    /// Returns whether a message was sent.
    pub fn flush(&self) -> std::result::Result<bool, TransportError> {
        let (data, isochronous) = {
            let mut inner = self.lock();
            let isochronous = inner
                .device
                .as_ref()
                .is_some_and(|d| d.info.has_isochronous);
            let Some(data) = inner.host.as_mut().and_then(|host| host.take_guest_data()) else {
                return Ok(false);
            };
            (data, isochronous)
        };

        let compress = self.transport.peer_supports_compression()
            && !self.transport.is_local()
            && !isochronous;
        let message = outbound_message(data, self.compression_threshold, compress);
        self.transport.send(message)?;
        Ok(true)
    }
}

/// Unbinds the device of a connect that ends without reaching `Connected`
///
/// Error paths release the device themselves and advance the binding, which
/// turns this into a no-op; it only acts when the connect future is dropped.
struct PendingConnect<'a> {
    channel: &'a RedirChannel,
    binding: u64,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut inner = self.channel.lock();
        if inner.binding.current() != self.binding || inner.state == ChannelState::Connected {
            return;
        }
        if let Some(token) = &inner.access_cancel {
            token.cancel();
        }
        if let Some(device) = inner.release() {
            info!("Channel {}: connect of {} abandoned", self.channel.id, device.key);
        }
    }
}

/// Wrap guest-bound data, compressing it when allowed and worthwhile
pub(crate) fn outbound_message(data: Vec<u8>, threshold: usize, compress: bool) -> RedirMessage {
    if compress
        && data.len() > threshold
        && let Ok(uncompressed_size) = u32::try_from(data.len())
    {
        let compressed = compress_payload(CompressionType::Lz4, &data);
        if compressed.len() < data.len() {
            trace!("Compressed {} bytes to {}", data.len(), compressed.len());
            return RedirMessage::CompressedData(CompressedData {
                algorithm: CompressionType::Lz4,
                uncompressed_size,
                data: compressed,
            });
        }
    }

    RedirMessage::Data { data }
}
