//! Remote session owning the USB device manager

use crate::error::Result;
use crate::manager::{DeviceManager, ManagerSettings};
use crate::usb::backend::UsbBackend;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// One remote-display session
///
/// The device manager is created on first use and lives as long as the
/// session.
pub struct Session {
    backend: Arc<dyn UsbBackend>,
    settings: ManagerSettings,
    manager: OnceCell<DeviceManager>,
}

impl Session {
    pub fn new(backend: Arc<dyn UsbBackend>, settings: ManagerSettings) -> Self {
        Self {
            backend,
            settings,
            manager: OnceCell::new(),
        }
    }

    /// The session's device manager, created and initialized on first call
    pub async fn usb_device_manager(&self) -> Result<&DeviceManager> {
        self.manager
            .get_or_try_init(|| async {
                debug!("Creating USB device manager");
                let manager = DeviceManager::new(Arc::clone(&self.backend), self.settings.clone());
                manager.spawn_event_loop();
                if let Err(e) = manager.initialize().await {
                    manager.shutdown();
                    return Err(e);
                }
                Ok(manager)
            })
            .await
    }

    /// The device manager if it has been created
    pub fn existing_device_manager(&self) -> Option<&DeviceManager> {
        self.manager.get()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.get() {
            manager.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use common::test_utils::create_mock_device_list;

    #[tokio::test]
    async fn test_manager_created_once() {
        let backend = Arc::new(MockBackend::with_devices(create_mock_device_list(2)));
        let session = Session::new(backend.clone(), ManagerSettings::default());
        assert!(session.existing_device_manager().is_none());

        let first = session.usb_device_manager().await.unwrap().clone();
        let second = session.usb_device_manager().await.unwrap();
        assert_eq!(first.devices().len(), 2);
        assert_eq!(second.devices().len(), 2);
        assert!(backend.has_hotplug_subscriber());

        // Same instance: a channel added through one handle shows in the other
        first.add_channel(Arc::new(crate::testing::RecordingTransport::default()), None)
            .unwrap();
        assert_eq!(second.channel_ids().len(), 1);
    }
}
