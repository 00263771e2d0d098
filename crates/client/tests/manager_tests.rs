//! Device Manager Tests
//!
//! End-to-end flows through the manager's event loop with the mock backend:
//! hotplug with auto-connect, channel exhaustion, device errors, removal,
//! and the redirect-on-connect policy.
//!
//! Run with: `cargo test -p client --test manager_tests`

use client::testing::{
    DriverCall, MockBackend, MockHostFactory, RecordingObserver, RecordingTransport, wait_until,
};
use client::usb::{BackendError, FilterRules};
use client::{
    ChannelState, DeviceManager, HostFactory, ManagerEvent, ManagerSettings, RedirectDenial,
    UsbRedirError,
};
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_mock_device_info, create_mock_hid_device, create_mock_hub_device,
    create_mock_mass_storage_device,
};
use common::usb_types::{AddressingMode, DeviceErrorKind, DeviceInfo, DeviceKey};
use protocol::{
    CURRENT_VERSION, ChannelCapabilities, CompressedData, CompressionType, Message,
    ProtocolVersion, RedirMessage, compress_payload, encode_framed,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Time given to the event loop to (not) act on something
const SETTLE: Duration = Duration::from_millis(100);

struct Harness {
    manager: DeviceManager,
    backend: Arc<MockBackend>,
    factory: Arc<MockHostFactory>,
    observer: Arc<RecordingObserver>,
}

impl Harness {
    async fn start(backend: MockBackend, settings: ManagerSettings) -> Self {
        Self::start_with_factory(backend, settings, MockHostFactory::new()).await
    }

    async fn start_with_factory(
        backend: MockBackend,
        settings: ManagerSettings,
        factory: MockHostFactory,
    ) -> Self {
        let backend = Arc::new(backend);
        let manager = DeviceManager::new(backend.clone(), settings);
        let observer = Arc::new(RecordingObserver::new());
        manager.subscribe(observer.clone());
        manager.spawn_event_loop();
        manager.initialize().await.unwrap();

        Self {
            manager,
            backend,
            factory: Arc::new(factory),
            observer,
        }
    }

    fn add_channel(&self) -> u32 {
        self.add_channel_with(Arc::new(RecordingTransport::default()))
    }

    fn add_channel_with(&self, transport: Arc<RecordingTransport>) -> u32 {
        let factory: Arc<dyn HostFactory> = self.factory.clone();
        self.manager.add_channel(transport, Some(factory)).unwrap()
    }

    async fn connect(&self, info: &DeviceInfo) -> client::Result<()> {
        self.manager
            .connect_device(&key(info), &CancellationToken::new())
            .await
    }

    fn connected(&self, info: &DeviceInfo) -> bool {
        self.manager.is_device_connected(&key(info))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

fn key(info: &DeviceInfo) -> DeviceKey {
    info.key(AddressingMode::BusAddress)
}

fn filter(rules: &str) -> FilterRules {
    rules.parse().unwrap()
}

mod hotplug_tests {
    use super::*;

    #[tokio::test]
    async fn test_hid_device_not_auto_connected() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        let hid = create_mock_hid_device(1, 2);

        h.backend.plug(hid.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.observer.added().contains(&key(&hid))).await);
        tokio::time::sleep(SETTLE).await;
        assert!(!h.connected(&hid));
        assert_eq!(h.backend.open_count(), 0);
        assert!(h.observer.auto_connect_failures().is_empty());
    }

    #[tokio::test]
    async fn test_mass_storage_auto_connected() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        let channel = h.add_channel();
        let storage = create_mock_mass_storage_device(1, 3);

        h.backend.plug(storage.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.connected(&storage)).await);
        assert_eq!(h.manager.channel_state(channel), Some(ChannelState::Connected));
        assert_eq!(h.manager.channel_device(channel), Some(key(&storage)));
        assert_eq!(
            h.factory.host(channel).unwrap().attached(),
            Some(key(&storage))
        );
    }

    #[tokio::test]
    async fn test_coldplug_devices_not_auto_connected() {
        let storage = create_mock_mass_storage_device(1, 2);
        let backend = MockBackend::with_devices(vec![storage.clone(), create_mock_hub_device(1, 1)]);
        let h = Harness::start(backend, ManagerSettings::default()).await;
        h.add_channel();

        tokio::time::sleep(SETTLE).await;

        assert_eq!(h.observer.added(), vec![key(&storage)]);
        assert_eq!(h.manager.devices().len(), 1);
        assert!(!h.connected(&storage));
    }

    #[tokio::test]
    async fn test_auto_connect_disabled() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        h.manager.set_auto_connect(false);
        let storage = create_mock_mass_storage_device(1, 3);

        h.backend.plug(storage.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !h.manager.devices().is_empty()).await);
        tokio::time::sleep(SETTLE).await;
        assert!(!h.connected(&storage));
    }

    #[tokio::test]
    async fn test_auto_connect_failure_reported() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        let storage = create_mock_mass_storage_device(1, 3);
        h.backend.fail_open(key(&storage), BackendError::Busy);

        h.backend.plug(storage.clone());

        assert!(
            wait_until(DEFAULT_TEST_TIMEOUT, || {
                h.observer.auto_connect_failures().contains(&key(&storage))
            })
            .await
        );
        let failure = h
            .observer
            .events()
            .into_iter()
            .find(|event| matches!(event, ManagerEvent::AutoConnectFailed { .. }));
        assert!(matches!(
            failure,
            Some(ManagerEvent::AutoConnectFailed {
                cancelled: false,
                ..
            })
        ));
        assert!(!h.connected(&storage));
        assert_eq!(h.manager.event_listeners(), 1);
    }

    #[tokio::test]
    async fn test_unplug_disconnects_and_removes() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        let storage = create_mock_mass_storage_device(1, 3);
        h.backend.plug(storage.clone());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.connected(&storage)).await);

        h.backend.unplug(key(&storage));

        assert!(
            wait_until(DEFAULT_TEST_TIMEOUT, || h.observer.removed().contains(&key(&storage))).await
        );
        assert!(!h.connected(&storage));
        assert!(h.manager.devices().is_empty());
        assert!(h.backend.open_devices().is_empty());
        assert_eq!(h.manager.event_listeners(), 1);
    }

    #[tokio::test]
    async fn test_unknown_removal_ignored() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();

        h.backend.unplug(DeviceKey::BusAddress { bus: 9, address: 9 });

        tokio::time::sleep(SETTLE).await;
        assert!(h.observer.removed().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_arrival_registered_once() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        let hid = create_mock_hid_device(1, 2);

        h.backend.plug(hid.clone());
        h.backend.plug(hid.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !h.manager.devices().is_empty()).await);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(h.manager.devices().len(), 1);
        assert_eq!(h.observer.added().len(), 1);
    }
}

mod connect_tests {
    use super::*;

    fn three_storage_devices() -> Vec<DeviceInfo> {
        vec![
            create_mock_mass_storage_device(1, 2),
            create_mock_mass_storage_device(1, 3),
            create_mock_mass_storage_device(1, 4),
        ]
    }

    #[tokio::test]
    async fn test_third_device_gets_no_free_channel() {
        let devices = three_storage_devices();
        let h = Harness::start(
            MockBackend::with_devices(devices.clone()),
            ManagerSettings::default(),
        )
        .await;
        let first = h.add_channel();
        let second = h.add_channel();

        h.connect(&devices[0]).await.unwrap();
        h.connect(&devices[1]).await.unwrap();
        let result = h.connect(&devices[2]).await;

        assert!(matches!(result, Err(UsbRedirError::NoFreeChannel)));
        assert_eq!(h.manager.channel_device(first), Some(key(&devices[0])));
        assert_eq!(h.manager.channel_device(second), Some(key(&devices[1])));
        assert_eq!(
            h.manager.can_redirect_device(&key(&devices[2])),
            Err(RedirectDenial::NoFreeChannel)
        );
        assert_eq!(h.manager.can_redirect_device(&key(&devices[0])), Ok(()));
    }

    #[tokio::test]
    async fn test_connected_device_rejected_again() {
        let devices = three_storage_devices();
        let h = Harness::start(
            MockBackend::with_devices(devices.clone()),
            ManagerSettings::default(),
        )
        .await;
        h.add_channel();
        h.add_channel();

        h.connect(&devices[0]).await.unwrap();
        let again = h.connect(&devices[0]).await;

        assert!(matches!(again, Err(UsbRedirError::AlreadyConnected(k)) if k == key(&devices[0])));
        assert_eq!(h.backend.open_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connect_leaves_device_reconnectable() {
        let devices = three_storage_devices();
        let backend = MockBackend::with_devices(devices.clone());
        backend.set_needs_driver_install(true);
        let h = Harness::start(backend, ManagerSettings::default()).await;
        let channel = h.add_channel();
        let listeners = h.manager.event_listeners();
        h.backend.set_open_delay(Duration::from_millis(300));

        let result = tokio::time::timeout(Duration::from_millis(100), h.connect(&devices[0])).await;

        assert!(result.is_err());
        assert_eq!(h.manager.channel_device(channel), None);
        assert_eq!(h.manager.channel_state(channel), Some(ChannelState::Disconnected));
        assert!(!h.connected(&devices[0]));
        assert!(!h.manager.is_redirecting());
        assert_eq!(h.manager.event_listeners(), listeners);
        assert!(h.manager.disconnect_device(&key(&devices[0])).is_none());
        assert!(
            wait_until(DEFAULT_TEST_TIMEOUT, || {
                h.backend
                    .driver_calls()
                    .contains(&DriverCall::Uninstall(key(&devices[0])))
            })
            .await
        );

        h.backend.set_open_delay(Duration::ZERO);
        h.connect(&devices[0]).await.unwrap();
        assert_eq!(h.manager.channel_device(channel), Some(key(&devices[0])));
        assert_eq!(h.manager.event_listeners(), listeners + 1);

        assert!(h.manager.disconnect_device(&key(&devices[0])).is_some());
        assert_eq!(h.manager.event_listeners(), listeners);
    }

    #[tokio::test]
    async fn test_concurrent_connects_of_same_device() {
        let devices = three_storage_devices();
        let h = Harness::start(
            MockBackend::with_devices(devices.clone()),
            ManagerSettings::default(),
        )
        .await;
        let first = h.add_channel();
        let second = h.add_channel();
        h.backend.set_open_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(h.connect(&devices[0]), h.connect(&devices[0]));

        assert!(a.is_ok() != b.is_ok());
        assert!(
            matches!(a, Err(UsbRedirError::AlreadyConnected(_)))
                || matches!(b, Err(UsbRedirError::AlreadyConnected(_)))
        );
        let bound: Vec<_> = [first, second]
            .iter()
            .filter_map(|id| h.manager.channel_device(*id))
            .collect();
        assert_eq!(bound, vec![key(&devices[0])]);
    }

    #[tokio::test]
    async fn test_device_bound_to_at_most_one_channel() {
        let devices = three_storage_devices();
        let h = Harness::start(
            MockBackend::with_devices(devices.clone()),
            ManagerSettings::default(),
        )
        .await;
        let channels = [h.add_channel(), h.add_channel()];

        let mut seed: u32 = 17;
        for _ in 0..40 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let device = &devices[(seed >> 16) as usize % devices.len()];
            if (seed >> 8) & 1 == 0 {
                let _ = h.connect(device).await;
            } else {
                h.manager.disconnect_device(&key(device));
            }

            let bound: Vec<_> = channels
                .iter()
                .filter_map(|id| h.manager.channel_device(*id))
                .collect();
            let mut unique = bound.clone();
            unique.dedup();
            assert_eq!(bound.len(), unique.len(), "device bound twice: {:?}", bound);
            assert_eq!(h.manager.event_listeners(), 1 + bound.len());
        }
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        let missing = DeviceKey::BusAddress { bus: 3, address: 3 };

        let result = h
            .manager
            .connect_device(&missing, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(UsbRedirError::DeviceNotFound(k)) if k == missing));
    }

    #[tokio::test]
    async fn test_channel_without_context() {
        let storage = create_mock_mass_storage_device(1, 2);
        let h = Harness::start(
            MockBackend::with_devices(vec![storage.clone()]),
            ManagerSettings::default(),
        )
        .await;
        h.manager
            .add_channel(Arc::new(RecordingTransport::default()), None)
            .unwrap();

        let result = h.connect(&storage).await;

        assert!(matches!(result, Err(UsbRedirError::ContextNotSet)));
        assert!(!h.connected(&storage));
        assert_eq!(h.manager.event_listeners(), 1);
    }

    #[tokio::test]
    async fn test_event_thread_follows_connections() {
        let storage = create_mock_mass_storage_device(1, 2);
        let h = Harness::start(
            MockBackend::with_devices(vec![storage.clone()]),
            ManagerSettings::default(),
        )
        .await;
        h.add_channel();
        assert_eq!(h.manager.event_listeners(), 1);

        h.connect(&storage).await.unwrap();
        assert_eq!(h.manager.event_listeners(), 2);

        let released = h.manager.disconnect_device(&key(&storage));
        assert_eq!(released.map(|d| d.key), Some(key(&storage)));
        assert_eq!(h.manager.event_listeners(), 1);

        assert!(h.manager.disconnect_device(&key(&storage)).is_none());
        assert_eq!(h.manager.event_listeners(), 1);
    }

    #[tokio::test]
    async fn test_is_redirecting_during_connect() {
        let storage = create_mock_mass_storage_device(1, 2);
        let h = Harness::start(
            MockBackend::with_devices(vec![storage.clone()]),
            ManagerSettings::default(),
        )
        .await;
        h.add_channel();
        h.backend.set_open_delay(Duration::from_millis(100));
        assert!(!h.manager.is_redirecting());

        let manager = h.manager.clone();
        let k = key(&storage);
        let pending =
            tokio::spawn(async move { manager.connect_device(&k, &CancellationToken::new()).await });

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.manager.is_redirecting()).await);
        pending.await.unwrap().unwrap();
        assert!(!h.manager.is_redirecting());
    }

    #[tokio::test]
    async fn test_driver_hooks() {
        let storage = create_mock_mass_storage_device(1, 2);
        let backend = MockBackend::with_devices(vec![storage.clone()]);
        backend.set_needs_driver_install(true);
        let h = Harness::start(backend, ManagerSettings::default()).await;
        h.add_channel();

        h.connect(&storage).await.unwrap();
        assert_eq!(h.backend.driver_calls(), vec![DriverCall::Install(key(&storage))]);

        h.manager.disconnect_device_async(&key(&storage)).await.unwrap();
        assert_eq!(
            h.backend.driver_calls(),
            vec![
                DriverCall::Install(key(&storage)),
                DriverCall::Uninstall(key(&storage))
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_connect_uninstalls_driver() {
        let storage = create_mock_mass_storage_device(1, 2);
        let backend = MockBackend::with_devices(vec![storage.clone()]);
        backend.set_needs_driver_install(true);
        backend.fail_open(key(&storage), BackendError::Access);
        let h = Harness::start(backend, ManagerSettings::default()).await;
        h.add_channel();

        let result = h.connect(&storage).await;

        assert!(matches!(result, Err(UsbRedirError::Open(BackendError::Access))));
        assert!(
            wait_until(DEFAULT_TEST_TIMEOUT, || {
                h.backend
                    .driver_calls()
                    .contains(&DriverCall::Uninstall(key(&storage)))
            })
            .await
        );
    }
}

#[cfg(unix)]
mod access_tests {
    use super::*;
    use client::usb::AclHelper;
    use std::io::Write;

    #[tokio::test]
    async fn test_disconnect_cancels_pending_access() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "read req\nread cancel\necho CANCELED").unwrap();
        let settings = ManagerSettings {
            acl_helper: Some(AclHelper::with_args(
                "/bin/sh",
                [script.path().as_os_str().to_owned()],
            )),
            ..ManagerSettings::default()
        };

        let storage = create_mock_mass_storage_device(1, 2);
        let h = Harness::start(MockBackend::with_devices(vec![storage.clone()]), settings).await;
        let channel = h.add_channel();

        let manager = h.manager.clone();
        let k = key(&storage);
        let pending =
            tokio::spawn(async move { manager.connect_device(&k, &CancellationToken::new()).await });

        assert!(
            wait_until(DEFAULT_TEST_TIMEOUT, || {
                h.manager.channel_state(channel) == Some(ChannelState::WaitingForAccess)
            })
            .await
        );
        assert!(h.manager.disconnect_device(&k).is_none());

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(UsbRedirError::Cancelled)));
        assert!(!h.connected(&storage));
        assert_eq!(h.manager.channel_state(channel), Some(ChannelState::Disconnected));
        assert_eq!(h.manager.event_listeners(), 1);
        assert_eq!(h.backend.open_count(), 0);
    }
}

mod can_redirect_tests {
    use super::*;

    #[tokio::test]
    async fn test_denial_reasons() {
        let storage = create_mock_mass_storage_device(1, 2);
        let h = Harness::start(
            MockBackend::with_devices(vec![storage.clone()]),
            ManagerSettings::default(),
        )
        .await;

        assert_eq!(
            h.manager.can_redirect_device(&key(&storage)),
            Err(RedirectDenial::NoChannels)
        );

        h.add_channel();
        assert_eq!(h.manager.can_redirect_device(&key(&storage)), Ok(()));
        assert_eq!(
            h.manager
                .can_redirect_device(&DeviceKey::BusAddress { bus: 8, address: 8 }),
            Err(RedirectDenial::UnknownDevice)
        );

        h.manager.set_redirection_enabled(false);
        assert_eq!(
            h.manager.can_redirect_device(&key(&storage)),
            Err(RedirectDenial::Disabled)
        );
    }

    #[tokio::test]
    async fn test_guest_filter_blocks_device() {
        let storage = create_mock_mass_storage_device(1, 2);
        let hid = create_mock_hid_device(1, 3);
        let h = Harness::start_with_factory(
            MockBackend::with_devices(vec![storage.clone(), hid.clone()]),
            ManagerSettings::default(),
            MockHostFactory::with_guest_filter(filter("0x08,-1,-1,-1,0|-1,-1,-1,-1,1")),
        )
        .await;
        h.add_channel();

        assert_eq!(
            h.manager.can_redirect_device(&key(&storage)),
            Err(RedirectDenial::BlockedByGuestFilter)
        );
        assert_eq!(h.manager.can_redirect_device(&key(&hid)), Ok(()));
    }

    #[tokio::test]
    async fn test_guest_filter_stops_auto_connect() {
        let h = Harness::start_with_factory(
            MockBackend::new(),
            ManagerSettings::default(),
            MockHostFactory::with_guest_filter(filter("0x08,-1,-1,-1,0|-1,-1,-1,-1,1")),
        )
        .await;
        h.add_channel();
        let storage = create_mock_mass_storage_device(1, 2);

        h.backend.plug(storage.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !h.manager.devices().is_empty()).await);
        tokio::time::sleep(SETTLE).await;
        assert!(!h.connected(&storage));
        assert!(h.observer.auto_connect_failures().is_empty());
    }
}

mod channel_tests {
    use super::*;
    use client::WireTransport;

    async fn connected_harness(storage: &DeviceInfo) -> (Harness, u32, Arc<RecordingTransport>) {
        let h = Harness::start(
            MockBackend::with_devices(vec![storage.clone()]),
            ManagerSettings::default(),
        )
        .await;
        let transport = Arc::new(RecordingTransport::default());
        let channel = h.add_channel_with(transport.clone());
        h.connect(storage).await.unwrap();
        (h, channel, transport)
    }

    #[tokio::test]
    async fn test_bad_compressed_data_disconnects_device() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;

        let result = h.manager.handle_channel_message(
            channel,
            RedirMessage::CompressedData(CompressedData {
                algorithm: CompressionType::Lz4,
                uncompressed_size: 0,
                data: vec![0x10, 0x00],
            }),
        );

        let error = result.unwrap_err();
        assert_eq!(error.device_error_kind(), Some(DeviceErrorKind::ParseError));
        assert!(error.to_string().contains("parse error"));
        assert!(!h.connected(&storage));
        assert!(h.backend.open_devices().is_empty());
        assert_eq!(
            h.observer.device_errors(),
            vec![(key(&storage), DeviceErrorKind::ParseError)]
        );
        assert_eq!(h.manager.event_listeners(), 1);
    }

    #[tokio::test]
    async fn test_host_device_error_disconnects_device() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;

        h.factory
            .host(channel)
            .unwrap()
            .report_device_error(DeviceErrorKind::DeviceLost);

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !h.connected(&storage)).await);
        assert!(
            wait_until(DEFAULT_TEST_TIMEOUT, || !h.observer.device_errors().is_empty()).await
        );
        assert_eq!(
            h.observer.device_errors(),
            vec![(key(&storage), DeviceErrorKind::DeviceLost)]
        );
    }

    #[tokio::test]
    async fn test_stale_host_error_spares_next_device() {
        let first = create_mock_mass_storage_device(1, 2);
        let second = create_mock_mass_storage_device(1, 3);
        let h = Harness::start(
            MockBackend::with_devices(vec![first.clone(), second.clone()]),
            ManagerSettings::default(),
        )
        .await;
        let channel = h.add_channel();
        h.connect(&first).await.unwrap();

        h.factory
            .host(channel)
            .unwrap()
            .report_device_error(DeviceErrorKind::DeviceLost);
        assert!(h.manager.disconnect_device(&key(&first)).is_some());
        h.connect(&second).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        assert!(h.connected(&second));
        assert_eq!(h.manager.channel_device(channel), Some(key(&second)));
        assert_eq!(h.backend.open_devices(), vec![key(&second)]);
        assert!(h.observer.device_errors().is_empty());
    }

    #[tokio::test]
    async fn test_pending_data_flushed_by_event_loop() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, transport) = connected_harness(&storage).await;

        h.factory.host(channel).unwrap().queue_guest_data(vec![1, 2, 3]);

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !transport.sent().is_empty()).await);
        assert_eq!(
            transport.sent(),
            vec![RedirMessage::Data {
                data: vec![1, 2, 3]
            }]
        );
    }

    #[tokio::test]
    async fn test_inbound_data_routed_to_host() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;

        h.manager
            .handle_channel_message(channel, RedirMessage::Data { data: vec![5, 6] })
            .unwrap();

        assert_eq!(h.factory.host(channel).unwrap().received(), vec![vec![5, 6]]);
        assert!(matches!(
            h.manager
                .handle_channel_message(99, RedirMessage::Data { data: vec![1] }),
            Err(UsbRedirError::UnknownChannel(99))
        ));
    }

    fn frame(payload: RedirMessage) -> Vec<u8> {
        encode_framed(&Message {
            version: CURRENT_VERSION,
            payload,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pump_feeds_wire_frames_to_channel() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, transport) = connected_harness(&storage).await;
        let (mut peer, wire) = tokio::io::duplex(64 * 1024);
        let manager = h.manager.clone();
        let pump = tokio::spawn(async move { manager.pump_channel(channel, wire).await });

        peer.write_all(&frame(RedirMessage::Capabilities(ChannelCapabilities {
            compression: true,
        })))
        .await
        .unwrap();
        peer.write_all(&frame(RedirMessage::Data {
            data: vec![4, 5, 6],
        }))
        .await
        .unwrap();

        let host = h.factory.host(channel).unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !host.received().is_empty()).await);
        assert_eq!(host.received(), vec![vec![4, 5, 6]]);
        assert!(transport.peer_supports_compression());

        drop(peer);
        assert!(pump.await.unwrap().is_ok());
        assert!(h.connected(&storage));
    }

    #[tokio::test]
    async fn test_pump_survives_device_error() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;
        let (mut peer, wire) = tokio::io::duplex(64 * 1024);
        let manager = h.manager.clone();
        let pump = tokio::spawn(async move { manager.pump_channel(channel, wire).await });

        peer.write_all(&frame(RedirMessage::CompressedData(CompressedData {
            algorithm: CompressionType::Lz4,
            uncompressed_size: u32::MAX,
            data: compress_payload(CompressionType::Lz4, &[0u8; 64]),
        })))
        .await
        .unwrap();

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !h.connected(&storage)).await);
        assert_eq!(
            h.observer.device_errors(),
            vec![(key(&storage), DeviceErrorKind::ParseError)]
        );
        assert!(!pump.is_finished());

        drop(peer);
        assert!(pump.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pump_stops_on_incompatible_peer() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;
        let (mut peer, wire) = tokio::io::duplex(64 * 1024);

        let bytes = encode_framed(&Message {
            version: ProtocolVersion {
                major: CURRENT_VERSION.major + 1,
                minor: 0,
                patch: 0,
            },
            payload: RedirMessage::Data { data: vec![1] },
        })
        .unwrap();
        peer.write_all(&bytes).await.unwrap();

        let result = h.manager.pump_channel(channel, wire).await;

        assert!(matches!(result, Err(UsbRedirError::Transport(_))));
        assert!(h.factory.host(channel).unwrap().received().is_empty());
    }

    #[tokio::test]
    async fn test_remove_channel_releases_device() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;

        let released = h.manager.remove_channel(channel);

        assert_eq!(released.map(|d| d.key), Some(key(&storage)));
        assert!(h.manager.channel_ids().is_empty());
        assert!(!h.connected(&storage));
        assert!(h.backend.open_devices().is_empty());
        assert_eq!(h.manager.event_listeners(), 1);
        assert!(h.manager.remove_channel(channel).is_none());
    }

    #[tokio::test]
    async fn test_reset_channel() {
        let storage = create_mock_mass_storage_device(1, 2);
        let (h, channel, _transport) = connected_harness(&storage).await;

        h.manager.reset_channel(channel, true).await.unwrap();

        assert_eq!(h.manager.channel_state(channel), Some(ChannelState::Disconnected));
        assert!(!h.connected(&storage));
        assert_eq!(h.factory.hosts_created(), 2);
        assert!(matches!(
            h.manager.reset_channel(42, false).await,
            Err(UsbRedirError::UnknownChannel(42))
        ));

        h.connect(&storage).await.unwrap();
        assert!(h.connected(&storage));
    }
}

mod policy_tests {
    use super::*;

    #[tokio::test]
    async fn test_malformed_filter_keeps_previous() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        let before = h.manager.auto_connect_filter();

        assert!(h.manager.set_auto_connect_filter("abc").is_err());
        assert_eq!(h.manager.auto_connect_filter(), before);

        let hid = create_mock_hid_device(1, 2);
        h.backend.plug(hid.clone());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.observer.added().contains(&key(&hid))).await);
        tokio::time::sleep(SETTLE).await;
        assert!(!h.connected(&hid));

        let storage = create_mock_mass_storage_device(1, 3);
        h.backend.plug(storage.clone());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.connected(&storage)).await);
    }

    #[tokio::test]
    async fn test_deny_all_filter() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        h.add_channel();
        h.manager.set_auto_connect_filter("-1,-1,-1,-1,0").unwrap();

        let storage = create_mock_mass_storage_device(1, 3);
        h.backend.plug(storage.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !h.manager.devices().is_empty()).await);
        tokio::time::sleep(SETTLE).await;
        assert!(!h.connected(&storage));
    }

    #[tokio::test]
    async fn test_redirect_on_connect_picks_first_match() {
        let hid = create_mock_hid_device(1, 2);
        let first = create_mock_mass_storage_device(1, 3);
        let second = create_mock_mass_storage_device(1, 4);
        let settings = ManagerSettings {
            redirect_on_connect: Some(filter("0x08,-1,-1,-1,1")),
            ..ManagerSettings::default()
        };
        let h = Harness::start(
            MockBackend::with_devices(vec![hid.clone(), first.clone(), second.clone()]),
            settings,
        )
        .await;

        h.add_channel();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.connected(&first)).await);
        assert!(!h.connected(&second));
        assert!(!h.connected(&hid));

        h.add_channel();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || h.connected(&second)).await);
        assert!(!h.connected(&hid));
    }

    #[tokio::test]
    async fn test_redirect_on_connect_without_match() {
        let hid = create_mock_hid_device(1, 2);
        let settings = ManagerSettings {
            redirect_on_connect: Some(filter("0x08,-1,-1,-1,1")),
            ..ManagerSettings::default()
        };
        let h = Harness::start(MockBackend::with_devices(vec![hid.clone()]), settings).await;

        h.add_channel();

        tokio::time::sleep(SETTLE).await;
        assert!(!h.connected(&hid));
        assert!(h.observer.auto_connect_failures().is_empty());
    }

    #[tokio::test]
    async fn test_set_redirect_on_connect() {
        let h = Harness::start(MockBackend::new(), ManagerSettings::default()).await;
        assert!(h.manager.redirect_on_connect().is_none());

        assert!(h.manager.set_redirect_on_connect(Some("bogus")).is_err());
        assert!(h.manager.redirect_on_connect().is_none());

        h.manager
            .set_redirect_on_connect(Some("0x08,-1,-1,-1,1"))
            .unwrap();
        assert_eq!(
            h.manager.redirect_on_connect(),
            Some(filter("0x08,-1,-1,-1,1"))
        );

        h.manager.set_redirect_on_connect(None).unwrap();
        assert!(h.manager.redirect_on_connect().is_none());
    }

    #[tokio::test]
    async fn test_devices_with_filter() {
        let hid = create_mock_hid_device(1, 2);
        let storage = create_mock_mass_storage_device(1, 3);
        let h = Harness::start(
            MockBackend::with_devices(vec![hid.clone(), storage.clone()]),
            ManagerSettings::default(),
        )
        .await;

        let matching = h.manager.devices_with_filter(&filter("0x03,-1,-1,-1,1"));
        assert_eq!(
            matching.iter().map(|d| d.key).collect::<Vec<_>>(),
            vec![key(&hid)]
        );
    }
}

mod addressing_tests {
    use super::*;

    #[tokio::test]
    async fn test_vendor_product_mode_merges_identical_devices() {
        let backend = MockBackend::with_mode(AddressingMode::VendorProduct);
        backend.add_device(create_mock_device_info(1, 2, 0x1234, 0x5678));
        backend.add_device(create_mock_device_info(1, 3, 0x1234, 0x5678));
        backend.add_device(create_mock_device_info(1, 4, 0x1234, 0x9999));

        let h = Harness::start(backend, ManagerSettings::default()).await;

        let keys: Vec<_> = h.manager.devices().iter().map(|d| d.key).collect();
        assert_eq!(
            keys,
            vec![
                DeviceKey::VendorProduct {
                    vendor_id: 0x1234,
                    product_id: 0x5678
                },
                DeviceKey::VendorProduct {
                    vendor_id: 0x1234,
                    product_id: 0x9999
                },
            ]
        );
    }
}
