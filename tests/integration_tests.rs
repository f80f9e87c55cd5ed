//! Integration tests driving the connection state machine end to end
//! against the scripted transport.

use std::time::Duration;

use blelink::central::{Central, CentralError, DisconnectReason, LinkState, Snapshot};
use blelink::transport::mock::{MockCall, MockHandle, MockTransport};
use blelink::transport::{
    Capabilities, CharacteristicInfo, DiscoveredPeripheral, FailureReason, RadioState,
    ServiceInfo, TransportEvent,
};
use blelink::{
    CentralConfig, Update, CHARACTERISTIC_UUID_A, CHARACTERISTIC_UUID_B, SERVICE_UUID_A,
    SERVICE_UUID_B,
};

const ESP32: &str = "AA:BB:CC:DD:EE:FF";

fn setup() -> (Central, MockHandle) {
    let (transport, handle, events) = MockTransport::new();
    let central = Central::spawn(transport, events, CentralConfig::default());
    (central, handle)
}

fn device(id: &str, name: Option<&str>, rssi: Option<i16>) -> DiscoveredPeripheral {
    DiscoveredPeripheral {
        id: id.to_string(),
        name: name.map(String::from),
        rssi,
    }
}

fn notify_write_char(uuid: uuid::Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        capabilities: Capabilities {
            read: true,
            write: true,
            notify: true,
        },
    }
}

fn write_only_char(uuid: uuid::Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        capabilities: Capabilities {
            read: false,
            write: true,
            notify: false,
        },
    }
}

fn read_only_char(uuid: uuid::Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        capabilities: Capabilities {
            read: true,
            write: false,
            notify: false,
        },
    }
}

/// Wait until the watched snapshot satisfies the predicate. The timeout is
/// generous so that tests on a paused clock auto-advance through the
/// machine's own phase deadlines first.
async fn wait_for<F>(central: &Central, mut pred: F) -> Snapshot
where
    F: FnMut(&Snapshot) -> bool,
{
    let mut watch = central.watch();
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let snapshot = watch.borrow_and_update().clone();
            if pred(&snapshot) {
                return snapshot;
            }
            watch
                .changed()
                .await
                .expect("state machine task ended unexpectedly");
        }
    })
    .await
    .expect("snapshot condition not reached in time")
}

/// Wait until the recorded transport calls satisfy the predicate.
async fn wait_for_calls<F>(handle: &MockHandle, mut pred: F) -> Vec<MockCall>
where
    F: FnMut(&[MockCall]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let calls = handle.calls();
            if pred(&calls) {
                return calls;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("expected transport calls not observed")
}

/// Scan, connect, and complete discovery of both firmware services.
/// 0xFF01 is notify-capable, 0xEE01 is read/write only.
async fn drive_to_ready(central: &Central, handle: &MockHandle) {
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32,
        Some("esp32"),
        Some(-55),
    )));
    wait_for(central, |s| !s.devices.is_empty()).await;

    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    wait_for(central, |s| s.state == LinkState::DiscoveringServices).await;

    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![
            ServiceInfo {
                uuid: SERVICE_UUID_A,
            },
            ServiceInfo {
                uuid: SERVICE_UUID_B,
            },
        ],
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        characteristics: vec![notify_write_char(CHARACTERISTIC_UUID_A)],
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_B,
        characteristics: vec![write_only_char(CHARACTERISTIC_UUID_B)],
    });
    wait_for(central, |s| s.state == LinkState::Ready).await;
}

#[tokio::test]
async fn test_scan_collects_devices_in_discovery_order() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");

    handle.emit(TransportEvent::PeripheralDiscovered(device(
        "dev-1",
        None,
        Some(-80),
    )));
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        "dev-2",
        Some("esp32"),
        Some(-60),
    )));
    // Same peripheral again with a fresher reading: no new entry.
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        "dev-1",
        Some("beacon"),
        Some(-50),
    )));

    let snapshot = wait_for(&central, |s| {
        s.devices.len() == 2 && s.devices[0].name.is_some()
    })
    .await;
    assert_eq!(snapshot.state, LinkState::Scanning);
    assert_eq!(snapshot.devices[0].id, "dev-1");
    assert_eq!(snapshot.devices[0].name.as_deref(), Some("beacon"));
    assert_eq!(snapshot.devices[0].rssi, Some(-50));
    assert_eq!(snapshot.devices[1].id, "dev-2");

    // The scan was submitted with the configured service filters.
    let calls = handle.calls();
    assert_eq!(
        calls[0],
        MockCall::StartScan {
            filters: vec![SERVICE_UUID_A, SERVICE_UUID_B],
        }
    );
}

#[tokio::test]
async fn test_scan_requires_a_powered_radio() {
    let (central, handle) = setup();
    let err = central.start_scan().await.expect_err("radio is off");
    assert!(matches!(err, CentralError::RadioUnavailable));
    assert!(handle.calls().is_empty(), "nothing reaches the transport");
}

#[tokio::test]
async fn test_restarting_a_scan_clears_previous_results() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        "stale", None, None,
    )));
    wait_for(&central, |s| s.devices.len() == 1).await;

    central.start_scan().await.expect("rescan should start");
    let snapshot = wait_for(&central, |s| s.devices.is_empty()).await;
    assert_eq!(snapshot.state, LinkState::Scanning);
}

#[tokio::test]
async fn test_connect_rejects_unknown_peripherals() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");

    let err = central.connect("never-seen").await.expect_err("unknown id");
    assert!(matches!(err, CentralError::UnknownPeripheral(_)));
    assert!(!handle
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::Connect { .. })));
}

#[tokio::test]
async fn test_full_session_reaches_ready_with_subscriptions() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    let calls = handle.calls();
    // Connecting cancels the scan before touching the peripheral.
    let stop = calls
        .iter()
        .position(|c| matches!(c, MockCall::StopScan))
        .expect("scan should be stopped");
    let connect = calls
        .iter()
        .position(|c| matches!(c, MockCall::Connect { .. }))
        .expect("connect should be submitted");
    assert!(stop < connect);

    // One characteristic discovery per service.
    let discoveries: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            MockCall::DiscoverCharacteristics { service, .. } => Some(*service),
            _ => None,
        })
        .collect();
    assert_eq!(discoveries.len(), 2);
    assert!(discoveries.contains(&SERVICE_UUID_A));
    assert!(discoveries.contains(&SERVICE_UUID_B));

    // Notify-capable characteristic gets a subscription, the write-only one
    // is left alone until the caller asks for it.
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::SetNotify {
            characteristic,
            enabled: true,
            ..
        } if *characteristic == CHARACTERISTIC_UUID_A
    )));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, MockCall::ReadValue { characteristic, .. }
            if *characteristic == CHARACTERISTIC_UUID_B)));

    // The subscription is only reflected once the transport confirms it.
    let snapshot = central.snapshot();
    let chr = snapshot
        .characteristic(CHARACTERISTIC_UUID_A)
        .expect("characteristic should be tracked");
    assert!(!chr.subscribed);

    handle.emit(TransportEvent::NotifyStateChanged {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_A,
        enabled: true,
    });
    let snapshot = wait_for(&central, |s| {
        s.characteristic(CHARACTERISTIC_UUID_A)
            .is_some_and(|c| c.subscribed)
    })
    .await;
    assert_eq!(snapshot.state, LinkState::Ready);
}

#[tokio::test]
async fn test_read_only_characteristics_get_an_initial_read() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![ServiceInfo {
            uuid: SERVICE_UUID_A,
        }],
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        characteristics: vec![read_only_char(CHARACTERISTIC_UUID_A)],
    });
    wait_for(&central, |s| s.state == LinkState::Ready).await;

    let calls = handle.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::ReadValue { characteristic, .. } if *characteristic == CHARACTERISTIC_UUID_A
    )));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, MockCall::SetNotify { .. })));
}

#[tokio::test]
async fn test_connect_failure_surfaces_its_reason() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");

    handle.emit(TransportEvent::ConnectFailed {
        peripheral: ESP32.to_string(),
        reason: FailureReason::PeripheralGone,
    });
    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::ConnectFailed(FailureReason::PeripheralGone))
    );
    assert!(snapshot.characteristics.is_empty());
}

#[tokio::test]
async fn test_transport_level_connect_timeout_reads_as_timeout() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");

    handle.emit(TransportEvent::ConnectFailed {
        peripheral: ESP32.to_string(),
        reason: FailureReason::Timeout,
    });
    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_connecting_phase_times_out_without_a_response() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    wait_for(&central, |s| s.state == LinkState::Connecting).await;

    // No Connected or ConnectFailed ever arrives; the paused clock advances
    // straight to the machine's own deadline.
    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::Timeout)
    );
    // Cleanup disconnect was attempted.
    assert!(handle
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::Disconnect { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_service_discovery_times_out() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    wait_for(&central, |s| s.state == LinkState::DiscoveringServices).await;

    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::Timeout)
    );
}

#[tokio::test]
async fn test_peripheral_without_requested_services_is_dropped() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![],
    });

    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::DiscoveryFailed)
    );
    assert!(handle
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::Disconnect { .. })));
}

#[tokio::test]
async fn test_discovery_fails_only_when_every_service_fails() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![
            ServiceInfo {
                uuid: SERVICE_UUID_A,
            },
            ServiceInfo {
                uuid: SERVICE_UUID_B,
            },
        ],
    });
    handle.emit(TransportEvent::CharacteristicDiscoveryFailed {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        reason: FailureReason::Busy,
    });
    handle.emit(TransportEvent::CharacteristicDiscoveryFailed {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_B,
        reason: FailureReason::Busy,
    });

    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::DiscoveryFailed)
    );
}

#[tokio::test]
async fn test_partial_discovery_failure_still_reaches_ready() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![
            ServiceInfo {
                uuid: SERVICE_UUID_A,
            },
            ServiceInfo {
                uuid: SERVICE_UUID_B,
            },
        ],
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        characteristics: vec![notify_write_char(CHARACTERISTIC_UUID_A)],
    });
    handle.emit(TransportEvent::CharacteristicDiscoveryFailed {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_B,
        reason: FailureReason::Busy,
    });

    let snapshot = wait_for(&central, |s| s.state == LinkState::Ready).await;
    // Only the usable service's characteristics are exposed.
    assert!(snapshot.characteristic(CHARACTERISTIC_UUID_A).is_some());
    assert!(snapshot.characteristic(CHARACTERISTIC_UUID_B).is_none());
}

#[tokio::test]
async fn test_write_is_rejected_without_a_connection() {
    let (central, handle) = setup();
    handle.power_on();
    let err = central
        .write(CHARACTERISTIC_UUID_A, vec![1, 2, 3])
        .await
        .expect_err("no connection");
    assert!(matches!(err, CentralError::NotConnected));
    assert!(!handle
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::WriteValue { .. })));
}

#[tokio::test]
async fn test_write_is_rejected_for_non_writable_characteristics() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![ServiceInfo {
            uuid: SERVICE_UUID_A,
        }],
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        characteristics: vec![read_only_char(CHARACTERISTIC_UUID_A)],
    });
    wait_for(&central, |s| s.state == LinkState::Ready).await;

    let err = central
        .write(CHARACTERISTIC_UUID_A, vec![0xAA])
        .await
        .expect_err("characteristic is read-only");
    assert!(matches!(err, CentralError::NotWritable(_)));
}

#[tokio::test]
async fn test_unacked_write_resolves_on_submission() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    let seq = central
        .write(CHARACTERISTIC_UUID_B, b"ping".to_vec())
        .await
        .expect("write should submit");
    let calls = handle.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::WriteValue {
            characteristic,
            require_ack: false,
            seq: s,
            ..
        } if *characteristic == CHARACTERISTIC_UUID_B && *s == seq
    )));
}

#[tokio::test]
async fn test_acked_writes_resolve_out_of_order_by_sequence() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    let c1 = central.clone();
    let first = tokio::spawn(async move { c1.write_with_ack(CHARACTERISTIC_UUID_B, b"one".to_vec()).await });
    let c2 = central.clone();
    let second =
        tokio::spawn(async move { c2.write_with_ack(CHARACTERISTIC_UUID_B, b"two".to_vec()).await });

    let calls = wait_for_calls(&handle, |calls| {
        calls
            .iter()
            .filter(|c| matches!(c, MockCall::WriteValue { .. }))
            .count()
            == 2
    })
    .await;
    let seqs: Vec<u64> = calls
        .iter()
        .filter_map(|c| match c {
            MockCall::WriteValue { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(seqs.len(), 2);
    assert_ne!(seqs[0], seqs[1]);
    assert!(!first.is_finished(), "ack not yet delivered");
    assert!(!second.is_finished(), "ack not yet delivered");

    // Confirmations arrive in reverse submission order.
    handle.emit(TransportEvent::WriteResult {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_B,
        seq: seqs[1],
        result: Ok(()),
    });
    handle.emit(TransportEvent::WriteResult {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_B,
        seq: seqs[0],
        result: Ok(()),
    });

    let mut resolved = vec![
        first.await.expect("task").expect("write should succeed"),
        second.await.expect("task").expect("write should succeed"),
    ];
    resolved.sort_unstable();
    let mut expected = seqs.clone();
    expected.sort_unstable();
    assert_eq!(resolved, expected);
}

#[tokio::test]
async fn test_failed_ack_surfaces_the_write_error() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    let c = central.clone();
    let write =
        tokio::spawn(async move { c.write_with_ack(CHARACTERISTIC_UUID_B, b"x".to_vec()).await });
    let calls = wait_for_calls(&handle, |calls| {
        calls.iter().any(|c| matches!(c, MockCall::WriteValue { .. }))
    })
    .await;
    let seq = calls
        .iter()
        .find_map(|c| match c {
            MockCall::WriteValue { seq, .. } => Some(*seq),
            _ => None,
        })
        .expect("write was submitted");

    handle.emit(TransportEvent::WriteResult {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_B,
        seq,
        result: Err(FailureReason::Busy),
    });
    let err = write.await.expect("task").expect_err("ack failed");
    assert!(matches!(err, CentralError::WriteFailed { .. }));
}

#[tokio::test]
async fn test_disconnect_fails_pending_acked_writes() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    let c = central.clone();
    let write =
        tokio::spawn(async move { c.write_with_ack(CHARACTERISTIC_UUID_B, b"x".to_vec()).await });
    wait_for_calls(&handle, |calls| {
        calls.iter().any(|c| matches!(c, MockCall::WriteValue { .. }))
    })
    .await;

    handle.emit(TransportEvent::Disconnected {
        peripheral: ESP32.to_string(),
    });
    let err = write.await.expect("task").expect_err("link dropped");
    assert!(matches!(
        err,
        CentralError::WriteFailed {
            reason: FailureReason::PeripheralGone,
            ..
        }
    ));
}

#[tokio::test]
async fn test_value_updates_reach_snapshot_and_data_channel() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;
    let mut updates = central.updates();

    handle.emit(TransportEvent::ValueUpdated {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_A,
        value: vec![0xDE, 0xAD],
    });

    let snapshot = wait_for(&central, |s| {
        s.characteristic(CHARACTERISTIC_UUID_A)
            .is_some_and(|c| c.last_value.is_some())
    })
    .await;
    assert_eq!(
        snapshot
            .characteristic(CHARACTERISTIC_UUID_A)
            .and_then(|c| c.last_value.clone()),
        Some(vec![0xDE, 0xAD])
    );

    loop {
        match updates.recv().await.expect("channel open") {
            Update::Value {
                characteristic,
                value,
            } => {
                assert_eq!(characteristic, CHARACTERISTIC_UUID_A);
                assert_eq!(value, vec![0xDE, 0xAD]);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_user_disconnect_reports_user_requested() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    central.disconnect().await.expect("disconnect should submit");
    wait_for(&central, |s| s.state == LinkState::Disconnecting).await;
    handle.emit(TransportEvent::Disconnected {
        peripheral: ESP32.to_string(),
    });

    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::UserRequested)
    );
    assert!(snapshot.characteristics.is_empty());
    // Scan results survive the disconnect for reconnect attempts.
    assert!(!snapshot.devices.is_empty());
}

#[tokio::test]
async fn test_unsolicited_disconnect_reports_peripheral_dropped() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    handle.emit(TransportEvent::Disconnected {
        peripheral: ESP32.to_string(),
    });
    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::PeripheralDropped)
    );
}

#[tokio::test]
async fn test_radio_loss_overrides_an_active_session() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    handle.emit(TransportEvent::RadioStateChanged(RadioState::PoweredOff));
    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::RadioUnavailable)
    );
    assert!(snapshot.characteristics.is_empty());

    // A fresh session is possible once power returns.
    handle.power_on();
    central.start_scan().await.expect("rescan should start");
    wait_for(&central, |s| s.state == LinkState::Scanning).await;
}

#[tokio::test]
async fn test_completions_after_disconnect_are_dropped() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![ServiceInfo {
            uuid: SERVICE_UUID_A,
        }],
    });
    wait_for(&central, |s| {
        s.state == LinkState::DiscoveringCharacteristics
    })
    .await;

    // The peripheral drops mid-discovery; the late completion must not
    // resurrect the session.
    handle.emit(TransportEvent::Disconnected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        characteristics: vec![notify_write_char(CHARACTERISTIC_UUID_A)],
    });

    let snapshot = wait_for(&central, |s| {
        matches!(s.state, LinkState::Disconnected(_))
    })
    .await;
    assert_eq!(
        snapshot.state,
        LinkState::Disconnected(DisconnectReason::PeripheralDropped)
    );
    tokio::task::yield_now().await;
    let snapshot = central.snapshot();
    assert!(matches!(snapshot.state, LinkState::Disconnected(_)));
    assert!(snapshot.characteristics.is_empty());
}

#[tokio::test]
async fn test_notify_setup_failure_keeps_the_session_ready() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    handle.emit(TransportEvent::NotifySetupFailed {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_A,
        reason: FailureReason::Busy,
    });

    // The failed characteristic drops out of rotation; the session survives.
    let snapshot = wait_for(&central, |s| {
        s.characteristic(CHARACTERISTIC_UUID_A).is_none()
    })
    .await;
    assert_eq!(snapshot.state, LinkState::Ready);

    let err = central
        .write(CHARACTERISTIC_UUID_A, vec![0x01])
        .await
        .expect_err("unusable characteristic must not accept writes");
    assert!(matches!(err, CentralError::NotWritable(_)));

    // The sibling characteristic is unaffected.
    central
        .write(CHARACTERISTIC_UUID_B, b"ok".to_vec())
        .await
        .expect("write should submit");
}

#[tokio::test]
async fn test_failed_initial_read_skips_the_characteristic() {
    let (central, handle) = setup();
    handle.power_on();
    central.start_scan().await.expect("scan should start");
    handle.emit(TransportEvent::PeripheralDiscovered(device(
        ESP32, None, None,
    )));
    wait_for(&central, |s| !s.devices.is_empty()).await;
    central.connect(ESP32).await.expect("connect should submit");
    handle.emit(TransportEvent::Connected {
        peripheral: ESP32.to_string(),
    });
    handle.emit(TransportEvent::ServicesDiscovered {
        peripheral: ESP32.to_string(),
        services: vec![ServiceInfo {
            uuid: SERVICE_UUID_A,
        }],
    });
    handle.emit(TransportEvent::CharacteristicsDiscovered {
        peripheral: ESP32.to_string(),
        service: SERVICE_UUID_A,
        characteristics: vec![
            read_only_char(CHARACTERISTIC_UUID_A),
            write_only_char(CHARACTERISTIC_UUID_B),
        ],
    });
    wait_for(&central, |s| s.state == LinkState::Ready).await;

    handle.emit(TransportEvent::ReadFailed {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_A,
        reason: FailureReason::Unsupported,
    });
    let snapshot = wait_for(&central, |s| {
        s.characteristic(CHARACTERISTIC_UUID_A).is_none()
    })
    .await;
    assert_eq!(snapshot.state, LinkState::Ready);
    assert!(snapshot.characteristic(CHARACTERISTIC_UUID_B).is_some());

    // Values for the skipped characteristic are ignored from then on.
    handle.emit(TransportEvent::ValueUpdated {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_A,
        value: vec![0xFF],
    });
    tokio::task::yield_now().await;
    assert!(central
        .snapshot()
        .characteristic(CHARACTERISTIC_UUID_A)
        .is_none());
}

#[tokio::test]
async fn test_stale_write_completion_is_not_published() {
    let (central, handle) = setup();
    drive_to_ready(&central, &handle).await;

    let seq = central
        .write(CHARACTERISTIC_UUID_B, b"x".to_vec())
        .await
        .expect("write should submit");
    let mut updates = central.updates();

    handle.emit(TransportEvent::Disconnected {
        peripheral: ESP32.to_string(),
    });
    wait_for(&central, |s| matches!(s.state, LinkState::Disconnected(_))).await;

    // The confirmation for the dead session arrives late, then a fresh scan
    // starts; the scan status must be the next thing consumers see.
    handle.emit(TransportEvent::WriteResult {
        peripheral: ESP32.to_string(),
        characteristic: CHARACTERISTIC_UUID_B,
        seq,
        result: Ok(()),
    });
    central.start_scan().await.expect("rescan should start");

    loop {
        match updates.recv().await.expect("channel open") {
            Update::WriteCompleted { .. } => {
                panic!("completion for a dead session reached the data channel")
            }
            Update::Status {
                state: LinkState::Scanning,
                ..
            } => break,
            _ => continue,
        }
    }
}
