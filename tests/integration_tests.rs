use std::sync::Arc;
use std::time::Duration;

use simdev::{
    backend::{
        BackendError, BackendOptions, Gateway, GatewayBackend, InFlight, LinkEvent, QoS,
        RetryPolicy, DOWNLINK_TOPIC,
    },
    config::{AESKey, DeviceConfig, EUI64},
    device::{DeviceError, DeviceState, JoinAcceptError, LinePayloads, SimulatedDevice},
    lorawan::{FrameError, MType, PhyPayload, FHDR},
    radio::{DataRate, RxInfo, UplinkFrame},
};

mod mock;
use mock::{downlink_json, MockBroker, NetworkServer};

fn app_key() -> AESKey {
    "0102030405060708090a0b0c0d0e0f10".parse().unwrap()
}

fn device_config() -> DeviceConfig {
    DeviceConfig::new_otaa(
        "0203040506070809".parse().unwrap(),
        "0102030405060708".parse().unwrap(),
        app_key(),
    )
}

fn gateway_id() -> EUI64 {
    EUI64::new([0x01; 8])
}

fn rx_info() -> RxInfo {
    RxInfo::new(gateway_id(), 470_300_000, DataRate::lora(12, 125))
}

fn fast_options() -> BackendOptions {
    BackendOptions {
        connect_retry: RetryPolicy::fixed(Duration::from_millis(10)),
        subscribe_retry: RetryPolicy::fixed(Duration::from_millis(10)),
        ..BackendOptions::default()
    }
}

async fn connect(broker: &MockBroker) -> GatewayBackend<MockBroker> {
    GatewayBackend::connect(broker.clone(), fast_options())
        .await
        .unwrap()
}

fn sample_uplink() -> UplinkFrame {
    let mut phy = PhyPayload::data(
        MType::UnconfirmedDataUp,
        FHDR::new(0x0102_0304u32.into(), 7),
        1,
        b"payload",
    )
    .unwrap();
    phy.set_mic(&AESKey::new([0x02; 16])).unwrap();
    UplinkFrame {
        rx_info: rx_info(),
        phy_payload: phy,
    }
}

fn sample_downlink() -> Vec<u8> {
    downlink_json(&NetworkServer::new(app_key()).join_accept())
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_until_broker_is_up() {
    let broker = MockBroker::new();
    broker.fail_connects(3);
    broker.fail_subscribes(2);

    let backend = GatewayBackend::connect(broker.clone(), BackendOptions::default())
        .await
        .unwrap();

    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(broker.subscribe_attempts(), 3);
    assert_eq!(
        broker.subscription(),
        Some((DOWNLINK_TOPIC.to_string(), QoS::ExactlyOnce))
    );
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_retry_surfaces_errors() {
    let broker = MockBroker::new();
    broker.fail_connects(u32::MAX);
    let options = BackendOptions {
        connect_retry: RetryPolicy::fixed(Duration::from_secs(2)).with_max_attempts(3),
        ..BackendOptions::default()
    };
    let result = GatewayBackend::connect(broker.clone(), options).await;
    assert!(matches!(result, Err(BackendError::Connection(_))));
    assert_eq!(broker.connect_attempts(), 3);

    let broker = MockBroker::new();
    broker.fail_subscribes(u32::MAX);
    let options = BackendOptions {
        subscribe_retry: RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(2),
        ..BackendOptions::default()
    };
    let result = GatewayBackend::connect(broker.clone(), options).await;
    match result {
        Err(BackendError::Subscribe { topic, .. }) => assert_eq!(topic, DOWNLINK_TOPIC),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("subscribe should not succeed"),
    }
    assert_eq!(broker.subscribe_attempts(), 2);
}

#[tokio::test]
async fn test_send_uplink_publishes_envelope() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;
    let frame = sample_uplink();

    backend.send_uplink(&frame).await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "gateway/0101010101010101/rx");
    assert_eq!(published[0].qos, QoS::AtLeastOnce);

    let json: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(json["rxInfo"]["mac"], "0101010101010101");
    assert_eq!(
        json["rxInfo"]["size"],
        frame.phy_payload.to_bytes().unwrap().len()
    );
    assert_eq!(published[0].uplink().phy_payload, frame.phy_payload);
}

#[tokio::test]
async fn test_send_uplink_reports_publish_failure() {
    let broker = MockBroker::new();
    broker.fail_publish(0);
    let backend = connect(&broker).await;

    let result = backend.send_uplink(&sample_uplink()).await;
    assert!(matches!(result, Err(BackendError::Publish(_))));

    // The backend stays usable
    backend.send_uplink(&sample_uplink()).await.unwrap();
}

#[tokio::test]
async fn test_undecodable_downlinks_are_dropped() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;
    let inbound = backend.inbound();

    assert!(broker.deliver(b"not json".to_vec()));
    assert!(broker.deliver(br#"{"phyPayload":"!!!"}"#.to_vec()));
    // Valid base64, frame too short
    assert!(broker.deliver(br#"{"phyPayload":"QAE="}"#.to_vec()));
    assert!(broker.deliver(sample_downlink()));

    let frame = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.phy_payload.mhdr.mtype, MType::JoinAccept);
    assert_eq!(frame.tx_info.mac, gateway_id());
    assert!(inbound.try_recv().is_none());
}

#[tokio::test]
async fn test_link_events_do_not_disturb_backend() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;

    broker.emit(LinkEvent::Disconnected {
        reason: "keep alive timeout".into(),
    });
    broker.emit(LinkEvent::Reconnecting { attempt: 1 });
    broker.emit(LinkEvent::Connected {
        session_present: true,
    });

    backend.send_uplink(&sample_uplink()).await.unwrap();
    assert!(broker.deliver(sample_downlink()));
    assert!(backend.inbound().recv().await.is_some());
}

#[tokio::test]
async fn test_close_drains_in_flight_deliveries() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;
    let inbound = backend.inbound();

    // Handlers are admitted synchronously; their delivery tasks have not
    // run yet on this single-threaded runtime.
    for _ in 0..20 {
        assert!(broker.deliver(sample_downlink()));
    }
    assert_eq!(backend.in_flight(), 20);

    backend.close().await.unwrap();
    assert_eq!(backend.in_flight(), 0);
    assert_eq!(broker.unsubscribed(), vec![DOWNLINK_TOPIC.to_string()]);
    assert!(broker.is_disconnected());

    // A late invocation from the broker is refused
    let handler = broker.last_handler().unwrap();
    handler(simdev::backend::InboundMessage {
        topic: mock::TX_TOPIC.to_string(),
        payload: sample_downlink(),
    });
    assert_eq!(backend.in_flight(), 0);

    let mut received = 0;
    while let Some(frame) = inbound.recv().await {
        assert_eq!(frame.phy_payload.mhdr.mtype, MType::JoinAccept);
        received += 1;
    }
    assert_eq!(received, 20);
    assert!(inbound.try_recv().is_none());

    // Closing twice is harmless
    backend.close().await.unwrap();
    assert_eq!(broker.unsubscribed().len(), 1);
}

#[tokio::test]
async fn test_concurrent_close_shuts_down_once() {
    let broker = MockBroker::new();
    broker.fail_unsubscribes(1);
    let backend = connect(&broker).await;
    for _ in 0..5 {
        assert!(broker.deliver(sample_downlink()));
    }

    let (first, second) = tokio::join!(backend.close(), backend.close());
    assert!(matches!(first, Err(BackendError::Unsubscribe { .. })));
    assert_eq!(second, first);
    assert_eq!(broker.unsubscribed().len(), 1);
    assert!(broker.is_disconnected());
    assert_eq!(backend.in_flight(), 0);

    // A later call reports the same outcome without touching the broker
    assert_eq!(backend.close().await, first);
    assert_eq!(broker.unsubscribed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_barrier() {
    let barrier = InFlight::new();
    let guard = barrier.enter().unwrap();
    let second = barrier.enter().unwrap();
    assert_eq!(barrier.active(), 2);

    barrier.close();
    assert!(barrier.is_closed());
    assert!(barrier.enter().is_none());
    drop(second);

    let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&released);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        drop(guard);
    });

    barrier.wait_idle().await;
    assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(barrier.active(), 0);
}

#[tokio::test]
async fn test_join_and_uplinks_end_to_end() {
    let broker = MockBroker::new();
    let server = NetworkServer::new(app_key());
    broker.set_responder(server.responder(1));

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);
    assert_eq!(device.state(), DeviceState::Idle);

    let mut source = LinePayloads::new(&b"hello\nworld\n"[..]);
    device.run(&mut source).await.unwrap();
    assert_eq!(device.state(), DeviceState::Transmitting);

    let session = device.session().unwrap();
    assert_eq!(session.dev_addr, server.dev_addr);
    assert_eq!(session.fcnt_up, 3);

    let published = broker.published();
    assert_eq!(published.len(), 3);
    assert!(published
        .iter()
        .all(|p| p.topic == "gateway/0101010101010101/rx" && p.accepted));

    let request = published[0].uplink().phy_payload;
    assert_eq!(request.mhdr.mtype, MType::JoinRequest);
    assert!(request.validate_mic(&app_key()).unwrap());

    let (nwk_skey, app_skey) = server.session_keys(&request);
    assert_eq!(session.nwk_skey, nwk_skey);
    assert_eq!(session.app_skey, app_skey);

    for (published, (fcnt, text)) in published[1..].iter().zip([(1, "hello"), (2, "world")]) {
        let mut phy = published.uplink().phy_payload;
        assert_eq!(phy.mhdr.mtype, MType::UnconfirmedDataUp);
        assert!(phy.validate_mic(&nwk_skey).unwrap());
        phy.apply_frm_cipher(&app_skey).unwrap();

        let mac = phy.mac_payload().unwrap();
        assert_eq!(mac.fhdr.dev_addr, server.dev_addr);
        assert_eq!(mac.fhdr.f_cnt, fcnt);
        assert_eq!(mac.f_port, Some(1));
        assert_eq!(mac.frm_payload.as_slice(), text.as_bytes());
    }
}

#[tokio::test]
async fn test_failed_publish_still_advances_counter() {
    let broker = MockBroker::new();
    let server = NetworkServer::new(app_key());
    broker.set_responder(server.responder(1));
    // Publish 0 is the join request, 1 the first data uplink
    broker.fail_publish(1);

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);
    device.join().await.unwrap();

    let first = device.send_uplink(b"one").await;
    assert!(matches!(first, Err(DeviceError::Backend(BackendError::Publish(_)))));
    assert_eq!(device.send_uplink(b"two").await.unwrap(), 2);

    let counters: Vec<(u32, bool)> = broker.published()[1..]
        .iter()
        .map(|p| (p.uplink().phy_payload.mac_payload().unwrap().fhdr.f_cnt, p.accepted))
        .collect();
    assert_eq!(counters, vec![(1, false), (2, true)]);
}

#[tokio::test]
async fn test_run_continues_after_failed_publish() {
    let broker = MockBroker::new();
    broker.set_responder(NetworkServer::new(app_key()).responder(1));
    broker.fail_publish(1);

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);

    let mut source = LinePayloads::new(&b"one\ntwo\nthree\n"[..]);
    device.run(&mut source).await.unwrap();
    assert_eq!(device.state(), DeviceState::Transmitting);
    assert_eq!(device.session().unwrap().fcnt_up, 4);

    let counters: Vec<(u32, bool)> = broker.published()[1..]
        .iter()
        .map(|p| (p.uplink().phy_payload.mac_payload().unwrap().fhdr.f_cnt, p.accepted))
        .collect();
    assert_eq!(counters, vec![(1, false), (2, true), (3, true)]);
}

#[tokio::test]
async fn test_oversized_payload_does_not_consume_counter() {
    let broker = MockBroker::new();
    broker.set_responder(NetworkServer::new(app_key()).responder(1));

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);
    device.join().await.unwrap();

    let result = device.send_uplink(&[0u8; 243]).await;
    assert!(matches!(result, Err(DeviceError::Frame(FrameError::Cipher(_)))));
    assert_eq!(broker.published().len(), 1);
    assert_eq!(device.send_uplink(b"ok").await.unwrap(), 1);
}

#[tokio::test]
async fn test_uplink_before_join_is_rejected() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);

    assert_eq!(device.send_uplink(b"early").await, Err(DeviceError::NotJoined));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_counter_exhaustion_stops_uplinks() {
    let broker = MockBroker::new();
    broker.set_responder(NetworkServer::new(app_key()).responder(1));

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);
    device.join().await.unwrap();

    // Fast-forward to the last usable counter
    device.session_mut().unwrap().fcnt_up = u32::MAX;
    assert_eq!(device.send_uplink(b"last").await.unwrap(), u32::MAX);
    assert_eq!(
        device.send_uplink(b"again").await,
        Err(DeviceError::FrameCounterExhausted)
    );
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn test_join_rejects_non_join_accept() {
    let broker = MockBroker::new();
    let server = NetworkServer::new(app_key());
    let data = server.data_down(&AESKey::new([0x02; 16]), &AESKey::new([0x03; 16]), 1, 1, b"x");
    broker.set_responder(Arc::new(move |_: &mock::Published| vec![downlink_json(&data)]));

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);

    let err = device.join().await.unwrap_err();
    assert_eq!(
        err,
        DeviceError::JoinAccept(JoinAcceptError::NotJoinAccept(MType::UnconfirmedDataDown))
    );
    assert_eq!(device.state(), DeviceState::Idle);
    assert!(device.session().is_none());
}

#[tokio::test]
async fn test_join_rejects_accept_for_other_key() {
    let broker = MockBroker::new();
    let server = NetworkServer::new(app_key());
    let accept = server.join_accept_with_key(&AESKey::new([0x55; 16]));
    broker.set_responder(Arc::new(move |_: &mock::Published| vec![downlink_json(&accept)]));

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);

    let mut source = LinePayloads::new(&b"never sent\n"[..]);
    let err = device.run(&mut source).await.unwrap_err();
    assert_eq!(err, DeviceError::JoinAccept(JoinAcceptError::InvalidMic));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_join_ignores_downlinks_queued_before_request() {
    let broker = MockBroker::new();
    let server = NetworkServer::new(app_key());
    broker.set_responder(server.responder(1));

    let backend = connect(&broker).await;
    // Traffic for another device arrives before the join starts
    let other = server.data_down(&AESKey::new([0x02; 16]), &AESKey::new([0x03; 16]), 1, 1, b"x");
    assert!(broker.deliver(downlink_json(&other)));
    while backend.in_flight() > 0 {
        tokio::task::yield_now().await;
    }

    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);
    let session = device.join().await.unwrap();
    assert_eq!(session.dev_addr, server.dev_addr);
    assert_eq!(device.state(), DeviceState::Joined);
}

#[tokio::test(start_paused = true)]
async fn test_join_times_out_without_accept() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend)
        .with_join_timeout(Some(Duration::from_secs(5)));

    let err = device.join().await.unwrap_err();
    assert_eq!(
        err,
        DeviceError::JoinAccept(JoinAcceptError::Timeout(Duration::from_secs(5)))
    );
}

#[tokio::test]
async fn test_join_fails_when_backend_closed() {
    let broker = MockBroker::new();
    let backend = connect(&broker).await;
    backend.close().await.unwrap();

    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);
    let err = device.join().await.unwrap_err();
    assert_eq!(err, DeviceError::JoinAccept(JoinAcceptError::QueueClosed));
}

#[tokio::test]
async fn test_duplicate_join_accepts_and_data_downlinks() {
    let broker = MockBroker::new();
    let server = NetworkServer::new(app_key());
    let responder_server = server.clone();
    let keys = Arc::new(parking_lot::Mutex::new(None));
    let responder_keys = Arc::clone(&keys);

    broker.set_responder(Arc::new(move |published: &mock::Published| {
        let phy = published.uplink().phy_payload;
        match phy.mhdr.mtype {
            MType::JoinRequest => {
                *responder_keys.lock() = Some(responder_server.session_keys(&phy));
                let accept = downlink_json(&responder_server.join_accept());
                vec![accept.clone(), accept]
            }
            _ => {
                let Some((nwk, app)) = *responder_keys.lock() else {
                    return Vec::new();
                };
                let f_cnt = phy.mac_payload().unwrap().fhdr.f_cnt;
                vec![downlink_json(&responder_server.data_down(&nwk, &app, f_cnt, 2, b"ack"))]
            }
        }
    }));

    let backend = connect(&broker).await;
    let mut device = SimulatedDevice::new(device_config(), rx_info(), backend);

    let mut source = LinePayloads::new(&b"one\ntwo\nthree\n"[..]);
    device.run(&mut source).await.unwrap();
    tokio::task::yield_now().await;
    device.drain_downlinks();

    // The duplicate join accept did not disturb the session
    let session = device.session().unwrap();
    assert_eq!(session.fcnt_up, 4);
    assert_eq!(Some((session.nwk_skey, session.app_skey)), *keys.lock());
    // Downlinks answering uplinks 1..=3 were verified and recorded
    assert_eq!(session.fcnt_down, 3);
    assert!(device.gateway().inbound().try_recv().is_none());
}
