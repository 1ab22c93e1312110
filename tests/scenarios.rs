//! End-to-end scenarios over the transport and MQTT doubles.
//!
//! Cadences are scaled down from production values so the suite runs in
//! seconds; the ratios between latencies and periods are preserved.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use batwatch::bus::EventBus;
use batwatch::config::{CoreConfig, MqttSettings};
use batwatch::connection::pool::{ConnectionPool, PoolConfig};
use batwatch::connection::reconnect::{ReconnectController, ReconnectPolicy};
use batwatch::connection::state::LinkState;
use batwatch::device::registry::MemoryRegistryStore;
use batwatch::device::session::{DeviceSession, SessionConfig};
use batwatch::engine::state::RuntimeRegistry;
use batwatch::engine::CoreEngine;
use batwatch::events::{Event, Topic};
use batwatch::mqtt::mock::MockMqttConnector;
use batwatch::protocol::{crypto, ProtocolFamily};
use batwatch::storage::MemorySink;
use batwatch::transport::mock::MockTransport;
use batwatch::types::DeviceKind;

const DEV1: &str = "AA:BB:CC:DD:EE:01";
const DEV2: &str = "AA:BB:CC:DD:EE:02";

/// Encrypted realtime block: 12.60 V, 25.1 C, SoC 85 %.
fn realtime_block() -> Vec<u8> {
    let mut block = [0u8; 16];
    block[..9].copy_from_slice(&hex::decode("d1550700fb005504ec").unwrap());
    crypto::encrypt(&block).unwrap()
}

/// Same block with the SoC byte mutated to 250.
fn bad_soc_block() -> Vec<u8> {
    let mut block = [0u8; 16];
    block[..9].copy_from_slice(&hex::decode("d1550700fb00fa04ec").unwrap());
    crypto::encrypt(&block).unwrap()
}

fn notify_char() -> uuid::Uuid {
    ProtocolFamily::Bm6.characteristics().notify
}

fn wire_responder(transport: &MockTransport, address: &str) {
    transport.respond_to_writes(address, notify_char(), Arc::new(|_| Some(realtime_block())));
}

async fn engine_with(
    transport: MockTransport,
    mqtt: Option<MockMqttConnector>,
    sink: Arc<MemorySink>,
) -> CoreEngine {
    let mut config = CoreConfig::default();
    config.discovery.initial_scan = false;
    config.bluetooth.max_concurrent_connections = 1;
    if mqtt.is_some() {
        config.mqtt = MqttSettings {
            enabled: true,
            initial_retry_delay_s: 0.02,
            max_retry_delay_s: 0.2,
            jitter_factor: 0.0,
            message_queue_size: 100,
            ..MqttSettings::default()
        };
    }

    let mut engine = CoreEngine::new(
        config,
        Arc::new(transport),
        Arc::new(MemoryRegistryStore::new()),
    )
    .with_sink(sink);
    if let Some(connector) = mqtt {
        engine = engine.with_mqtt_connector(Arc::new(connector));
    }
    engine.start().await.unwrap();
    engine
}

/// S1: an encrypted realtime block round-trips into one `ReadingProduced`
/// with the expected values; a mutated SoC field produces no event.
#[tokio::test]
async fn s1_encrypted_reading_round_trip() {
    let transport = MockTransport::new();
    wire_responder(&transport, DEV1);
    let sink = Arc::new(MemorySink::new());
    let engine = engine_with(transport.clone(), None, sink).await;
    let mut readings = engine.reading_stream();

    engine
        .add_device(DEV1, DeviceKind::Bm6, Some("starter".into()), Some(3600))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), readings.recv())
        .await
        .expect("reading within the first poll")
        .unwrap();
    match event {
        Event::ReadingProduced { address, reading } => {
            assert_eq!(address, DEV1);
            assert!((reading.voltage - 12.60).abs() < 1e-9);
            assert!((reading.temperature - 25.1).abs() < 1e-9);
            assert!((reading.state_of_charge - 85.0).abs() < 1e-9);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Mutated block: parsed, rejected, no event.
    let session_open = transport.has_subscription(DEV1, notify_char());
    if session_open {
        transport.notify(DEV1, notify_char(), &bad_soc_block());
    } else {
        // Session closed after the poll; parse directly at the codec level.
        assert!(ProtocolFamily::Bm6.parse_notification(&bad_soc_block()).is_err());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(readings.try_recv().is_none());

    engine.shutdown().await;
}

/// S2: five concurrent connects to the same address execute one transport
/// connect and share the handle.
#[tokio::test]
async fn s2_race_free_connect() {
    let transport = MockTransport::new();
    transport.set_connect_latency(Duration::from_millis(100));
    let pool = ConnectionPool::new(
        Arc::new(transport.clone()),
        PoolConfig::default(),
        EventBus::default(),
    );

    let mut joins = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        joins.push(tokio::spawn(async move { pool.get_or_connect(DEV1).await }));
    }
    let mut handles = Vec::new();
    for join in joins {
        handles.push(join.await.unwrap().unwrap());
    }

    assert_eq!(transport.connect_count(DEV1), 1);
    assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(pool.stats().pending, 0);
}

/// S3: two devices under cap 1 with overlapping cadences both make
/// progress; neither starves and skips stay rare.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_admission_under_cap_one() {
    let transport = MockTransport::new();
    transport.set_write_latency(Duration::from_millis(70));
    wire_responder(&transport, DEV1);
    wire_responder(&transport, DEV2);

    let bus = EventBus::default();
    let mut poll_events = bus.subscribe(Topic::Poll);
    let pool = ConnectionPool::new(
        Arc::new(transport.clone()),
        PoolConfig {
            max_connections: 1,
            connect_timeout: Duration::from_millis(500),
            ..PoolConfig::default()
        },
        bus.clone(),
    );
    let scheduler = batwatch::scheduler::PollScheduler::new(1, bus.clone());
    let root = CancellationToken::new();
    let runtime = RuntimeRegistry::new();

    for address in [DEV1, DEV2] {
        let session = Arc::new(DeviceSession::new(
            address.to_string(),
            ProtocolFamily::Bm6,
            pool.clone(),
            bus.clone(),
            runtime.clone(),
            SessionConfig {
                command_timeout: Duration::from_millis(300),
                ..SessionConfig::default()
            },
            None,
        ));
        scheduler.register(session, Duration::from_millis(100), &root);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    root.cancel();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Each poll cycle opens a fresh link, so connects count poll cycles.
    assert!(
        transport.connect_count(DEV1) >= 4,
        "device 1 starved: {} polls",
        transport.connect_count(DEV1)
    );
    assert!(
        transport.connect_count(DEV2) >= 4,
        "device 2 starved: {} polls",
        transport.connect_count(DEV2)
    );

    let mut skips = 0;
    while let Some(event) = poll_events.try_recv() {
        if matches!(event, Event::PollSkipped { .. }) {
            skips += 1;
        }
    }
    assert!(skips <= 2, "{skips} cycles skipped");
}

/// S4: four failed connects back off 1-2-4-8 (verified against the pure
/// delay function), and the fifth succeeds with the old subscription
/// re-installed, proven by a synthetic notification reaching the session.
#[tokio::test]
async fn s4_backoff_and_subscription_reinstall() {
    let policy = ReconnectPolicy {
        jitter_factor: 0.0,
        ..ReconnectPolicy::default()
    };
    let delays: Vec<u64> = (0..4)
        .map(|k| batwatch::connection::reconnect::backoff_delay(&policy, k).as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8]);

    // Behavioral half at millisecond scale.
    let transport = MockTransport::new();
    let bus = EventBus::default();
    let mut readings = bus.subscribe(Topic::DeviceReading);
    let pool = ConnectionPool::new(
        Arc::new(transport.clone()),
        PoolConfig {
            connect_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        },
        bus.clone(),
    );
    let controller = ReconnectController::new(pool.clone());
    let runtime = RuntimeRegistry::new();

    let session = Arc::new(DeviceSession::new(
        DEV1.to_string(),
        ProtocolFamily::Bm6,
        pool.clone(),
        bus.clone(),
        runtime,
        SessionConfig {
            keep_open: true,
            ..SessionConfig::default()
        },
        None,
    ));
    session.open().await.unwrap();

    transport.drop_link(DEV1);
    pool.sweep_once().await;
    assert_eq!(pool.state(DEV1), LinkState::Reconnecting);

    transport.fail_next_connects(DEV1, 4);
    let subscriptions = pool.take_orphaned_subscriptions(DEV1);
    assert_eq!(subscriptions.len(), 1);
    controller.arm(
        DEV1,
        ReconnectPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_factor: 0.0,
        },
        subscriptions,
        &CancellationToken::new(),
    );

    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.state(DEV1) != LinkState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnect");
    // 1 initial + 4 failures + 1 success
    assert_eq!(transport.connect_count(DEV1), 6);

    // The re-installed subscription still feeds the session.
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.notify(DEV1, notify_char(), &realtime_block());
    let event = tokio::time::timeout(Duration::from_secs(1), readings.recv())
        .await
        .expect("reading after reinstall")
        .unwrap();
    assert!(matches!(event, Event::ReadingProduced { .. }));
}

/// S5: a broker outage queues 50 readings; reconnect publishes all of them
/// in original order with no losses and one counted reconnection.
#[tokio::test]
async fn s5_mqtt_resilience() {
    let connector = MockMqttConnector::new();
    let client = batwatch::mqtt::MqttResilienceClient::new(
        MqttSettings {
            enabled: true,
            initial_retry_delay_s: 0.02,
            max_retry_delay_s: 0.2,
            jitter_factor: 0.0,
            message_queue_size: 100,
            max_retries: 10,
            ..MqttSettings::default()
        },
        Arc::new(connector.clone()),
    );
    client.start();
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.state() != batwatch::mqtt::MqttState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    connector.set_broker_up(false);
    for i in 0..50 {
        client.publish_json(
            format!("batwatch/device/D{i:02}/reading"),
            &serde_json::json!({ "seq": i }),
        );
    }
    // All 50 are held; the queue peaks at 50.
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.queue_len() < 50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    connector.set_broker_up(true);

    tokio::time::timeout(Duration::from_secs(3), async {
        while connector.published().len() < 50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flush after reconnect");

    let published = connector.published();
    for (i, (topic, _)) in published.iter().enumerate() {
        assert_eq!(topic, &format!("batwatch/device/D{i:02}/reading"));
    }
    let stats = client.stats();
    assert_eq!(stats.messages_failed, 0);
    assert_eq!(stats.total_reconnections, 1);
    client.stop(Duration::from_millis(200)).await;
}

/// S6: during shutdown a late notification is parsed but never published;
/// nothing follows `system.shutdown`.
#[tokio::test]
async fn s6_shutdown_ordering() {
    let transport = MockTransport::new();
    wire_responder(&transport, DEV1);
    let sink = Arc::new(MemorySink::new());
    let engine = engine_with(transport.clone(), None, sink).await;

    engine
        .add_device(DEV1, DeviceKind::Bm6, None, Some(3600))
        .await
        .unwrap();
    let mut readings = engine.reading_stream();
    let mut shutdowns = engine.subscribe(Topic::SystemShutdown);

    // First poll produces a reading.
    tokio::time::timeout(Duration::from_secs(3), readings.recv())
        .await
        .expect("baseline reading")
        .unwrap();

    engine.shutdown().await;

    // The shutdown event went out, and the bus is closed behind it.
    let event = tokio::time::timeout(Duration::from_secs(1), shutdowns.recv())
        .await
        .expect("shutdown event")
        .unwrap();
    assert!(matches!(event, Event::Shutdown { .. }));

    // A notification racing teardown is parsed but produces no event.
    transport.notify(DEV1, notify_char(), &realtime_block());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(readings.try_recv().is_none());
    assert!(engine.bus().is_closed());
}

/// Discovery to reading to storage to summary, end to end.
#[tokio::test]
async fn discovery_to_summary_pipeline() {
    let transport = MockTransport::new();
    transport.advertise(DEV1, Some("BM6 Battery Monitor"), Default::default());
    wire_responder(&transport, DEV1);
    let sink = Arc::new(MemorySink::new());
    let engine = engine_with(transport.clone(), None, sink.clone()).await;

    let mut discoveries = engine.subscribe(Topic::DeviceDiscovered);
    let mut summaries = engine.subscribe(Topic::VehicleSummary);

    let found = engine.run_discovery().await.unwrap();
    assert_eq!(found, 1);
    let record = engine.get_device(DEV1).expect("registered");
    assert_eq!(record.kind, DeviceKind::Bm6);
    assert!(matches!(
        discoveries.try_recv(),
        Some(Event::DeviceDiscovered { .. })
    ));

    // Configure, associate, and wait for the first poll.
    engine.add_vehicle("van", "Camper van").await;
    engine
        .add_device(DEV1, DeviceKind::Bm6, None, Some(3600))
        .await
        .unwrap();
    engine.associate(DEV1, Some("van".into())).await.unwrap();

    let summary_event = tokio::time::timeout(Duration::from_secs(3), summaries.recv())
        .await
        .expect("summary after first reading")
        .unwrap();
    match summary_event {
        Event::VehicleSummaryUpdated { vehicle_id, .. } => assert_eq!(vehicle_id, "van"),
        other => panic!("unexpected event: {other:?}"),
    }

    // The sink observed the reading with its vehicle attribution.
    tokio::time::timeout(Duration::from_secs(2), async {
        while sink.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stored reading");
    let rows = sink.rows();
    assert_eq!(rows[0].address, DEV1);

    assert!(engine.latest_reading(DEV1).is_some());
    let status = engine.status();
    assert!(status.running);
    assert_eq!(status.total_devices, 1);
    assert_eq!(status.configured_devices, 1);

    engine.shutdown().await;
}

/// Readings bridged to MQTT carry the right topics and retain flags.
#[tokio::test]
async fn mqtt_bridge_topic_scheme() {
    let transport = MockTransport::new();
    wire_responder(&transport, DEV1);
    let connector = MockMqttConnector::new();
    let sink = Arc::new(MemorySink::new());
    let engine = engine_with(transport.clone(), Some(connector.clone()), sink).await;

    engine
        .add_device(DEV1, DeviceKind::Bm6, None, Some(3600))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while !connector
            .published()
            .iter()
            .any(|(topic, _)| topic == &format!("batwatch/device/{DEV1}/reading"))
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bridged reading");

    let reading_topic = format!("batwatch/device/{DEV1}/reading");
    let status_topic = format!("batwatch/device/{DEV1}/status");
    for (topic, retain) in connector.retain_flags() {
        if topic == reading_topic {
            assert!(!retain);
        } else if topic == status_topic || topic == "batwatch/system/status" {
            assert!(retain);
        }
    }

    let (_, payload) = connector
        .published()
        .into_iter()
        .find(|(topic, _)| topic == &reading_topic)
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["device_id"], DEV1);
    assert_eq!(value["voltage"], 12.6);
    assert_eq!(value["device_type"], "BM6");

    engine.shutdown().await;
}

/// Removing a device cancels its polling and forgets its link state.
#[tokio::test]
async fn remove_device_stops_polling() {
    let transport = MockTransport::new();
    wire_responder(&transport, DEV1);
    let sink = Arc::new(MemorySink::new());
    let engine = engine_with(transport.clone(), None, sink).await;

    engine
        .add_device(DEV1, DeviceKind::Bm6, None, Some(3600))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while transport.connect_count(DEV1) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first poll");

    engine.remove_device(DEV1).await.unwrap();
    // Let any in-flight cycle run out before sampling the counter.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let after = transport.connect_count(DEV1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.connect_count(DEV1), after);
    assert!(engine.get_device(DEV1).is_none());
    assert!(engine.latest_reading(DEV1).is_none());

    engine.shutdown().await;
}
