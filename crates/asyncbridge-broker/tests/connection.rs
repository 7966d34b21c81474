//! Connection lifecycle and dispatch tests against the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::Instant;

use asyncbridge_broker::{
    BrokerClient, BrokerError, BrokerLink, ConnectOptions, ConnectionManager,
    ConnectionSettings, ConnectionState, DispatchError, Dispatcher, MemoryBroker, OutputMessage,
    StateChange, Status, StatusReporter, SubscribeOutcome,
};
use asyncbridge_spec::{parse_document, resolve_selection, Binding, Selection};

const HOME_API: &str = r#"
asyncapi: "3.0.0"
info:
  title: Home
  version: "1"
defaultContentType: application/json
servers:
  local:
    host: localhost:1883
    protocol: mqtt
channels:
  sensor:
    address: home/sensor
    messages:
      reading:
        payload:
          type: object
          properties:
            temp:
              type: integer
  plain:
    address: home/plain
    messages:
      note:
        contentType: text/plain
        payload:
          type: string
  light:
    address: home/light
    messages:
      toggle:
        payload:
          type: object
          properties:
            on:
              type: string
operations:
  onReading:
    action: receive
    channel:
      $ref: '#/channels/sensor'
  onNote:
    action: receive
    channel:
      $ref: '#/channels/plain'
  toggleLight:
    action: send
    channel:
      $ref: '#/channels/light'
"#;

fn binding(channel: &str, operation: &str) -> Binding {
    let doc = parse_document(HOME_API.as_bytes()).unwrap();
    let selection = Selection {
        server_url: Some("memory://local".to_string()),
        ..Selection::new(channel, operation)
    };
    resolve_selection(&doc, &selection).unwrap()
}

fn dispatcher(
    binding: Binding,
    broker: &MemoryBroker,
) -> (Dispatcher, mpsc::UnboundedReceiver<OutputMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(
        binding,
        Arc::new(broker.clone()),
        ConnectionSettings::default(),
        tx,
    );
    (dispatcher, rx)
}

async fn wait_until(rx: &mut watch::Receiver<Status>, condition: impl FnMut(&Status) -> bool) {
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(condition))
        .await
        .expect("condition not reached in time")
        .expect("status channel closed");
}

fn drain(rx: &mut broadcast::Receiver<StateChange>) -> Vec<(ConnectionState, ConnectionState)> {
    let mut seen = Vec::new();
    while let Ok(change) = rx.try_recv() {
        seen.push((change.from, change.to));
    }
    seen
}

fn spawn_manager(broker: &MemoryBroker, status: &StatusReporter) -> ConnectionManager {
    ConnectionManager::spawn(
        Arc::new(broker.clone()),
        "memory://local",
        "home/sensor",
        ConnectionSettings::default(),
        status.clone(),
        |_topic: String, _payload: Bytes| {},
    )
}

/// Holds every connect until the gate is opened, then hands off to the broker.
struct GatedClient {
    broker: MemoryBroker,
    gate: Arc<Notify>,
}

#[async_trait]
impl BrokerClient for GatedClient {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<BrokerLink, BrokerError> {
        self.gate.notified().await;
        self.broker.connect(url, options).await
    }
}

fn spawn_gated(
    broker: &MemoryBroker,
    gate: &Arc<Notify>,
    status: &StatusReporter,
) -> ConnectionManager {
    let client = GatedClient {
        broker: broker.clone(),
        gate: Arc::clone(gate),
    };
    ConnectionManager::spawn(
        Arc::new(client),
        "memory://local",
        "home/sensor",
        ConnectionSettings::default(),
        status.clone(),
        |_topic: String, _payload: Bytes| {},
    )
}

// =============================================================================
// Connection state machine
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconnects_after_three_failures_on_a_fixed_period() {
    use ConnectionState::*;

    let broker = MemoryBroker::new();
    broker.fail_next_connects(3);
    let status = StatusReporter::new("test");
    let mut transitions = status.transitions();
    let mut watch = status.watch();
    let manager = spawn_manager(&broker, &status);

    let started = Instant::now();
    manager.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == Connected).await;
    let elapsed = started.elapsed();

    assert_eq!(
        drain(&mut transitions),
        vec![
            (Idle, Connecting),
            (Connecting, Error),
            (Error, Connecting),
            (Connecting, Error),
            (Error, Connecting),
            (Connecting, Error),
            (Error, Connecting),
            (Connecting, Connected),
        ]
    );
    assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(6500), "elapsed {:?}", elapsed);

    let snapshot = status.snapshot();
    assert_eq!(snapshot.reconnect_attempts, 3);
    assert!(snapshot
        .last_error
        .as_deref()
        .unwrap()
        .contains("connection refused"));
    assert_eq!(broker.stats().connect_attempts, 4);

    manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_during_connecting_cancels_the_attempt() {
    let broker = MemoryBroker::new();
    broker.stall_connects(true);
    let status = StatusReporter::new("test");
    let mut transitions = status.transitions();
    let mut watch = status.watch();
    let manager = spawn_manager(&broker, &status);

    manager.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connecting).await;
    manager.teardown().await;

    broker.stall_connects(false);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        drain(&mut transitions),
        vec![
            (ConnectionState::Idle, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Closed),
        ]
    );
    assert_eq!(status.state(), ConnectionState::Closed);
    assert_eq!(broker.stats().connects, 0);
    assert_eq!(manager.connect().await, Err(DispatchError::Closed));
}

#[tokio::test(start_paused = true)]
async fn teardown_wins_over_a_handshake_finishing_in_the_same_tick() {
    let broker = MemoryBroker::new();
    let gate = Arc::new(Notify::new());
    let status = StatusReporter::new("test");
    let mut transitions = status.transitions();
    let mut watch = status.watch();
    let manager = spawn_gated(&broker, &gate, &status);

    manager.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connecting).await;

    gate.notify_one();
    manager.teardown().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        drain(&mut transitions),
        vec![
            (ConnectionState::Idle, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Closed),
        ]
    );
    assert_eq!(status.state(), ConnectionState::Closed);
    assert_eq!(broker.sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_teardown_never_leaves_a_live_session() {
    for _ in 0..50 {
        let broker = MemoryBroker::new();
        let gate = Arc::new(Notify::new());
        let status = StatusReporter::new("test");
        let mut transitions = status.transitions();
        let mut watch = status.watch();
        let manager = spawn_gated(&broker, &gate, &status);

        manager.connect().await.unwrap();
        wait_until(&mut watch, |s| s.state == ConnectionState::Connecting).await;

        gate.notify_one();
        manager.teardown().await;

        let seen = drain(&mut transitions);
        assert_eq!(seen.last().map(|(_, to)| *to), Some(ConnectionState::Closed));
        assert_eq!(
            seen.iter()
                .filter(|(_, to)| *to == ConnectionState::Closed)
                .count(),
            1
        );
        assert!(seen.iter().all(|(_, to)| *to != ConnectionState::Error));
        assert_eq!(status.state(), ConnectionState::Closed);
        assert_eq!(broker.sessions(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let broker = MemoryBroker::new();
    let status = StatusReporter::new("test");
    let mut watch = status.watch();
    let manager = spawn_manager(&broker, &status);

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;
    manager.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(broker.stats().connect_attempts, 1);
    manager.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn broker_close_leads_to_disconnected_then_reconnect() {
    let broker = MemoryBroker::new();
    let status = StatusReporter::new("test");
    let mut transitions = status.transitions();
    let mut watch = status.watch();
    let manager = spawn_manager(&broker, &status);

    manager.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;

    broker.disconnect_all();
    wait_until(&mut watch, |s| {
        s.state == ConnectionState::Connected && s.reconnect_attempts == 1
    })
    .await;

    let seen = drain(&mut transitions);
    assert!(seen.contains(&(ConnectionState::Connected, ConnectionState::Disconnected)));
    assert!(seen.contains(&(ConnectionState::Disconnected, ConnectionState::Connecting)));
    assert_eq!(broker.stats().connects, 2);
    manager.teardown().await;
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn ensure_subscribed_twice_sends_one_request() {
    let broker = MemoryBroker::new();
    let (dispatcher, _rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;

    assert_eq!(
        dispatcher.ensure_subscribed().await,
        Ok(SubscribeOutcome::Subscribed)
    );
    assert_eq!(
        dispatcher.ensure_subscribed().await,
        Ok(SubscribeOutcome::AlreadySubscribed)
    );
    assert_eq!(broker.stats().subscribes, 1);
    assert!(dispatcher.status().subscribed);
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_requested_offline_is_issued_after_handshake() {
    let broker = MemoryBroker::new();
    let (dispatcher, _rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    assert_eq!(
        dispatcher.ensure_subscribed().await,
        Ok(SubscribeOutcome::Pending)
    );
    assert!(!dispatcher.status().subscribed);

    dispatcher.connect().await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;
    assert_eq!(
        dispatcher.ensure_subscribed().await,
        Ok(SubscribeOutcome::AlreadySubscribed)
    );
    assert_eq!(broker.stats().subscribes, 1);
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_is_restored_once_after_error() {
    let broker = MemoryBroker::new();
    let (dispatcher, _rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;
    dispatcher.ensure_subscribed().await.unwrap();

    broker.inject_error("connection reset");
    wait_until(&mut watch, |s| {
        s.state == ConnectionState::Connected && s.subscribed && s.reconnect_attempts == 1
    })
    .await;

    assert_eq!(broker.stats().subscribes, 2);
    assert_eq!(
        dispatcher.status().last_error.as_deref(),
        Some("connection reset")
    );
    dispatcher.teardown().await;
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test(start_paused = true)]
async fn publish_while_offline_never_reaches_the_broker() {
    let broker = MemoryBroker::new();
    let (dispatcher, _rx) = dispatcher(binding("home/light", "toggleLight"), &broker);

    let result = dispatcher.publish(&json!({"on": "yes"})).await;
    assert_eq!(result, Err(DispatchError::NotConnected));

    broker.stall_connects(true);
    dispatcher.connect().await.unwrap();
    let result = dispatcher.publish(&json!({"on": "yes"})).await;
    assert_eq!(result, Err(DispatchError::NotConnected));

    assert_eq!(broker.stats().publishes, 0);
    assert!(broker.published().is_empty());
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn publish_encodes_json_and_surfaces_failures() {
    let broker = MemoryBroker::new();
    let (dispatcher, _rx) = dispatcher(binding("home/light", "toggleLight"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;

    broker.fail_publishes(true);
    let result = dispatcher.publish(&json!({"on": "yes"})).await;
    assert!(matches!(result, Err(DispatchError::PublishFailed(_))));
    assert_eq!(dispatcher.status().state, ConnectionState::Connected);
    assert!(dispatcher.status().last_error.is_some());

    broker.fail_publishes(false);
    dispatcher.publish(&json!({"on": "yes"})).await.unwrap();
    assert_eq!(
        broker.published(),
        vec![(
            "home/light".to_string(),
            Bytes::from_static(br#"{"on":"yes"}"#)
        )]
    );
    assert_eq!(dispatcher.status().messages_published, 1);
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_publish_times_out_and_keeps_the_connection() {
    let broker = MemoryBroker::new();
    let (dispatcher, _rx) = dispatcher(binding("home/light", "toggleLight"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;

    broker.stall_publishes(true);
    let started = Instant::now();
    let result = dispatcher.publish(&json!({"on": "yes"})).await;
    assert!(
        matches!(&result, Err(DispatchError::PublishFailed(msg)) if msg.contains("timed out")),
        "unexpected result: {:?}",
        result
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(5500), "elapsed {:?}", elapsed);
    assert_eq!(dispatcher.status().state, ConnectionState::Connected);
    assert_eq!(dispatcher.status().messages_published, 0);

    broker.stall_publishes(false);
    dispatcher.publish(&json!({"on": "no"})).await.unwrap();
    assert_eq!(dispatcher.status().messages_published, 1);
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn received_message_is_emitted_exactly_once() {
    let broker = MemoryBroker::new();
    let (dispatcher, mut rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.handle_input(&json!(null)).await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;

    assert_eq!(broker.deliver("home/sensor", r#""42""#), 1);
    let message = rx.recv().await.unwrap();
    assert_eq!(
        message,
        OutputMessage {
            payload: json!("42"),
            topic: "home/sensor".to_string(),
        }
    );

    dispatcher.teardown().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn text_payloads_are_emitted_as_strings() {
    let broker = MemoryBroker::new();
    let (dispatcher, mut rx) = dispatcher(binding("home/plain", "onNote"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.handle_input(&json!(null)).await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;

    broker.deliver("home/plain", "42");
    let message = rx.recv().await.unwrap();
    assert_eq!(message.payload, json!("42"));
    assert_eq!(dispatcher.status().decode_fallbacks, 0);
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn delivery_order_is_preserved() {
    let broker = MemoryBroker::new();
    let (dispatcher, mut rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.handle_input(&json!(null)).await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;

    for temp in 0..5 {
        broker.deliver("home/sensor", format!(r#"{{"temp": {}}}"#, temp));
    }
    for temp in 0..5 {
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload, json!({ "temp": temp }));
    }
    assert_eq!(dispatcher.status().messages_received, 5);
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_inbound_payload_is_dropped_and_recorded() {
    let broker = MemoryBroker::new();
    let (dispatcher, mut rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.handle_input(&json!(null)).await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;

    broker.deliver("home/sensor", r#"{"temp": "hot"}"#);
    broker.deliver("home/sensor", r#"{"temp": 42}"#);

    let message = rx.recv().await.unwrap();
    assert_eq!(message.payload, json!({"temp": 42}));
    let status = dispatcher.status();
    assert_eq!(status.messages_received, 2);
    assert!(status.last_error.unwrap().contains("dropped"));
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_falls_back_to_text() {
    let broker = MemoryBroker::new();
    let (dispatcher, mut rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.handle_input(&json!(null)).await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;

    broker.deliver("home/sensor", "not json");
    let message = rx.recv().await.unwrap();
    assert_eq!(message.payload, json!("not json"));

    let status = dispatcher.status();
    assert_eq!(status.decode_fallbacks, 1);
    assert!(status.last_error.unwrap().contains("forwarded as text"));
    dispatcher.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn send_with_subscribe_before_publish_loops_back() {
    let broker = MemoryBroker::new();
    let mut b = binding("home/light", "toggleLight");
    b.subscribe_before_publish = true;
    let (dispatcher, mut rx) = dispatcher(b, &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.connect().await.unwrap();
    wait_until(&mut watch, |s| s.state == ConnectionState::Connected).await;

    dispatcher.handle_input(&json!({"on": "yes"})).await.unwrap();
    dispatcher.handle_input(&json!({"on": "no"})).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().payload, json!({"on": "yes"}));
    assert_eq!(rx.recv().await.unwrap().payload, json!({"on": "no"}));
    let stats = broker.stats();
    assert_eq!(stats.subscribes, 1);
    assert_eq!(stats.publishes, 2);
    dispatcher.teardown().await;
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn teardown_unsubscribes_closes_and_freezes_status() {
    let broker = MemoryBroker::new();
    let (dispatcher, mut rx) = dispatcher(binding("home/sensor", "onReading"), &broker);
    let mut watch = dispatcher.watch_status();

    dispatcher.handle_input(&json!(null)).await.unwrap();
    wait_until(&mut watch, |s| s.subscribed).await;

    dispatcher.teardown().await;
    dispatcher.teardown().await;

    let stats = broker.stats();
    assert_eq!(stats.unsubscribes, 1);
    assert_eq!(stats.closes, 1);
    assert_eq!(broker.sessions(), 0);

    let status = dispatcher.status();
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(!status.subscribed);

    assert_eq!(broker.deliver("home/sensor", r#"{"temp": 1}"#), 0);
    assert!(rx.try_recv().is_err());
    assert_eq!(
        dispatcher.ensure_subscribed().await,
        Err(DispatchError::Closed)
    );
}
