//! Connection Manager Tests

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use pretty_assertions::assert_eq;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::{ConnectOptions, MqttConfig};
use super::message_manager::ForwardedMessage;
use super::mqtt_handler::{Connection, ConnectionError};
use super::state::{ConnectionState, NodeStatus};
use super::topics::DEV_ENDPOINT;
use super::transport::{Transport, TransportError, TransportEvent, TransportHandle};
use crate::dedup::{DedupCache, DedupConfig};

// =============================================================================
// Recording transport
// =============================================================================

#[derive(Default)]
struct Recorded {
    connects: Vec<(String, ConnectOptions)>,
    senders: Vec<mpsc::Sender<TransportEvent>>,
    subscriptions: Vec<(String, QoS)>,
    ends: usize,
    fail_subscribe: bool,
}

#[derive(Clone, Default)]
struct MockTransport {
    recorded: Arc<Mutex<Recorded>>,
}

impl MockTransport {
    fn failing_subscribe() -> Self {
        let transport = Self::default();
        transport.recorded.lock().unwrap().fail_subscribe = true;
        transport
    }

    fn connects(&self) -> usize {
        self.recorded.lock().unwrap().connects.len()
    }

    fn topics(&self) -> Vec<String> {
        let recorded = self.recorded.lock().unwrap();
        recorded.subscriptions.iter().map(|(t, _)| t.clone()).collect()
    }

    fn ends(&self) -> usize {
        self.recorded.lock().unwrap().ends
    }

    fn sender(&self, index: usize) -> mpsc::Sender<TransportEvent> {
        self.recorded.lock().unwrap().senders[index].clone()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded
            .connects
            .push((endpoint.to_string(), options.clone()));
        recorded.senders.push(events);
        Ok(Box::new(MockHandle {
            recorded: Arc::clone(&self.recorded),
        }))
    }
}

struct MockHandle {
    recorded: Arc<Mutex<Recorded>>,
}

impl TransportHandle for MockHandle {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let mut recorded = self.recorded.lock().unwrap();
        if recorded.fail_subscribe {
            return Err(TransportError::Request("queue full".to_string()));
        }
        recorded.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn end(&mut self) {
        self.recorded.lock().unwrap().ends += 1;
    }
}

struct RefusingTransport;

impl Transport for RefusingTransport {
    fn connect(
        &self,
        endpoint: &str,
        _options: &ConnectOptions,
        _events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        Err(TransportError::InvalidEndpoint(endpoint.to_string()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn shared_cache() -> Arc<DedupCache> {
    Arc::new(DedupCache::new(&DedupConfig::default()))
}

fn connection(
    id: &str,
    transport: &MockTransport,
    cache: &Arc<DedupCache>,
) -> (Connection, mpsc::Receiver<ForwardedMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let connection = Connection::new(
        id,
        MqttConfig::default(),
        Arc::new(transport.clone()),
        Arc::clone(cache),
        tx,
    );
    (connection, rx)
}

fn message(topic: &str, payload: &str) -> TransportEvent {
    TransportEvent::Message {
        topic: topic.to_string(),
        payload: Bytes::from(payload.to_string()),
    }
}

fn event(event_id: &str, message_id: &str) -> TransportEvent {
    message(
        "events/out/bacnet/update/abc123",
        &format!(r#"{{"eventId":"{event_id}","messageId":"{message_id}"}}"#),
    )
}

// =============================================================================
// Connect / close lifecycle
// =============================================================================

#[test]
fn test_empty_credential_is_unauthorized() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    let result = conn.connect("", "mqtt://broker");

    assert!(matches!(result, Err(ConnectionError::MissingCredential)));
    assert_eq!(conn.state(), ConnectionState::Unauthorized);
    assert_eq!(conn.status().status(), NodeStatus::Unauthorized);
    assert_eq!(transport.connects(), 0);
    assert!(!conn.has_transport());
}

#[test]
fn test_connect_opens_one_transport() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.connect("abc123", "mqtt://broker").unwrap();

    assert_eq!(transport.connects(), 1);
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(conn.status().status(), NodeStatus::Subscribing);
}

#[test]
fn test_connect_with_open_transport_reenters_connecting() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.handle_event(TransportEvent::Connected);
    assert_eq!(conn.state(), ConnectionState::Subscribed);

    conn.connect("abc123", "mqtt://broker").unwrap();

    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(conn.status().status(), NodeStatus::Subscribing);
    assert_eq!(transport.connects(), 1);
    assert!(conn.has_transport());
}

#[test]
fn test_empty_credential_with_open_transport_keeps_handle() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.handle_event(TransportEvent::Connected);

    let result = conn.connect("", "mqtt://broker");

    assert!(matches!(result, Err(ConnectionError::MissingCredential)));
    assert_eq!(conn.state(), ConnectionState::Unauthorized);
    assert_eq!(transport.connects(), 1);
    assert!(conn.has_transport());

    conn.close();
    assert_eq!(transport.ends(), 1);
}

#[test]
fn test_connect_options() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abcdefghijk", "wss://mqtt.daizy.io").unwrap();

    let recorded = transport.recorded.lock().unwrap();
    let (endpoint, options) = &recorded.connects[0];
    assert_eq!(endpoint, "wss://mqtt.daizy.io");
    assert_eq!(options.identity, "abcdefghijk");
    assert_eq!(options.secret, "abcdefghijk");
    assert_eq!(options.client_id, "bacnet-events-abcdefgh-n1");
    assert!(!options.clean_session);
    assert_eq!(conn.client_id(), Some("bacnet-events-abcdefgh-n1"));
}

#[test]
fn test_close_without_transport_is_noop() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.close();
    conn.close();

    assert_eq!(transport.ends(), 0);
}

#[test]
fn test_close_ends_transport_once() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.close();
    conn.close();
    drop(conn);

    assert_eq!(transport.ends(), 1);
}

#[test]
fn test_connect_after_close_opens_new_transport() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.close();
    conn.connect("abc123", "mqtt://broker").unwrap();

    assert_eq!(transport.connects(), 2);
    assert!(conn.has_transport());
}

#[test]
fn test_transport_refusal_enters_error() {
    let (tx, _rx) = mpsc::channel(1);
    let mut conn = Connection::new(
        "n1",
        MqttConfig::default(),
        Arc::new(RefusingTransport),
        shared_cache(),
        tx,
    );

    let result = conn.connect("abc123", "bogus://");

    assert!(matches!(result, Err(ConnectionError::Transport(_))));
    assert_eq!(conn.state(), ConnectionState::Error);
    assert!(conn.status().last_error.is_some());
    assert!(!conn.has_transport());
}

// =============================================================================
// Subscribe path
// =============================================================================

#[test]
fn test_connected_subscribes_dev_topics() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", DEV_ENDPOINT).unwrap();
    assert_eq!(conn.handle_event(TransportEvent::Connected), None);

    assert_eq!(
        transport.topics(),
        vec![
            "events-dev/out/bacnet/create/abc123",
            "events-dev/out/bacnet/update/abc123",
            "events-dev/out/bacnet/delete/abc123",
        ]
    );
    let recorded = transport.recorded.lock().unwrap();
    assert!(recorded
        .subscriptions
        .iter()
        .all(|(_, qos)| *qos == QoS::AtLeastOnce));
    assert_eq!(conn.state(), ConnectionState::Subscribed);
}

#[test]
fn test_connected_subscribes_production_topics() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    conn.connect("abc123", "wss://mqtt.daizy.io").unwrap();
    conn.handle_event(TransportEvent::Connected);

    assert_eq!(
        transport.topics(),
        vec![
            "events/out/bacnet/create/abc123",
            "events/out/bacnet/update/abc123",
            "events/out/bacnet/delete/abc123",
        ]
    );
}

#[test]
fn test_error_and_close_enter_error_state() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());
    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.handle_event(TransportEvent::Connected);

    conn.handle_event(TransportEvent::Error("not authorized".to_string()));
    assert_eq!(conn.state(), ConnectionState::Error);
    assert_eq!(conn.status().status(), NodeStatus::Error);
    assert!(conn
        .status()
        .last_error
        .unwrap()
        .contains("not authorized"));

    conn.handle_event(TransportEvent::Connected);
    assert_eq!(conn.state(), ConnectionState::Subscribed);

    conn.handle_event(TransportEvent::Closed);
    assert_eq!(conn.state(), ConnectionState::Error);
    // No unwind: the handle stays for the transport to reconnect.
    assert!(conn.has_transport());
    assert_eq!(transport.ends(), 0);
}

#[test]
fn test_reconnect_subscribes_again() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());
    conn.connect("abc123", "mqtt://broker").unwrap();

    conn.handle_event(TransportEvent::Connected);
    conn.handle_event(TransportEvent::Closed);
    conn.handle_event(TransportEvent::Connected);

    assert_eq!(transport.topics().len(), 6);
    assert_eq!(transport.connects(), 1);
}

#[test]
fn test_subscribe_failure_enters_error() {
    let transport = MockTransport::failing_subscribe();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());
    conn.connect("abc123", "mqtt://broker").unwrap();

    conn.handle_event(TransportEvent::Connected);

    assert_eq!(conn.state(), ConnectionState::Error);
    assert!(conn.status().last_error.unwrap().contains("queue full"));
}

#[test]
fn test_connected_without_transport_is_ignored() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());
    conn.connect("", "mqtt://broker").unwrap_err();

    conn.handle_event(TransportEvent::Connected);

    assert!(transport.topics().is_empty());
    assert_eq!(conn.state(), ConnectionState::Unauthorized);
}

// =============================================================================
// Message path
// =============================================================================

#[test]
fn test_duplicate_event_is_dropped() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());
    conn.connect("abc123", "mqtt://broker").unwrap();
    conn.handle_event(TransportEvent::Connected);

    let first = conn.handle_event(event("E1", "M1")).unwrap();
    assert_eq!(first.topic, "events/out/bacnet/update/abc123");
    assert_eq!(first.payload["messageId"], "M1");

    assert_eq!(conn.handle_event(event("E1", "M2")), None);
    assert!(conn.handle_event(event("E2", "M3")).is_some());

    let status = conn.status();
    assert_eq!(status.messages_received, 3);
    assert_eq!(status.messages_forwarded, 2);
    assert_eq!(status.duplicates_dropped, 1);
    assert!(status.last_activity.is_some());
}

#[test]
fn test_event_forwarded_again_after_sweep() {
    let transport = MockTransport::default();
    let cache = shared_cache();
    let (mut conn, _rx) = connection("n1", &transport, &cache);

    assert!(conn.handle_event(event("E1", "M1")).is_some());
    assert!(conn.handle_event(event("E1", "M2")).is_none());

    let later = tokio::time::Instant::now() + cache.ttl();
    assert_eq!(cache.sweep_at(later), 1);

    assert!(conn.handle_event(event("E1", "M3")).is_some());
}

#[test]
fn test_missing_event_id_is_forwarded() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    for payload in [r#"{"messageId":"M1"}"#, r#"{"messageId":"M1"}"#, r#"{}"#] {
        let forwarded = conn.handle_event(message("t", payload));
        assert!(forwarded.is_some());
    }
    assert_eq!(conn.status().duplicates_dropped, 0);
}

#[test]
fn test_malformed_payload_is_dropped_and_processing_continues() {
    let transport = MockTransport::default();
    let (mut conn, _rx) = connection("n1", &transport, &shared_cache());

    assert_eq!(conn.handle_event(message("t", "{not json")), None);
    assert!(conn.handle_event(event("E1", "M1")).is_some());

    let status = conn.status();
    assert_eq!(status.malformed_dropped, 1);
    assert_eq!(status.messages_forwarded, 1);
    assert!(status.last_error.unwrap().contains("Malformed"));
}

#[test]
fn test_connections_do_not_share_event_ids() {
    let transport = MockTransport::default();
    let cache = shared_cache();
    let (mut a, _rx_a) = connection("node-a", &transport, &cache);
    let (mut b, _rx_b) = connection("node-b", &transport, &cache);

    assert!(a.handle_event(event("E1", "M1")).is_some());
    assert!(b.handle_event(event("E1", "M1")).is_some());
    assert!(a.handle_event(event("E1", "M2")).is_none());
    assert!(b.handle_event(event("E1", "M2")).is_none());
}

// =============================================================================
// Run loop
// =============================================================================

#[tokio::test]
async fn test_run_forwards_in_arrival_order_and_closes_on_cancel() {
    let transport = MockTransport::default();
    let (mut conn, mut rx) = connection("n1", &transport, &shared_cache());
    conn.connect("abc123", "mqtt://broker").unwrap();
    let mut status = conn.subscribe_status();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(conn.run(cancel.clone()));

    let events = transport.sender(0);
    events.send(TransportEvent::Connected).await.unwrap();
    events.send(event("E1", "M1")).await.unwrap();
    events.send(event("E1", "M2")).await.unwrap();
    events.send(event("E2", "M3")).await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.payload["messageId"], "M1");
    assert_eq!(second.payload["messageId"], "M3");
    assert_eq!(
        status.borrow_and_update().state,
        ConnectionState::Subscribed
    );

    cancel.cancel();
    task.await.unwrap();

    assert_eq!(transport.ends(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_run_stops_when_downstream_is_gone() {
    let transport = MockTransport::default();
    let (mut conn, rx) = connection("n1", &transport, &shared_cache());
    conn.connect("abc123", "mqtt://broker").unwrap();
    drop(rx);

    let task = tokio::spawn(conn.run(CancellationToken::new()));
    transport
        .sender(0)
        .send(event("E1", "M1"))
        .await
        .unwrap();

    task.await.unwrap();
    assert_eq!(transport.ends(), 1);
}
