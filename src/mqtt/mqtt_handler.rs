//! Connection manager: one broker link per credential and endpoint.
//!
//! The manager owns the transport handle and is driven by the typed events
//! the transport emits. It never retries on its own; reconnecting after an
//! error or close is the transport's job, and a successful reconnect re-runs
//! the subscribe path.

use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectOptions, MqttConfig};
use super::message_manager::{ForwardedMessage, InboundMessage, PayloadError};
use super::state::{ConnectionState, ConnectionStatus, StateInput};
use super::topics::TopicSet;
use super::transport::{Transport, TransportError, TransportEvent, TransportHandle};
use crate::dedup::DedupCache;

/// Failures contained within a connection. None of them stop the process;
/// they end up in the status snapshot and the log.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No credential configured")]
    MissingCredential,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transport reported: {0}")]
    TransportFailed(String),

    #[error("Connection was closed")]
    TransportClosed,

    #[error(transparent)]
    MalformedPayload(#[from] PayloadError),
}

pub struct Connection {
    id: String,
    credential: String,
    endpoint: String,
    client_id: Option<String>,
    topics: Option<TopicSet>,
    config: MqttConfig,
    transport: Arc<dyn Transport>,
    handle: Option<Box<dyn TransportHandle>>,
    cache: Arc<DedupCache>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    downstream: mpsc::Sender<ForwardedMessage>,
    status: watch::Sender<ConnectionStatus>,
}

impl Connection {
    /// `id` is the instance identifier: it names the connection in logs,
    /// becomes part of the client identity and namespaces the debounce cache.
    pub fn new(
        id: impl Into<String>,
        config: MqttConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<DedupCache>,
        downstream: mpsc::Sender<ForwardedMessage>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status, _) = watch::channel(ConnectionStatus::default());

        Self {
            id: id.into(),
            credential: String::new(),
            endpoint: String::new(),
            client_id: None,
            topics: None,
            config,
            transport,
            handle: None,
            cache,
            events_tx,
            events_rx,
            downstream,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn has_transport(&self) -> bool {
        self.handle.is_some()
    }

    /// Opens the broker link.
    ///
    /// An empty credential leaves the connection `Unauthorized` without
    /// touching the transport. Otherwise the state becomes `Connecting`;
    /// while a transport handle exists no second link is opened.
    pub fn connect(&mut self, credential: &str, endpoint: &str) -> Result<(), ConnectionError> {
        if credential.is_empty() {
            warn!("[{}] No credential configured, not connecting", self.id);
            self.apply(StateInput::MissingCredential);
            return Err(ConnectionError::MissingCredential);
        }

        self.apply(StateInput::ConnectRequested);

        if self.handle.is_some() {
            debug!("[{}] Transport already open, reusing it", self.id);
            return Ok(());
        }

        self.credential = credential.to_string();
        self.endpoint = endpoint.to_string();

        let options = ConnectOptions::for_credential(&self.config, credential, &self.id);
        info!("[{}] Connecting {}", self.id, options.client_id);
        self.client_id = Some(options.client_id.clone());

        match self
            .transport
            .connect(endpoint, &options, self.events_tx.clone())
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("[{}] Something went wrong: {}", self.id, e);
                self.fail(StateInput::TransportError, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Releases the transport handle. A no-op without one, so calling it
    /// twice is safe.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            info!("[{}] Disconnecting", self.id);
            handle.end();
        }
    }

    /// Applies one transport event and returns the message to forward, if
    /// any.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<ForwardedMessage> {
        match event {
            TransportEvent::Connected => {
                self.on_connected();
                None
            }
            TransportEvent::Error(reason) => {
                error!("[{}] Something went wrong: {}", self.id, reason);
                let err = ConnectionError::TransportFailed(reason);
                self.fail(StateInput::TransportError, err.to_string());
                None
            }
            TransportEvent::Closed => {
                warn!("[{}] Connection was closed", self.id);
                self.fail(
                    StateInput::TransportClosed,
                    ConnectionError::TransportClosed.to_string(),
                );
                None
            }
            TransportEvent::Message { topic, payload } => self.on_message(topic, &payload),
        }
    }

    /// Processes transport events in arrival order until `cancel` fires or
    /// the downstream consumer goes away, then closes the transport.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events_rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            if let Some(message) = self.handle_event(event) {
                if self.downstream.send(message).await.is_err() {
                    warn!("[{}] Downstream consumer is gone, stopping", self.id);
                    break;
                }
            }
        }
        self.close();
    }

    fn on_connected(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            debug!("[{}] Ignoring connect event without a transport", self.id);
            return;
        };
        let client_id = self.client_id.as_deref().unwrap_or_default();

        // Re-derived on every connect.
        let topics = TopicSet::derive(&self.credential, &self.endpoint);
        let mut failure = None;
        for (kind, topic) in topics.iter() {
            match handle.subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => info!(
                    "[{}] Ready to go! ({} subscribed to {} events)",
                    self.id, client_id, kind
                ),
                Err(e) => {
                    error!(
                        "[{}] {} failed to subscribe to {} events: {}",
                        self.id, client_id, kind, e
                    );
                    failure = Some(e);
                }
            }
        }

        self.topics = Some(topics);
        match failure {
            None => self.apply(StateInput::TopicsSubscribed),
            Some(e) => self.fail(StateInput::SubscribeFailed, e.to_string()),
        }
    }

    fn on_message(&mut self, topic: String, payload: &[u8]) -> Option<ForwardedMessage> {
        self.status.send_modify(|status| {
            status.messages_received += 1;
            status.last_activity = Some(chrono::Local::now());
        });

        let message = match InboundMessage::decode(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                let err = ConnectionError::from(e);
                warn!("[{}] Dropping message: {}", self.id, err);
                self.status.send_modify(|status| {
                    status.malformed_dropped += 1;
                    status.last_error = Some(err.to_string());
                });
                return None;
            }
        };

        let event_id = message.event_id();
        let message_id = message.message_id();
        let kind = self
            .topics
            .as_ref()
            .and_then(|topics| topics.kind_of(message.topic()))
            .map(|kind| kind.as_str())
            .unwrap_or("unknown");
        info!(
            "[{}] Received {} message with messageId: {:?} and eventId: {:?}",
            self.id, kind, message_id, event_id
        );

        if !self
            .cache
            .should_forward(&self.id, event_id.as_deref(), message_id.as_deref())
        {
            info!(
                "[{}] eventId: {:?} exists in debounce cache - dropping message",
                self.id, event_id
            );
            self.status.send_modify(|status| status.duplicates_dropped += 1);
            return None;
        }

        if event_id.is_some() {
            debug!(
                "[{}] eventId: {:?} cached, processing message",
                self.id, event_id
            );
        }
        self.status.send_modify(|status| status.messages_forwarded += 1);
        Some(message.into_forwarded())
    }

    fn apply(&mut self, input: StateInput) {
        let from = self.state();
        let to = from.next(input);
        if from != to {
            info!("[{}] {:?} -> {:?} ({})", self.id, from, to, to.status());
        }
        self.status.send_modify(|status| status.state = to);
    }

    fn fail(&mut self, input: StateInput, reason: String) {
        self.apply(input);
        self.status.send_modify(|status| status.last_error = Some(reason));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
