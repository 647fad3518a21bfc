//! Broker transport capability and its `rumqttc` implementation.
//!
//! The connection manager only sees the [`Transport`] / [`TransportHandle`]
//! traits and a stream of [`TransportEvent`]s. [`RumqttTransport`] drives a
//! `rumqttc` event loop in a pump task and translates what it polls into
//! those events. Reconnecting is the pump's job: after an error it waits the
//! configured reconnect period and polls again, which makes `rumqttc` open
//! a fresh link.

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    Transport as MqttTransport,
};
use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{ConnectOptions, MIN_KEEP_ALIVE};

/// How long a terminating pump keeps polling to flush DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Keep-alive {0:?} is shorter than one second")]
    KeepAlive(Duration),

    #[error("Request rejected: {0}")]
    Request(String),
}

/// Events emitted by a transport handle, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    Error(String),
    Closed,
    Message { topic: String, payload: Bytes },
}

/// Opens links to a broker.
pub trait Transport: Send + Sync {
    /// Opens a link. Events for the link are delivered on `events` until the
    /// returned handle is ended.
    fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// One live link to a broker.
pub trait TransportHandle: Send {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Graceful termination. Calling it more than once has no further effect.
    fn end(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    fn parse(raw: &str) -> Result<Self, TransportError> {
        match raw.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(Scheme::Tcp),
            "mqtts" | "ssl" | "tls" => Ok(Scheme::Tls),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            _ => Err(TransportError::UnsupportedScheme(raw.to_string())),
        }
    }
}

/// Broker address split into the parts `rumqttc` needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request path for websocket endpoints, `/` when none was given
    pub path: String,
}

impl BrokerEndpoint {
    /// Accepts `scheme://host[:port][/path]`; a bare `host[:port]` means
    /// plain TCP.
    pub fn parse(endpoint: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(endpoint.to_string());

        let (scheme, rest) = match endpoint.split_once("://") {
            Some((scheme, rest)) => (Scheme::parse(scheme)?, rest),
            None => (Scheme::Tcp, endpoint),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// The address string passed to `MqttOptions`. Websocket transports
    /// expect the full URL there.
    pub fn broker_addr(&self) -> String {
        match self.scheme {
            Scheme::Tcp | Scheme::Tls => self.host.clone(),
            Scheme::Ws => format!("ws://{}:{}{}", self.host, self.port, self.path),
            Scheme::Wss => format!("wss://{}:{}{}", self.host, self.port, self.path),
        }
    }

    fn mqtt_transport(&self) -> MqttTransport {
        match self.scheme {
            Scheme::Tcp => MqttTransport::Tcp,
            Scheme::Tls => MqttTransport::tls_with_default_config(),
            Scheme::Ws => MqttTransport::Ws,
            Scheme::Wss => MqttTransport::wss_with_default_config(),
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "mqtt",
            Scheme::Tls => "mqtts",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// [`Transport`] backed by `rumqttc`. Must be used from within a tokio
/// runtime, since every connect spawns the event loop pump.
#[derive(Clone, Copy, Debug, Default)]
pub struct RumqttTransport;

impl Transport for RumqttTransport {
    fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let endpoint = BrokerEndpoint::parse(endpoint)?;
        if options.keep_alive < MIN_KEEP_ALIVE {
            return Err(TransportError::KeepAlive(options.keep_alive));
        }

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), endpoint.broker_addr(), endpoint.port);
        mqtt_options
            .set_credentials(options.identity.clone(), options.secret.clone())
            .set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session)
            .set_transport(endpoint.mqtt_transport());

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.channel_capacity);
        let cancel = CancellationToken::new();

        info!("Opening MQTT link {} to {}", options.client_id, endpoint);
        tokio::spawn(pump(
            eventloop,
            events,
            options.reconnect_period,
            options.client_id.clone(),
            cancel.clone(),
        ));

        Ok(Box::new(RumqttHandle { client, cancel }))
    }
}

struct RumqttHandle {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl TransportHandle for RumqttHandle {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn end(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.cancel.cancel();
    }
}

/// Translates a polled event-loop result. `None` means nothing to report.
fn translate(polled: Result<Event, ConnectionError>) -> Option<TransportEvent> {
    match polled {
        Ok(Event::Incoming(Incoming::ConnAck(_))) => Some(TransportEvent::Connected),
        Ok(Event::Incoming(Incoming::Publish(publish))) => Some(TransportEvent::Message {
            topic: publish.topic,
            payload: publish.payload,
        }),
        Ok(Event::Incoming(Incoming::Disconnect)) => Some(TransportEvent::Closed),
        Ok(_) => None,
        Err(ConnectionError::Io(e))
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ) =>
        {
            Some(TransportEvent::Closed)
        }
        Err(e) => Some(TransportEvent::Error(e.to_string())),
    }
}

async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    reconnect_period: Duration,
    client_id: String,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => None,
            polled = eventloop.poll() => Some(polled),
        };
        let Some(polled) = polled else {
            flush_disconnect(&mut eventloop).await;
            break;
        };

        if matches!(polled, Ok(Event::Outgoing(Outgoing::Disconnect))) {
            break;
        }
        if matches!(polled, Err(ConnectionError::RequestsDone)) {
            debug!("{}: all request senders dropped", client_id);
            break;
        }

        let Some(event) = translate(polled) else {
            continue;
        };
        let failed = matches!(event, TransportEvent::Error(_) | TransportEvent::Closed);

        if events.send(event).await.is_err() {
            debug!("{}: event receiver dropped, stopping pump", client_id);
            break;
        }

        if failed {
            warn!(
                "{}: link down, reconnecting in {:?}",
                client_id, reconnect_period
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(reconnect_period) => {}
            }
        }
    }
    debug!("{}: pump stopped", client_id);
}

async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        debug!("DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
    }
}
