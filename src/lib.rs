//! Forwards BACnet change events from an MQTT broker to a downstream
//! consumer, dropping redelivered events inside a retention window.

pub mod config;
pub mod dedup;
pub mod mqtt;
pub mod node;

pub use config::{Config, ConfigError, ConnectionConfig};
pub use dedup::{DedupCache, DedupConfig, DedupKey, ExpiryListener};
pub use mqtt::message_manager::{ForwardedMessage, InboundMessage};
pub use mqtt::mqtt_handler::{Connection, ConnectionError};
pub use mqtt::state::{ConnectionState, ConnectionStatus, NodeStatus};
pub use mqtt::transport::{RumqttTransport, Transport, TransportEvent, TransportHandle};
pub use node::EventsNode;
