//! # MQTT Subscription Module
//!
//! Connects to the event broker, subscribes to the create/update/delete event
//! topics of a credential and hands every non-duplicate message to the
//! downstream consumer.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Transport settings and connect options
//! ├── message_manager.rs  - Inbound payload decoding and the forwarded message
//! ├── mqtt_handler.rs     - Connection manager driven by transport events
//! ├── state.rs            - Connection state machine and status surface
//! ├── topics.rs           - Topic derivation from credential and endpoint
//! └── transport.rs        - Transport capability and its rumqttc implementation
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! rumqttc EventLoop ─► pump task ─[TransportEvent]─► Connection ─► DedupCache
//!                                                        │
//!                                                        ▼
//!                                              [ForwardedMessage] ─► consumer
//! ```
//!
//! ## Connection Lifecycle
//!
//! - **Unauthorized**: no credential, no transport
//! - **Connecting**: transport requested, waiting for the broker
//! - **Subscribed**: all three topics requested at QoS 1
//! - **Error**: the transport failed or closed; it reconnects on its own
//!   schedule and a successful reconnect subscribes again
//!
//! Sessions are opened with `clean_session = false`, so the broker keeps the
//! subscriptions and queued QoS 1 messages across reconnects.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod state;
pub mod topics;
pub mod transport;

#[cfg(test)]
mod tests;
