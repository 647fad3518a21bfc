//! Connection state machine and the status surface published to observers.
//!
//! ```text
//!                 ConnectRequested
//!  Unauthorized ──────────────────► Connecting ──TopicsSubscribed──► Subscribed
//!       ▲                               │  ▲                             │
//!       │ MissingCredential             │  │ ConnectRequested            │
//!       │ (from any state)              ▼  │                             │
//!       └──────────────────────────── Error ◄──TransportError/Closed─────┘
//! ```
//!
//! `Error` is left either by the transport reconnecting on its own (which
//! re-runs the subscribe path) or by a fresh connect request.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// Lifecycle state of a single broker connection.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Unauthorized,
    Connecting,
    Subscribed,
    Error,
}

/// Typed inputs driving [`ConnectionState`] transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateInput {
    /// Connect was requested with an empty credential
    MissingCredential,
    /// Connect was requested with a credential
    ConnectRequested,
    /// The transport connected and all three topic subscriptions were issued
    TopicsSubscribed,
    /// At least one subscribe request could not be issued
    SubscribeFailed,
    TransportError,
    TransportClosed,
}

impl ConnectionState {
    /// Pure transition function.
    ///
    /// An unauthorized connection owns no transport, so transport-driven
    /// inputs cannot move it anywhere; only a new connect request can.
    pub fn next(self, input: StateInput) -> Self {
        match (self, input) {
            (_, StateInput::MissingCredential) => ConnectionState::Unauthorized,
            (_, StateInput::ConnectRequested) => ConnectionState::Connecting,
            (ConnectionState::Unauthorized, _) => ConnectionState::Unauthorized,
            (_, StateInput::TopicsSubscribed) => ConnectionState::Subscribed,
            (_, StateInput::SubscribeFailed)
            | (_, StateInput::TransportError)
            | (_, StateInput::TransportClosed) => ConnectionState::Error,
        }
    }

    pub fn status(self) -> NodeStatus {
        match self {
            ConnectionState::Unauthorized => NodeStatus::Unauthorized,
            ConnectionState::Connecting => NodeStatus::Subscribing,
            ConnectionState::Subscribed => NodeStatus::Subscribed,
            ConnectionState::Error => NodeStatus::Error,
        }
    }
}

/// The four fixed visual states shown to an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Unauthorized,
    Subscribing,
    Subscribed,
    Error,
}

impl NodeStatus {
    pub fn fill(self) -> &'static str {
        match self {
            NodeStatus::Subscribing => "yellow",
            NodeStatus::Subscribed => "green",
            NodeStatus::Error | NodeStatus::Unauthorized => "red",
        }
    }

    pub fn shape(self) -> &'static str {
        "ring"
    }

    pub fn text(self) -> &'static str {
        match self {
            NodeStatus::Unauthorized => "Invalid Token",
            NodeStatus::Subscribing => "subscribing...",
            NodeStatus::Subscribed => "subscribed",
            NodeStatus::Error => "Error",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Snapshot of a connection published over a `watch` channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub messages_received: usize,
    pub messages_forwarded: usize,
    pub duplicates_dropped: usize,
    pub malformed_dropped: usize,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Local>>,
}

impl ConnectionStatus {
    pub fn status(&self) -> NodeStatus {
        self.state.status()
    }
}
