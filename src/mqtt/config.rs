use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Shortest keep-alive `rumqttc` accepts.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Transport settings shared by every broker connection.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Wait between reconnect attempts after the link drops
    #[serde(with = "humantime_serde")]
    pub reconnect_period: Duration,
    pub client_id_prefix: String,
    /// Capacity of the request and event channels of each connection
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(180),
            reconnect_period: Duration::from_secs(60),
            client_id_prefix: "bacnet-events".to_string(),
            channel_capacity: 64,
        }
    }
}

/// Client identity for a credential: prefix, the first eight characters of
/// the credential and the instance identifier.
///
/// Stable across reconnects for the same credential and instance, and the
/// only part of the credential that is ever logged.
pub fn client_identity(prefix: &str, credential: &str, instance_id: &str) -> String {
    let short: String = credential.chars().take(8).collect();
    format!("{prefix}-{short}-{instance_id}")
}

/// Options handed to the transport when a connection is opened.
#[derive(Clone, PartialEq)]
pub struct ConnectOptions {
    pub identity: String,
    pub secret: String,
    pub client_id: String,
    /// Always `false`: subscriptions must survive reconnects
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
    pub channel_capacity: usize,
}

impl ConnectOptions {
    /// The credential doubles as username and password.
    pub fn for_credential(config: &MqttConfig, credential: &str, instance_id: &str) -> Self {
        Self {
            identity: credential.to_string(),
            secret: credential.to_string(),
            client_id: client_identity(&config.client_id_prefix, credential, instance_id),
            clean_session: false,
            keep_alive: config.keep_alive,
            reconnect_period: config.reconnect_period,
            channel_capacity: config.channel_capacity,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_period", &self.reconnect_period)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}
