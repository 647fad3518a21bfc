//! # Debounce Cache
//!
//! Event sources occasionally redeliver the same logical event (an upstream
//! retry, for instance) inside a new message envelope. The cache remembers
//! every event id it has let through, per connection, for a fixed retention
//! window and rejects repeats inside that window.
//!
//! ## Expiry
//!
//! Expiry is checked in two places:
//! - **on lookup**: an entry past its deadline is treated as absent, even if
//!   the sweep has not removed it yet
//! - **by the sweep**: a periodic task physically removes expired entries and
//!   reports each one (key and the message id it held) through `tracing` and
//!   an optional [`ExpiryListener`]
//!
//! The TTL starts at insertion and is never refreshed by a lookup. Sweep
//! period and TTL are independent.
//!
//! ## Sharing
//!
//! One cache serves every connection in the process. Keys carry the
//! connection identity, so connections never see each other's event ids.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sweep period used when the configured one is zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);


/// Retention settings for the debounce cache.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// `(connection identity, event id)`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub connection: String,
    pub event_id: String,
}

impl DedupKey {
    pub fn new(connection: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.connection, self.event_id)
    }
}

/// Called once per entry removed by the sweep, with the message id the entry
/// held.
pub type ExpiryListener = Arc<dyn Fn(&DedupKey, Option<&str>) + Send + Sync>;

#[derive(Clone, Debug)]
struct CacheEntry {
    message_id: Option<String>,
    expires_at: Instant,
}

pub struct DedupCache {
    entries: DashMap<DedupKey, CacheEntry>,
    ttl: Duration,
    sweep_interval: Duration,
    listener: Option<ExpiryListener>,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: config.ttl,
            sweep_interval: config.sweep_interval,
            listener: None,
        }
    }

    pub fn with_expiry_listener(mut self, listener: ExpiryListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Decides whether a message should be forwarded and records its event id
    /// if so.
    ///
    /// Messages without an event id cannot be deduplicated and are always
    /// forwarded. A live entry for the same connection and event id makes the
    /// message a duplicate. Otherwise the event id is recorded with a fresh
    /// TTL.
    pub fn should_forward(
        &self,
        connection: &str,
        event_id: Option<&str>,
        message_id: Option<&str>,
    ) -> bool {
        self.should_forward_at(connection, event_id, message_id, Instant::now())
    }

    pub fn should_forward_at(
        &self,
        connection: &str,
        event_id: Option<&str>,
        message_id: Option<&str>,
        now: Instant,
    ) -> bool {
        let Some(event_id) = event_id.filter(|id| !id.is_empty()) else {
            warn!(
                "[{}] Message does not contain eventId so cannot check debounce cache",
                connection
            );
            return true;
        };

        let fresh = CacheEntry {
            message_id: message_id.map(str::to_string),
            expires_at: now + self.ttl,
        };

        // The entry guard holds the shard lock, so check-and-insert is atomic.
        match self.entries.entry(DedupKey::new(connection, event_id)) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    debug!(
                        "[{}] eventId {} already seen with messageId {:?}",
                        connection,
                        event_id,
                        occupied.get().message_id
                    );
                    return false;
                }
                debug!(
                    "[{}] eventId {} expired but not yet swept, treating as new",
                    connection, event_id
                );
                occupied.insert(fresh);
                true
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }

    /// Whether a live entry exists. Does not touch the TTL.
    pub fn contains(&self, connection: &str, event_id: &str) -> bool {
        self.live_entry(connection, event_id, Instant::now()).is_some()
    }

    /// Message id recorded for a live entry.
    pub fn message_id(&self, connection: &str, event_id: &str) -> Option<String> {
        self.live_entry(connection, event_id, Instant::now())
            .and_then(|entry| entry.message_id)
    }

    fn live_entry(&self, connection: &str, event_id: &str, now: Instant) -> Option<CacheEntry> {
        self.entries
            .get(&DedupKey::new(connection, event_id))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value().clone())
    }

    /// Entries currently stored, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Removes every entry expired at `now`, reporting each one. Returns the
    /// number removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.expires_at <= now {
                expired.push((key.clone(), entry.message_id.take()));
                false
            } else {
                true
            }
        });

        // Listeners run after `retain` released the shard locks.
        for (key, message_id) in &expired {
            debug!(
                "[{}] Entry expired in the debounce cache for eventId {} with messageId {:?}",
                key.connection, key.event_id, message_id
            );
            if let Some(listener) = &self.listener {
                listener(key, message_id.as_deref());
            }
        }

        expired.len()
    }

    /// Runs the sweep every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let period = cache.sweep_interval.max(MIN_SWEEP_INTERVAL);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!("Debounce sweep removed {} entries", removed);
                        }
                    }
                }
            }
            debug!("Debounce sweeper stopped");
        })
    }
}

impl fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DedupCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}
