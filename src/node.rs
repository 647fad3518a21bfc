//! Events node with statum state machine for lifecycle management
//!
//! The node owns everything a running process needs: the shared debounce
//! cache with its sweep task, and one task per configured connection.
//!
//! # State Machine
//!
//! ```text
//! Configured ──start──► Running ──shutdown──► Stopped
//! ```
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────── DedupCache ◄── sweeper task
//!                 │                   ▲
//! Connection A ───┤                   │
//! Connection B ───┴─► [ForwardedMessage] ─► downstream consumer
//! ```

use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dedup::DedupCache;
use crate::mqtt::message_manager::ForwardedMessage;
use crate::mqtt::mqtt_handler::{Connection, ConnectionError};
use crate::mqtt::state::ConnectionStatus;
use crate::mqtt::transport::Transport;

#[state]
#[derive(Debug, Clone)]
pub enum NodeState {
    Configured, // Config loaded, nothing spawned
    Running,    // Sweeper and connection tasks live
    Stopped,    // All tasks joined
}

#[machine]
pub struct EventsNode<S: NodeState> {
    config: Config,
    transport: Arc<dyn Transport>,
    cache: Arc<DedupCache>,
    downstream: mpsc::Sender<ForwardedMessage>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    statuses: Vec<(String, watch::Receiver<ConnectionStatus>)>,
}

impl<S: NodeState> EventsNode<S> {
    pub fn cache(&self) -> &Arc<DedupCache> {
        &self.cache
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = &str> {
        self.config.connections.iter().map(|c| c.id.as_str())
    }
}

impl EventsNode<Configured> {
    pub fn create(
        config: Config,
        transport: Arc<dyn Transport>,
        downstream: mpsc::Sender<ForwardedMessage>,
    ) -> Self {
        let cache = Arc::new(DedupCache::new(&config.dedup));
        Self::new(
            config,
            transport,
            cache,
            downstream,
            CancellationToken::new(),
            Vec::new(), // tasks
            Vec::new(), // statuses
        )
    }

    /// Replaces the cache built from the configuration, e.g. to attach an
    /// expiry listener.
    pub fn with_cache(mut self, cache: Arc<DedupCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Spawns the sweeper and connects every configured connection. Must be
    /// called from within a tokio runtime.
    pub fn start(mut self) -> EventsNode<Running> {
        info!(
            "Starting events node with {} connection(s)",
            self.config.connections.len()
        );

        self.tasks
            .push(self.cache.spawn_sweeper(self.cancel.child_token()));

        for settings in &self.config.connections {
            let mut connection = Connection::new(
                settings.id.clone(),
                self.config.mqtt.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.cache),
                self.downstream.clone(),
            );

            match connection.connect(&settings.token, &settings.endpoint) {
                Ok(()) => debug!("[{}] Connect requested", settings.id),
                Err(ConnectionError::MissingCredential) => {
                    warn!("[{}] Invalid token, connection stays idle", settings.id)
                }
                Err(e) => error!("[{}] Connect failed: {}", settings.id, e),
            }

            self.statuses
                .push((settings.id.clone(), connection.subscribe_status()));
            self.tasks
                .push(tokio::spawn(connection.run(self.cancel.child_token())));
        }

        self.transition()
    }
}

impl EventsNode<Running> {
    pub fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.statuses
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, rx)| rx.borrow().clone())
    }

    pub fn statuses(&self) -> Vec<(String, ConnectionStatus)> {
        self.statuses
            .iter()
            .map(|(id, rx)| (id.clone(), rx.borrow().clone()))
            .collect()
    }

    pub fn status_receiver(&self, id: &str) -> Option<watch::Receiver<ConnectionStatus>> {
        self.statuses
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, rx)| rx.clone())
    }

    /// Closes every connection and stops the sweeper.
    pub async fn shutdown(mut self) -> EventsNode<Stopped> {
        info!("Shutting down events node");
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Task failed during shutdown: {}", e);
            }
        }

        info!("Events node stopped");
        self.transition()
    }
}
