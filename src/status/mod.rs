//! Connection status publishing
//!
//! The one place where state changes leave the core. The controller pushes
//! immutable snapshots; the UI, logging and tray glue subscribe and never
//! reach back into core internals. Slow subscribers lag and drop, they
//! never block the control loop.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::EngineConfig;
use crate::probe::HealthSample;
use crate::profile::ProfileId;

/// Broadcast buffer; laggards skip to the newest events.
const FEED_CAPACITY: usize = 256;

/// Lifecycle of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Nothing running, nothing wanted
    Idle,
    /// Converging on a target profile
    Connecting,
    /// Engine running for the active profile
    Connected,
    /// Connected with auto-failover watching the group
    Monitoring,
    /// Active profile abandoned, selecting a replacement
    FailingOver,
    /// Teardown in progress
    Disconnecting,
    /// Unrecoverable for this session; `last_error` says why
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Idle => write!(f, "idle"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Monitoring => write!(f, "monitoring"),
            ConnectionStatus::FailingOver => write!(f, "failing-over"),
            ConnectionStatus::Disconnecting => write!(f, "disconnecting"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// What is true right now. Built inside the control loop, published whole.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub active_profile_id: Option<ProfileId>,
    /// The document the running engine was started with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_config: Option<EngineConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl ConnectionState {
    pub fn idle() -> Self {
        ConnectionState {
            status: ConnectionStatus::Idle,
            active_profile_id: None,
            engine_config: None,
            last_error: None,
            since: Utc::now(),
        }
    }
}

/// One event on the feed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum StatusEvent {
    Connection(ConnectionState),
    Health(Vec<HealthSample>),
}

/// Publish/subscribe hub for core state
pub struct StatusReporter {
    current: RwLock<ConnectionState>,
    feed: broadcast::Sender<StatusEvent>,
}

impl StatusReporter {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        StatusReporter { current: RwLock::new(ConnectionState::idle()), feed }
    }

    /// Subscribe to the event feed. Receivers that fall behind observe
    /// `Lagged` and resume at the newest event.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.feed.subscribe()
    }

    /// Latest published connection snapshot.
    pub fn current(&self) -> ConnectionState {
        self.current.read().clone()
    }

    /// Publish a new connection snapshot and fan it out.
    pub fn publish_connection(&self, state: ConnectionState) {
        debug!(
            "Connection state: {} (profile {:?})",
            state.status, state.active_profile_id
        );
        *self.current.write() = state.clone();
        // No subscribers is fine
        let _ = self.feed.send(StatusEvent::Connection(state));
    }

    /// Fan out a batch of health samples.
    pub fn publish_health(&self, samples: Vec<HealthSample>) {
        if samples.is_empty() {
            return;
        }
        let _ = self.feed.send(StatusEvent::Health(samples));
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}
