//! Helmsman - connection core for a desktop proxy client
//!
//! Keeps one outbound tunnel alive, fast and truthfully reported while the
//! network and the remote servers misbehave:
//! - turns a server profile into a complete engine config document
//! - supervises the external engine process (spawn, readiness, crash watch)
//! - probes candidate servers without disturbing the live session
//! - fails over automatically when the active server degrades
//!
//! # Architecture
//!
//! ```text
//!                  +-------------------+
//!   UI commands -->|    controller/    |--> status/ (pub/sub feed)
//!                  |   (control loop)  |
//!                  +---+-----------+---+
//!                      |           |
//!          +-----------v--+     +--v-----------+
//!          |    engine/   |     |    probe/    |
//!          | (supervisor, |     | (tcp ping,   |
//!          |  generator)  |     |  url tests)  |
//!          +--------------+     +--------------+
//!                      |           |
//!                  +---v-----------v---+
//!                  | profile/  config/ |
//!                  +-------------------+
//! ```
//!
//! The GUI, subscription fetching and settings persistence live outside
//! this crate and talk to it only through [`CoreHandle`], the
//! [`ProfileSource`]/[`SettingsSource`] traits and the status feed.

pub mod common;
pub mod config;
pub mod controller;
pub mod engine;
pub mod probe;
pub mod profile;
pub mod status;

pub use common::error::{ConfigError, Error, ProcessError, Result};
pub use config::{CoreConfig, NetworkSettings};
pub use controller::{Command, CoreHandle, FailoverController, Target};
pub use engine::{EngineConfig, ProcessSupervisor};
pub use probe::{HealthProbe, HealthSample, ProbeOutcome};
pub use profile::{ProfileId, ProfileSource, ServerProfile, SettingsSource};
pub use status::{ConnectionState, ConnectionStatus, StatusEvent, StatusReporter};

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// Helmsman version
pub const VERSION: &str = "0.3.0";

/// Buffer for supervisor crash events
const EVENT_BUFFER: usize = 16;
/// Buffer for probe samples across all workers
const SAMPLE_BUFFER: usize = 64;

/// The assembled connection core: supervisor, prober, reporter and the
/// control loop, wired and running.
pub struct ConnectionCore {
    handle: CoreHandle,
    reporter: Arc<StatusReporter>,
    loop_task: tokio::task::JoinHandle<()>,
}

impl ConnectionCore {
    /// Wire all components and spawn the control loop.
    pub fn new(
        config: CoreConfig,
        profiles: Arc<dyn ProfileSource>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        info!("Initializing connection core v{}", VERSION);

        let reporter = Arc::new(StatusReporter::new());

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let supervisor: Arc<dyn engine::EngineSlot> =
            Arc::new(ProcessSupervisor::new(config.engine.clone(), event_tx));
        info!("Engine supervisor initialized ({})", config.engine.binary.display());

        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_BUFFER);
        let prober: Arc<dyn probe::ProbeRegistry> = Arc::new(HealthProbe::new(
            config.probe.clone(),
            config.engine.clone(),
            sample_tx,
        ));
        info!("Health probe initialized (interval {:?})", config.probe.interval());

        let (controller, handle) = FailoverController::new(
            config,
            supervisor,
            prober,
            profiles,
            settings,
            reporter.clone(),
            event_rx,
            sample_rx,
        );
        let loop_task = tokio::spawn(controller.run());

        ConnectionCore { handle, reporter, loop_task }
    }

    /// Command handle for the UI layer. Cloneable, cheap.
    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    /// Subscribe to connection state transitions and health sample batches.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.reporter.subscribe()
    }

    /// Latest connection snapshot.
    pub fn state(&self) -> ConnectionState {
        self.reporter.current()
    }

    /// Disconnect, stop the control loop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.handle.disconnect().await;
        let _ = self.handle.shutdown().await;
        let _ = self.loop_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{SharedSettings, StaticProfileSource};

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.3.0");
    }

    #[tokio::test]
    async fn test_core_starts_idle_and_shuts_down() {
        let core = ConnectionCore::new(
            CoreConfig::default(),
            Arc::new(StaticProfileSource::new(Vec::new())),
            Arc::new(SharedSettings::new(NetworkSettings::default())),
        );
        assert_eq!(core.state().status, ConnectionStatus::Idle);

        let handle = core.handle();
        core.shutdown().await;
        // the loop is gone; further commands fail instead of hanging
        assert!(handle.probe_now(ProfileId::new()).await.is_err());
    }
}
