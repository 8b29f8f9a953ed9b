//! Failover control loop
//!
//! The single authority over connection state. Commands from the UI,
//! crash events from the supervisor and samples from the probes all land
//! in one task that serializes every transition; nothing else mutates
//! `ConnectionState`. Disconnect requests travel on their own channel so
//! they outrank anything already queued, including an in-flight start.

pub mod ranking;

pub use ranking::{HealthLedger, ServerHealthState};

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::common::ProcessError;
use crate::config::{CoreConfig, EngineSettings, FailoverSettings, ProbeSettings, SiblingProbeMethod};
use crate::engine::{generate, EngineConfig, EngineHandle, EngineSlot, ProcessEvent};
use crate::probe::{HealthSample, ProbeMethod, ProbeRegistry};
use crate::profile::{ProfileId, ProfileSource, ServerProfile, SettingsSource};
use crate::status::{ConnectionState, ConnectionStatus, StatusReporter};
use crate::{Error, Result};

const COMMAND_BUFFER: usize = 16;
const DISCONNECT_BUFFER: usize = 4;

/// What to connect to
#[derive(Debug, Clone)]
pub enum Target {
    /// Best candidate of a named group (first by list order until health
    /// data accumulates)
    Group(String),
    /// One explicit profile
    Profile(ProfileId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Group(group) => write!(f, "group '{}'", group),
            Target::Profile(id) => write!(f, "profile {}", id),
        }
    }
}

/// Commands accepted by the control loop
#[derive(Debug)]
pub enum Command {
    Connect(Target),
    SetAutoFailover(bool),
    ProbeNow(ProfileId),
    /// Manual override: converge on this profile, ranking not consulted
    SwitchTo(ProfileId),
    /// Tear down and exit the loop
    Shutdown,
}

/// Cloneable front door to the control loop. Sends are fire-and-forget;
/// outcomes arrive on the status feed.
#[derive(Clone)]
pub struct CoreHandle {
    commands: mpsc::Sender<Command>,
    disconnects: mpsc::Sender<()>,
}

impl CoreHandle {
    pub async fn connect(&self, target: Target) -> Result<()> {
        self.send(Command::Connect(target)).await
    }

    /// Priority request: overtakes queued commands and cancels an
    /// in-flight convergence.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnects
            .send(())
            .await
            .map_err(|_| Error::internal("control loop stopped"))
    }

    pub async fn set_auto_failover(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetAutoFailover(enabled)).await
    }

    pub async fn probe_now(&self, id: ProfileId) -> Result<()> {
        self.send(Command::ProbeNow(id)).await
    }

    pub async fn switch_to(&self, id: ProfileId) -> Result<()> {
        self.send(Command::SwitchTo(id)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::internal("control loop stopped"))
    }
}

/// The active session while the engine runs
struct Session {
    profile: ServerProfile,
    /// Group snapshot taken at convergence, active profile included
    candidates: Vec<ServerProfile>,
    group: String,
    handle: EngineHandle,
    config: EngineConfig,
}

/// Outcome of one convergence attempt
enum Converge {
    Running { handle: EngineHandle, config: EngineConfig },
    /// A disconnect overtook the start; carries the stop error if the
    /// teardown could not be confirmed
    Disconnected { stop_error: Option<String> },
    /// Retriable start errors exhausted; the candidate is bad
    StartFailed(String),
    /// Not worth retrying anywhere (bad config, missing binary)
    Fatal(String),
}

/// The decision core: consumes events, drives the engine slot and the
/// probe registry, publishes every transition.
pub struct FailoverController {
    failover: FailoverSettings,
    engine_settings: EngineSettings,
    probe_settings: ProbeSettings,
    engine: Arc<dyn EngineSlot>,
    probes: Arc<dyn ProbeRegistry>,
    profiles: Arc<dyn ProfileSource>,
    settings: Arc<dyn SettingsSource>,
    reporter: Arc<StatusReporter>,
    commands: mpsc::Receiver<Command>,
    disconnects: mpsc::Receiver<()>,
    process_events: mpsc::Receiver<ProcessEvent>,
    samples: mpsc::Receiver<HealthSample>,
    ledger: HealthLedger,
    auto_failover: bool,
    session: Option<Session>,
}

impl FailoverController {
    /// Wire a controller to its collaborators. `process_events` and
    /// `samples` are the receiving ends of the channels the supervisor and
    /// probe machinery were constructed with.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        engine: Arc<dyn EngineSlot>,
        probes: Arc<dyn ProbeRegistry>,
        profiles: Arc<dyn ProfileSource>,
        settings: Arc<dyn SettingsSource>,
        reporter: Arc<StatusReporter>,
        process_events: mpsc::Receiver<ProcessEvent>,
        samples: mpsc::Receiver<HealthSample>,
    ) -> (Self, CoreHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(DISCONNECT_BUFFER);
        let controller = FailoverController {
            ledger: HealthLedger::new(config.failover.clone()),
            auto_failover: config.failover.enabled,
            failover: config.failover,
            engine_settings: config.engine,
            probe_settings: config.probe,
            engine,
            probes,
            profiles,
            settings,
            reporter,
            commands: command_rx,
            disconnects: disconnect_rx,
            process_events,
            samples,
            session: None,
        };
        let handle = CoreHandle { commands: command_tx, disconnects: disconnect_tx };
        (controller, handle)
    }

    /// Run until shutdown. Event priority: disconnect, then commands, then
    /// process events, then samples; FIFO within each channel.
    pub async fn run(mut self) {
        info!("Control loop started (auto-failover {})", self.auto_failover);
        loop {
            tokio::select! {
                biased;
                request = self.disconnects.recv() => {
                    if request.is_none() {
                        break;
                    }
                    self.handle_disconnect().await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = self.process_events.recv() => {
                    self.handle_process_event(event).await;
                }
                Some(sample) = self.samples.recv() => {
                    self.handle_sample(sample).await;
                }
            }
        }
        if self.session.is_some() {
            self.handle_disconnect().await;
        }
        self.probes.deregister_all();
        info!("Control loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Connect(target) => self.handle_connect(target).await,
            Command::SetAutoFailover(enabled) => self.handle_set_auto_failover(enabled),
            Command::ProbeNow(id) => self.handle_probe_now(id),
            Command::SwitchTo(id) => self.handle_connect(Target::Profile(id)).await,
            Command::Shutdown => unreachable!("handled in run loop"),
        }
    }

    async fn handle_connect(&mut self, target: Target) {
        let (group, candidates, chosen) = match self.resolve(&target) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Cannot resolve {}: {}", target, e);
                self.publish(ConnectionStatus::Error, None, None, Some(e.to_string()));
                return;
            }
        };
        info!("Connecting to '{}' ({} candidates)", chosen.name, candidates.len());
        self.begin_session(group, candidates, chosen).await;
    }

    /// Resolve a target into (group, candidate snapshot, chosen profile).
    /// Explicit profile targets bypass ranking; group targets consult the
    /// ledger, which is neutral on a fresh connect.
    fn resolve(&mut self, target: &Target) -> Result<(String, Vec<ServerProfile>, ServerProfile)> {
        match target {
            Target::Profile(id) => {
                let profile = self
                    .profiles
                    .find(id)
                    .ok_or_else(|| Error::profile(id.to_string()))?;
                let candidates = if profile.group.is_empty() {
                    vec![profile.clone()]
                } else {
                    self.profiles.list(&profile.group)
                };
                Ok((profile.group.clone(), candidates, profile))
            }
            Target::Group(group) => {
                let candidates = self.profiles.list(group);
                if candidates.is_empty() {
                    return Err(Error::profile(format!("group '{}' is empty", group)));
                }
                let chosen = self
                    .ledger
                    .best_candidate(&candidates, None, Utc::now())
                    .and_then(|id| candidates.iter().find(|p| p.id == id).cloned())
                    .unwrap_or_else(|| candidates[0].clone());
                Ok((group.clone(), candidates, chosen))
            }
        }
    }

    /// Converge on `chosen` and establish a fresh session around it.
    async fn begin_session(
        &mut self,
        group: String,
        candidates: Vec<ServerProfile>,
        chosen: ServerProfile,
    ) {
        // A new session never coexists with the previous engine: stop it
        // first, and refuse to proceed when the stop cannot be confirmed.
        // Convergence paths that never reach start would otherwise leave
        // the old process running with its handle discarded.
        if let Some(previous) = self.session.take() {
            if let Err(e) = self.engine.stop(&previous.handle).await {
                self.probes.deregister_all();
                self.ledger.clear();
                self.publish(
                    ConnectionStatus::Error,
                    None,
                    None,
                    Some(format!("stopping '{}' before switch: {}", previous.profile.name, e)),
                );
                return;
            }
        }
        // Previous session's probes and history do not leak into this one
        self.probes.deregister_all();
        self.ledger.clear();
        for candidate in &candidates {
            self.ledger.register(candidate.id);
        }

        self.publish(ConnectionStatus::Connecting, Some(chosen.id), None, None);
        match self.converge(&chosen).await {
            Converge::Running { handle, config } => {
                self.establish(group, candidates, chosen, handle, config);
            }
            Converge::Disconnected { stop_error } => self.land_disconnected(stop_error),
            Converge::StartFailed(reason) => {
                self.ledger.record_start_failure(&chosen.id);
                if self.auto_failover && candidates.len() > 1 {
                    warn!("Start failed for '{}', trying siblings: {}", chosen.name, reason);
                    self.select_replacement(group, candidates, chosen.id).await;
                } else {
                    self.ledger.clear();
                    self.publish(ConnectionStatus::Error, None, None, Some(reason));
                }
            }
            Converge::Fatal(reason) => {
                self.ledger.clear();
                self.publish(ConnectionStatus::Error, None, None, Some(reason));
            }
        }
    }

    /// Generate a config and start the engine, retrying transient start
    /// errors and yielding to a disconnect at every await.
    async fn converge(&mut self, profile: &ServerProfile) -> Converge {
        let settings = self.settings.snapshot();
        let config = match generate(profile, &settings) {
            Ok(config) => config,
            Err(e) => return Converge::Fatal(format!("config for '{}': {}", profile.name, e)),
        };

        let mut attempt: u32 = 0;
        loop {
            let engine = self.engine.clone();
            let start_config = config.clone();
            let mut start = tokio::spawn(async move { engine.start(start_config).await });

            let result = tokio::select! {
                biased;
                _ = self.disconnects.recv() => {
                    // Let the start finish, then undo it
                    let stop_error = match start.await {
                        Ok(Ok(handle)) => self.engine.stop(&handle).await.err().map(|e| e.to_string()),
                        Ok(Err(_)) => None,
                        Err(join) => Some(format!("start task: {}", join)),
                    };
                    return Converge::Disconnected { stop_error };
                }
                result = &mut start => result,
            };

            match result {
                Ok(Ok(handle)) => return Converge::Running { handle, config },
                Ok(Err(e)) => match e {
                    ProcessError::BinaryNotFound(_) | ProcessError::TerminationUnconfirmed(_) => {
                        return Converge::Fatal(e.to_string());
                    }
                    ProcessError::PortInUse(_) | ProcessError::SpawnFailed(_) => {
                        if attempt >= self.engine_settings.start_retries {
                            return Converge::StartFailed(e.to_string());
                        }
                        attempt += 1;
                        warn!(
                            "Engine start attempt {} for '{}' failed, retrying: {}",
                            attempt, profile.name, e
                        );
                        let delay = self.engine_settings.start_retry_delay() * attempt;
                        tokio::select! {
                            biased;
                            _ = self.disconnects.recv() => {
                                return Converge::Disconnected { stop_error: None };
                            }
                            _ = sleep(delay) => {}
                        }
                    }
                },
                Err(join) => return Converge::Fatal(format!("start task: {}", join)),
            }
        }
    }

    /// Record the running session, register probes, publish Connected
    /// (and Monitoring when auto-failover watches the group).
    fn establish(
        &mut self,
        group: String,
        candidates: Vec<ServerProfile>,
        profile: ServerProfile,
        handle: EngineHandle,
        config: EngineConfig,
    ) {
        info!("Connected to '{}' via {}", profile.name, profile.protocol_name());
        self.session = Some(Session {
            profile: profile.clone(),
            candidates,
            group,
            handle,
            config: config.clone(),
        });
        self.register_probes();
        self.publish(ConnectionStatus::Connected, Some(profile.id), Some(config), None);
        if self.auto_failover {
            self.publish(ConnectionStatus::Monitoring, Some(profile.id), None, None);
        }
    }

    /// Align probe registrations and ledger entries with the session and
    /// the auto-failover switch: the active profile is always watched
    /// through the live inbound, siblings only under auto-failover.
    fn register_probes(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        self.probes.deregister_all();

        let live = match session.config.http_port() {
            Some(http_port) => ProbeMethod::UrlTestLive { http_port },
            None => ProbeMethod::UrlTestIsolated,
        };
        self.probes.register(session.profile.clone(), live);
        self.ledger.register(session.profile.id);

        let sibling_method = match self.probe_settings.sibling_method {
            SiblingProbeMethod::UrlTest => ProbeMethod::UrlTestIsolated,
            SiblingProbeMethod::TcpPing => ProbeMethod::TcpPing,
        };
        for sibling in session.candidates.iter().filter(|p| p.id != session.profile.id) {
            if self.auto_failover {
                self.probes.register(sibling.clone(), sibling_method);
                self.ledger.register(sibling.id);
            } else {
                self.ledger.deregister(&sibling.id);
            }
        }
    }

    async fn handle_disconnect(&mut self) {
        let session = self.session.take();
        if session.is_none()
            && self.reporter.current().status == ConnectionStatus::Idle
        {
            return;
        }
        let active = session.as_ref().map(|s| s.profile.id);
        self.publish(ConnectionStatus::Disconnecting, active, None, None);
        self.probes.deregister_all();
        self.ledger.clear();

        let stop_error = match session {
            Some(session) => self.engine.stop(&session.handle).await.err().map(|e| e.to_string()),
            None => None,
        };
        self.land_disconnected(stop_error);
    }

    /// Final state after a teardown: Idle when the engine is confirmed
    /// down, Error when it is not. Never claims Idle on uncertainty.
    fn land_disconnected(&mut self, stop_error: Option<String>) {
        self.session = None;
        self.probes.deregister_all();
        self.ledger.clear();
        match stop_error {
            None => self.publish(ConnectionStatus::Idle, None, None, None),
            Some(reason) => {
                warn!("Disconnect unconfirmed: {}", reason);
                self.publish(
                    ConnectionStatus::Error,
                    None,
                    None,
                    Some(format!("disconnect unconfirmed: {}", reason)),
                );
            }
        }
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        let ProcessEvent::Crashed { generation, exit_code, diagnostic } = event;
        let Some(session) = &self.session else {
            debug!("Crash event with no session, ignoring");
            return;
        };
        if session.handle.generation != generation {
            debug!("Crash event for replaced engine (generation {}), ignoring", generation);
            return;
        }

        let name = session.profile.name.clone();
        let reason = format!(
            "engine crashed (exit {}) while connected to '{}': {}",
            exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            name,
            diagnostic
        );
        warn!("{}", reason);

        if self.auto_failover {
            self.fail_over(reason).await;
        } else {
            let session = self.session.take();
            self.probes.deregister_all();
            self.ledger.clear();
            let active = session.map(|s| s.profile.id);
            self.publish(ConnectionStatus::Error, active, None, Some(reason));
        }
    }

    async fn handle_sample(&mut self, sample: HealthSample) {
        self.ledger.observe(&sample);
        self.reporter.publish_health(vec![sample.clone()]);

        let Some(session) = &self.session else {
            return;
        };
        if sample.profile_id != session.profile.id || sample.outcome.is_success() {
            return;
        }
        let failures = self.ledger.consecutive_failures(&session.profile.id);
        debug!(
            "Active profile '{}' failed probe ({} consecutive)",
            session.profile.name, failures
        );
        if self.auto_failover && failures >= self.failover.failure_threshold {
            let reason = format!(
                "{} consecutive probe failures on '{}'",
                failures, session.profile.name
            );
            self.fail_over(reason).await;
        }
    }

    /// Abandon the active profile and converge on the next-best candidate.
    async fn fail_over(&mut self, reason: String) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!("Failing over from '{}': {}", session.profile.name, reason);
        self.publish(
            ConnectionStatus::FailingOver,
            Some(session.profile.id),
            None,
            Some(reason),
        );
        self.probes.deregister_all();

        // Crashed processes are already gone; stop is a no-op then
        if let Err(e) = self.engine.stop(&session.handle).await {
            self.ledger.clear();
            self.publish(
                ConnectionStatus::Error,
                None,
                None,
                Some(format!("failover teardown: {}", e)),
            );
            return;
        }

        let Session { profile, candidates, group, .. } = session;
        self.select_replacement(group, candidates, profile.id).await;
    }

    /// Try eligible candidates in ranking order until one runs or the
    /// group is exhausted. The abandoned profile is never retried here.
    async fn select_replacement(
        &mut self,
        group: String,
        candidates: Vec<ServerProfile>,
        abandoned: ProfileId,
    ) {
        loop {
            let Some(next_id) =
                self.ledger.best_candidate(&candidates, Some(&abandoned), Utc::now())
            else {
                let error = Error::exhausted(if group.is_empty() {
                    "ungrouped".to_string()
                } else {
                    group.clone()
                });
                warn!("{}", error);
                self.ledger.clear();
                self.publish(ConnectionStatus::Error, None, None, Some(error.to_string()));
                return;
            };
            let Some(next) = candidates.iter().find(|p| p.id == next_id).cloned() else {
                self.ledger.clear();
                self.publish(
                    ConnectionStatus::Error,
                    None,
                    None,
                    Some(format!("candidate {} vanished from snapshot", next_id)),
                );
                return;
            };

            info!("Failover target: '{}'", next.name);
            self.publish(ConnectionStatus::Connecting, Some(next.id), None, None);
            match self.converge(&next).await {
                Converge::Running { handle, config } => {
                    self.establish(group, candidates, next, handle, config);
                    return;
                }
                Converge::Disconnected { stop_error } => {
                    self.land_disconnected(stop_error);
                    return;
                }
                Converge::StartFailed(reason) => {
                    warn!("Failover start failed for '{}': {}", next.name, reason);
                    self.ledger.record_start_failure(&next.id);
                }
                Converge::Fatal(reason) => {
                    self.ledger.clear();
                    self.publish(ConnectionStatus::Error, None, None, Some(reason));
                    return;
                }
            }
        }
    }

    fn handle_set_auto_failover(&mut self, enabled: bool) {
        if self.auto_failover == enabled {
            return;
        }
        info!("Auto-failover {}", if enabled { "enabled" } else { "disabled" });
        self.auto_failover = enabled;
        if let Some(session) = &self.session {
            let active = session.profile.id;
            self.register_probes();
            let status = if enabled {
                ConnectionStatus::Monitoring
            } else {
                ConnectionStatus::Connected
            };
            self.publish(status, Some(active), None, None);
        }
    }

    fn handle_probe_now(&mut self, id: ProfileId) {
        // Registered workers keep sample ordering; everything else gets a
        // detached single shot
        if self.probes.trigger(&id) {
            return;
        }
        let Some(profile) = self.profiles.find(&id) else {
            warn!("probe-now for unknown profile {}", id);
            return;
        };
        let method = match self.probe_settings.sibling_method {
            SiblingProbeMethod::UrlTest => ProbeMethod::UrlTestIsolated,
            SiblingProbeMethod::TcpPing => ProbeMethod::TcpPing,
        };
        self.probes.probe_once(profile, method);
    }

    fn publish(
        &self,
        status: ConnectionStatus,
        active_profile_id: Option<ProfileId>,
        engine_config: Option<EngineConfig>,
        last_error: Option<String>,
    ) {
        self.reporter.publish_connection(ConnectionState {
            status,
            active_profile_id,
            engine_config,
            last_error,
            since: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Group("eu".to_string()).to_string(), "group 'eu'");
        let id = ProfileId::new();
        assert_eq!(Target::Profile(id).to_string(), format!("profile {}", id));
    }

    #[tokio::test]
    async fn test_handle_send_after_loop_gone() {
        let (commands, command_rx) = mpsc::channel(1);
        let (disconnects, disconnect_rx) = mpsc::channel(1);
        drop(command_rx);
        drop(disconnect_rx);
        let handle = CoreHandle { commands, disconnects };

        assert!(handle.connect(Target::Group("eu".to_string())).await.is_err());
        assert!(handle.disconnect().await.is_err());
    }
}
