//! Engine process supervisor
//!
//! Runs the external proxy engine as a child process:
//! - writes the config artifact and spawns `<binary> run -c <artifact>`
//! - waits for the engine to accept connections before reporting success
//! - watches for unexpected exits and reports them as crash events
//! - graceful shutdown, escalating to a hard kill
//!
//! The config artifact lives exactly as long as the process it configures.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::common::ProcessError;
use crate::config::EngineSettings;
use crate::engine::{EngineConfig, EngineHandle, EngineSlot, ProcessEvent};

/// Cadence of the exit watch on a running engine
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Lines of engine output kept for diagnostics
const DIAG_CAPACITY: usize = 50;

/// Lines included in error payloads
const DIAG_TAIL: usize = 8;

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No engine process
    Stopped,
    /// Spawned, waiting for readiness
    Starting,
    /// Accepting connections
    Running,
    /// Termination in progress
    Stopping,
    /// Exited without being asked; transitions to Stopped once cleaned up
    Crashed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
        }
    }
}

/// The one slot an engine process can occupy. Holding its lock across a
/// whole start or stop sequence is what serializes them.
struct Slot {
    child: Option<Child>,
    artifact: Option<std::path::PathBuf>,
    generation: u64,
    stopping: bool,
}

struct Inner {
    settings: EngineSettings,
    slot: Mutex<Slot>,
    state: parking_lot::RwLock<ProcessState>,
    diagnostics: Arc<parking_lot::Mutex<VecDeque<String>>>,
    events: mpsc::Sender<ProcessEvent>,
    next_generation: AtomicU64,
}

/// Engine process supervisor
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Create a supervisor; crash events go to `events`.
    pub fn new(settings: EngineSettings, events: mpsc::Sender<ProcessEvent>) -> Self {
        ProcessSupervisor {
            inner: Arc::new(Inner {
                settings,
                slot: Mutex::new(Slot {
                    child: None,
                    artifact: None,
                    generation: 0,
                    stopping: false,
                }),
                state: parking_lot::RwLock::new(ProcessState::Stopped),
                diagnostics: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
                events,
                next_generation: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait::async_trait]
impl EngineSlot for ProcessSupervisor {
    async fn start(&self, config: EngineConfig) -> Result<EngineHandle, ProcessError> {
        Inner::start(self.inner.clone(), config).await
    }

    async fn stop(&self, handle: &EngineHandle) -> Result<(), ProcessError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.generation != handle.generation || slot.child.is_none() {
            debug!("Ignoring stop for stale engine handle (generation {})", handle.generation);
            return Ok(());
        }
        self.inner.shutdown_locked(&mut slot).await
    }

    fn state(&self) -> ProcessState {
        *self.inner.state.read()
    }
}

impl Inner {
    async fn start(inner: Arc<Inner>, config: EngineConfig) -> Result<EngineHandle, ProcessError> {
        let mut slot = inner.slot.lock().await;

        // Replace any engine already in the slot
        if slot.child.is_some() {
            inner.shutdown_locked(&mut slot).await?;
        }

        inner.set_state(ProcessState::Starting);
        inner.diagnostics.lock().clear();

        let binary = &inner.settings.binary;
        if binary.is_absolute() && !binary.exists() {
            inner.set_state(ProcessState::Stopped);
            return Err(ProcessError::BinaryNotFound(binary.clone()));
        }

        // Claim every inbound port briefly so a collision fails here with a
        // clear error instead of inside the engine.
        for port in config.inbound_ports() {
            if port == 0 {
                continue;
            }
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => drop(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    inner.set_state(ProcessState::Stopped);
                    return Err(ProcessError::PortInUse(port));
                }
                Err(e) => {
                    inner.set_state(ProcessState::Stopped);
                    return Err(ProcessError::spawn(format!("port {} precheck: {}", port, e)));
                }
            }
        }

        let json = config.to_json().map_err(|e| {
            inner.set_state(ProcessState::Stopped);
            ProcessError::spawn(format!("serialize engine config: {}", e))
        })?;
        let dir = inner.settings.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        let artifact = dir.join(format!("engine-{}.json", uuid::Uuid::new_v4()));
        if let Err(e) = fs::write(&artifact, json).await {
            inner.set_state(ProcessState::Stopped);
            return Err(ProcessError::spawn(format!(
                "write config artifact {}: {}",
                artifact.display(),
                e
            )));
        }

        let mut cmd = Command::new(binary);
        cmd.arg("run")
            .arg("-c")
            .arg(&artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref work_dir) = inner.settings.work_dir {
            cmd.current_dir(work_dir);
        }

        info!("Starting engine: {:?} run -c {:?}", binary, artifact);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_file(&artifact).await;
                inner.set_state(ProcessState::Stopped);
                return Err(if e.kind() == io::ErrorKind::NotFound {
                    ProcessError::BinaryNotFound(binary.clone())
                } else {
                    ProcessError::spawn(format!("spawn {:?}: {}", binary, e))
                });
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            spawn_pump(inner.diagnostics.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pump(inner.diagnostics.clone(), stderr);
        }

        let ready_port = config
            .http_port()
            .or_else(|| config.inbound_ports().into_iter().find(|p| *p != 0));
        if let Err(reason) = inner.wait_ready(&mut child, ready_port).await {
            let _ = child.kill().await;
            let _ = fs::remove_file(&artifact).await;
            inner.set_state(ProcessState::Stopped);
            return Err(ProcessError::spawn(reason));
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        slot.child = Some(child);
        slot.artifact = Some(artifact);
        slot.generation = generation;
        slot.stopping = false;
        drop(slot);

        inner.set_state(ProcessState::Running);
        info!("Engine running (pid {:?}, generation {})", pid, generation);
        spawn_monitor(inner, generation);

        Ok(EngineHandle { generation, pid })
    }

    /// Wait for the engine to accept connections on `port`, failing early if
    /// the process exits first.
    async fn wait_ready(&self, child: &mut Child, port: Option<u16>) -> Result<(), String> {
        let Some(port) = port else {
            sleep(self.settings.readiness_poll()).await;
            return match child.try_wait() {
                Ok(None) => Ok(()),
                Ok(Some(status)) => Err(format!(
                    "engine exited during startup ({}): {}",
                    status,
                    self.diagnostic_tail()
                )),
                Err(e) => Err(format!("engine status check: {}", e)),
            };
        };

        let deadline = Instant::now() + self.settings.readiness_timeout();
        loop {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    return Err(format!(
                        "engine exited during startup ({}): {}",
                        status,
                        self.diagnostic_tail()
                    ));
                }
                Err(e) => return Err(format!("engine status check: {}", e)),
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "engine not ready on port {} within {:?}",
                    port,
                    self.settings.readiness_timeout()
                ));
            }
            sleep(self.settings.readiness_poll()).await;
        }
    }

    /// Terminate the child in the slot. Polite request first, hard kill
    /// after the grace period. The caller holds the slot lock.
    async fn shutdown_locked(&self, slot: &mut Slot) -> Result<(), ProcessError> {
        let Some(mut child) = slot.child.take() else {
            self.set_state(ProcessState::Stopped);
            return Ok(());
        };
        slot.stopping = true;
        self.set_state(ProcessState::Stopping);
        let pid = child.id();
        info!("Stopping engine (pid {:?})", pid);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let confirmed = match timeout(self.settings.stop_grace(), child.wait()).await {
            Ok(Ok(status)) => {
                info!("Engine exited with status: {}", status);
                true
            }
            Ok(Err(e)) => {
                warn!("Error waiting for engine: {}", e);
                true
            }
            Err(_) => {
                warn!("Engine ignored termination request, killing");
                match timeout(self.settings.kill_confirm(), child.kill()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!("Engine kill failed: {}", e);
                        matches!(child.try_wait(), Ok(Some(_)))
                    }
                    Err(_) => false,
                }
            }
        };

        slot.stopping = false;
        if confirmed {
            // The artifact is only removed once the process that reads it
            // is confirmed gone.
            if let Some(artifact) = slot.artifact.take() {
                let _ = fs::remove_file(&artifact).await;
            }
            self.set_state(ProcessState::Stopped);
            Ok(())
        } else {
            slot.child = Some(child);
            Err(ProcessError::unconfirmed(format!(
                "engine pid {:?} still alive after kill",
                pid
            )))
        }
    }

    fn set_state(&self, new_state: ProcessState) {
        let mut state = self.state.write();
        if *state != new_state {
            debug!("Engine state: {} -> {}", *state, new_state);
            *state = new_state;
        }
    }

    fn diagnostic_tail(&self) -> String {
        let ring = self.diagnostics.lock();
        let skip = ring.len().saturating_sub(DIAG_TAIL);
        ring.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Forward one output stream into the diagnostics ring.
fn spawn_pump<R>(ring: Arc<parking_lot::Mutex<VecDeque<String>>>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("engine: {}", line);
            let mut ring = ring.lock();
            ring.push_back(line);
            while ring.len() > DIAG_CAPACITY {
                ring.pop_front();
            }
        }
    });
}

/// Watch the engine of `generation` for an unexpected exit.
fn spawn_monitor(inner: Arc<Inner>, generation: u64) {
    tokio::spawn(async move {
        let mut poll = interval(MONITOR_INTERVAL);
        loop {
            poll.tick().await;
            let mut slot = inner.slot.lock().await;
            if slot.generation != generation {
                return; // replaced by a newer engine
            }
            let Some(child) = slot.child.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    if slot.stopping {
                        return;
                    }
                    slot.child = None;
                    let artifact = slot.artifact.take();
                    drop(slot);

                    warn!("Engine exited unexpectedly: {}", status);
                    inner.set_state(ProcessState::Crashed);
                    if let Some(path) = artifact {
                        let _ = fs::remove_file(&path).await;
                    }
                    let diagnostic = inner.diagnostic_tail();
                    inner.set_state(ProcessState::Stopped);
                    let _ = inner
                        .events
                        .send(ProcessEvent::Crashed {
                            generation,
                            exit_code: status.code(),
                            diagnostic,
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    warn!("Engine status check failed: {}", e);
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::document::{
        DnsSection, Inbound, LogSection, Outbound, RouteSection,
    };
    use std::path::PathBuf;

    fn test_settings() -> EngineSettings {
        EngineSettings {
            readiness_timeout_ms: 1_500,
            readiness_poll_ms: 50,
            stop_grace_ms: 500,
            kill_confirm_ms: 500,
            ..Default::default()
        }
    }

    fn test_config(port: u16) -> EngineConfig {
        EngineConfig {
            log: LogSection { level: "warn".to_string(), timestamp: false },
            dns: DnsSection {
                servers: Vec::new(),
                rules: Vec::new(),
                strategy: "prefer_ipv4".to_string(),
                final_server: "dns-out".to_string(),
            },
            inbounds: vec![Inbound::http(port)],
            outbounds: vec![Outbound::direct()],
            route: RouteSection {
                rules: Vec::new(),
                rule_set: Vec::new(),
                final_outbound: "direct".to_string(),
                auto_detect_interface: false,
            },
        }
    }

    fn supervisor(settings: EngineSettings) -> (ProcessSupervisor, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (ProcessSupervisor::new(settings, tx), rx)
    }

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Crashed.to_string(), "crashed");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (supervisor, _rx) = supervisor(test_settings());
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let mut settings = test_settings();
        settings.binary = PathBuf::from("/nonexistent/engine");
        let (supervisor, _rx) = supervisor(settings);

        let err = supervisor.start(test_config(0)).await.unwrap_err();
        assert!(matches!(err, ProcessError::BinaryNotFound(_)));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_port_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut settings = test_settings();
        settings.binary = PathBuf::from("/bin/sh");
        let (supervisor, _rx) = supervisor(settings);

        let err = supervisor.start(test_config(port)).await.unwrap_err();
        assert!(matches!(err, ProcessError::PortInUse(p) if p == port));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_early_exit_is_spawn_failure() {
        // `/bin/sh run -c <artifact>` exits immediately: no engine comes up
        let mut settings = test_settings();
        settings.binary = PathBuf::from("/bin/sh");
        let (supervisor, _rx) = supervisor(settings);

        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let err = supervisor.start(test_config(port)).await.unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed(_)));
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_stale_handle_is_noop() {
        let (supervisor, _rx) = supervisor(test_settings());
        let handle = EngineHandle { generation: 42, pid: None };
        supervisor.stop(&handle).await.unwrap();
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }
}
