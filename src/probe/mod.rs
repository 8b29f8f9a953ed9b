//! Health probing
//!
//! Measures reachability and latency for registered profiles without ever
//! touching the live engine process: the active profile is tested through
//! its own local inbound, standby profiles through a direct TCP connect or
//! a short-lived throwaway engine instance.
//!
//! One worker task per registered profile keeps that profile's samples
//! chronological; a semaphore caps how many probes run at once across
//! profiles.

pub mod runner;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{EngineSettings, ProbeSettings};
use crate::profile::{ProfileId, ServerProfile};

/// How a probe resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ProbeOutcome {
    #[serde(rename_all = "camelCase")]
    Success {
        latency_ms: u64,
    },
    /// Deadline passed with no answer
    Timeout,
    /// Refused, reset, bad status and similar
    ConnectError {
        reason: String,
    },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            ProbeOutcome::Success { latency_ms } => Some(*latency_ms),
            _ => None,
        }
    }
}

/// Method reported on samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMethodKind {
    TcpPing,
    UrlTest,
}

/// How a registered profile is probed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    /// Direct TCP connect to the profile's endpoint
    TcpPing,
    /// URL fetch through the running engine's local HTTP inbound
    UrlTestLive { http_port: u16 },
    /// URL fetch through a throwaway engine spawned for this one probe
    UrlTestIsolated,
}

impl ProbeMethod {
    pub fn kind(&self) -> ProbeMethodKind {
        match self {
            ProbeMethod::TcpPing => ProbeMethodKind::TcpPing,
            ProbeMethod::UrlTestLive { .. } | ProbeMethod::UrlTestIsolated => {
                ProbeMethodKind::UrlTest
            }
        }
    }
}

/// One measurement for one profile
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub profile_id: ProfileId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
    pub method: ProbeMethodKind,
}

/// Seam between the controller and the concrete probe machinery. Calls are
/// fire-and-forget; results come back as samples on the channel handed to
/// the implementation at construction.
pub trait ProbeRegistry: Send + Sync {
    /// Start periodic probing of a profile. Registering an already
    /// registered profile replaces its method.
    fn register(&self, profile: ServerProfile, method: ProbeMethod);

    /// Stop probing a profile. Unknown ids are a no-op.
    fn deregister(&self, id: &ProfileId);

    fn deregister_all(&self);

    /// Nudge a registered profile's worker to probe now, off-schedule.
    /// Returns false when the profile is not registered.
    fn trigger(&self, id: &ProfileId) -> bool;

    /// One detached probe, registered or not.
    fn probe_once(&self, profile: ServerProfile, method: ProbeMethod);
}

struct Worker {
    cancel: CancellationToken,
    trigger: Arc<Notify>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Concurrent health prober with one worker per registered profile
pub struct HealthProbe {
    probe: ProbeSettings,
    engine: EngineSettings,
    samples: mpsc::Sender<HealthSample>,
    workers: DashMap<ProfileId, Worker>,
    permits: Arc<Semaphore>,
}

impl HealthProbe {
    /// Create a prober; every sample goes to `samples`. The engine settings
    /// are what throwaway instances for isolated URL tests run with.
    pub fn new(
        probe: ProbeSettings,
        engine: EngineSettings,
        samples: mpsc::Sender<HealthSample>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(probe.max_concurrent));
        HealthProbe { probe, engine, samples, workers: DashMap::new(), permits }
    }

    pub fn registered_count(&self) -> usize {
        self.workers.len()
    }
}

impl ProbeRegistry for HealthProbe {
    fn register(&self, profile: ServerProfile, method: ProbeMethod) {
        let id = profile.id;
        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());

        debug!("Registering probe for {} ({:?})", profile.name, method.kind());
        let task = probe_worker(
            profile,
            method,
            self.probe.clone(),
            self.engine.clone(),
            self.samples.clone(),
            self.permits.clone(),
            cancel.clone(),
            trigger.clone(),
        );
        tokio::spawn(task);

        // Dropping a displaced worker cancels it
        self.workers.insert(id, Worker { cancel, trigger });
    }

    fn deregister(&self, id: &ProfileId) {
        if self.workers.remove(id).is_some() {
            debug!("Deregistered probe for {}", id);
        }
    }

    fn deregister_all(&self) {
        self.workers.clear();
    }

    fn trigger(&self, id: &ProfileId) -> bool {
        match self.workers.get(id) {
            Some(worker) => {
                worker.trigger.notify_one();
                true
            }
            None => false,
        }
    }

    fn probe_once(&self, profile: ServerProfile, method: ProbeMethod) {
        let probe = self.probe.clone();
        let engine = self.engine.clone();
        let samples = self.samples.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let outcome = run_probe(&profile, method, &probe, &engine).await;
            let sample = HealthSample {
                profile_id: profile.id,
                timestamp: Utc::now(),
                outcome,
                method: method.kind(),
            };
            if samples.send(sample).await.is_err() {
                warn!("Sample channel closed, dropping single-shot result");
            }
        });
    }
}

/// Periodic probe loop for one profile. The first probe fires immediately
/// on registration to give ranking a baseline.
#[allow(clippy::too_many_arguments)]
async fn probe_worker(
    profile: ServerProfile,
    method: ProbeMethod,
    probe: ProbeSettings,
    engine: EngineSettings,
    samples: mpsc::Sender<HealthSample>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
) {
    let mut ticker = interval(probe.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
        }

        let Ok(_permit) = permits.acquire().await else {
            return;
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = run_probe(&profile, method, &probe, &engine) => outcome,
        };

        let sample = HealthSample {
            profile_id: profile.id,
            timestamp: Utc::now(),
            outcome,
            method: method.kind(),
        };
        if samples.send(sample).await.is_err() {
            return; // consumer gone
        }
    }
}

async fn run_probe(
    profile: &ServerProfile,
    method: ProbeMethod,
    probe: &ProbeSettings,
    engine: &EngineSettings,
) -> ProbeOutcome {
    match method {
        ProbeMethod::TcpPing => runner::tcp_ping(&profile.endpoint(), probe.tcp_timeout()).await,
        ProbeMethod::UrlTestLive { http_port } => {
            runner::url_test_via(http_port, &probe.test_url, probe.url_timeout()).await
        }
        ProbeMethod::UrlTestIsolated => runner::isolated_url_test(profile, engine, probe).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Protocol, TlsProfile, Transport, TrojanOptions};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn profile_for(server: &str, port: u16) -> ServerProfile {
        ServerProfile {
            id: ProfileId::new(),
            name: format!("{}:{}", server, port),
            group: "test".to_string(),
            server: server.to_string(),
            port,
            protocol: Protocol::Trojan(TrojanOptions {
                password: "secret".to_string(),
                tls: TlsProfile::default(),
                transport: Transport::Tcp,
            }),
        }
    }

    fn fast_settings() -> ProbeSettings {
        ProbeSettings {
            interval_ms: 100,
            tcp_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_method_kind_mapping() {
        assert_eq!(ProbeMethod::TcpPing.kind(), ProbeMethodKind::TcpPing);
        assert_eq!(
            ProbeMethod::UrlTestLive { http_port: 1081 }.kind(),
            ProbeMethodKind::UrlTest
        );
        assert_eq!(ProbeMethod::UrlTestIsolated.kind(), ProbeMethodKind::UrlTest);
    }

    #[test]
    fn test_sample_serialization() {
        let sample = HealthSample {
            profile_id: ProfileId::new(),
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Success { latency_ms: 37 },
            method: ProbeMethodKind::UrlTest,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["latencyMs"], 37);
        assert_eq!(json["method"], "url-test");
    }

    #[tokio::test]
    async fn test_registered_tcp_probe_emits_samples() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (tx, mut rx) = mpsc::channel(16);
        let probe = HealthProbe::new(fast_settings(), EngineSettings::default(), tx);
        let profile = profile_for("127.0.0.1", port);
        let id = profile.id;
        probe.register(profile, ProbeMethod::TcpPing);
        assert_eq!(probe.registered_count(), 1);

        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.profile_id, id);
        assert_eq!(sample.method, ProbeMethodKind::TcpPing);
        assert!(sample.outcome.is_success());

        probe.deregister(&id);
        assert_eq!(probe.registered_count(), 0);
        assert!(!probe.trigger(&id));
    }

    #[tokio::test]
    async fn test_probe_once_reports_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener); // nothing listens here now

        let (tx, mut rx) = mpsc::channel(4);
        let probe = HealthProbe::new(fast_settings(), EngineSettings::default(), tx);
        probe.probe_once(profile_for("127.0.0.1", port), ProbeMethod::TcpPing);

        let sample = rx.recv().await.unwrap();
        assert!(matches!(sample.outcome, ProbeOutcome::ConnectError { .. }));
        assert_eq!(probe.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_runs_probe_off_schedule() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut settings = fast_settings();
        settings.interval_ms = 60_000; // scheduled ticks stay out of the way
        let (tx, mut rx) = mpsc::channel(16);
        let probe = HealthProbe::new(settings, EngineSettings::default(), tx);
        let profile = profile_for("127.0.0.1", port);
        let id = profile.id;
        probe.register(profile, ProbeMethod::TcpPing);

        // registration baseline probe
        let first = rx.recv().await.unwrap();
        assert!(first.outcome.is_success());

        assert!(probe.trigger(&id));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.profile_id, id);
    }
}
