//! Probe primitives
//!
//! The actual measurements: direct TCP connect, URL fetch through a local
//! HTTP proxy inbound, and the throwaway engine harness that gives standby
//! profiles a real protocol handshake without touching the live process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::{EngineSettings, ProbeSettings};
use crate::engine::generator::probe_document;
use crate::probe::ProbeOutcome;
use crate::profile::ServerProfile;
use crate::{Error, Result};

/// Measure TCP connect latency to `endpoint` (`host:port`).
pub async fn tcp_ping(endpoint: &str, deadline: Duration) -> ProbeOutcome {
    let start = Instant::now();
    match timeout(deadline, TcpStream::connect(endpoint)).await {
        Ok(Ok(_stream)) => ProbeOutcome::Success {
            latency_ms: start.elapsed().as_millis() as u64,
        },
        Ok(Err(e)) => ProbeOutcome::ConnectError { reason: e.to_string() },
        Err(_) => ProbeOutcome::Timeout,
    }
}

/// Fetch `url` through the HTTP proxy inbound on `127.0.0.1:http_port`.
/// 200 and 204 count as success; latency covers the whole request.
pub async fn url_test_via(http_port: u16, url: &str, deadline: Duration) -> ProbeOutcome {
    let client = match proxied_client(http_port, deadline) {
        Ok(client) => client,
        Err(e) => return ProbeOutcome::ConnectError { reason: e.to_string() },
    };

    let start = Instant::now();
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == 200 || status == 204 {
                ProbeOutcome::Success {
                    latency_ms: start.elapsed().as_millis() as u64,
                }
            } else {
                ProbeOutcome::ConnectError { reason: format!("status {}", status) }
            }
        }
        Err(e) if e.is_timeout() => ProbeOutcome::Timeout,
        Err(e) => ProbeOutcome::ConnectError { reason: e.to_string() },
    }
}

/// Full URL test for a standby profile through its own throwaway engine.
/// The instance and its config artifact are gone before this returns.
pub async fn isolated_url_test(
    profile: &ServerProfile,
    engine: &EngineSettings,
    probe: &ProbeSettings,
) -> ProbeOutcome {
    let instance = match ThrowawayEngine::launch(profile, engine).await {
        Ok(instance) => instance,
        Err(e) => {
            return ProbeOutcome::ConnectError { reason: format!("probe engine: {}", e) }
        }
    };
    let outcome = url_test_via(instance.http_port(), &probe.test_url, probe.url_timeout()).await;
    instance.close().await;
    outcome
}

/// Public IP as seen through the live proxy. Cosmetic for the UI; callers
/// log failures and move on.
pub async fn external_ip(http_port: u16, url: &str, deadline: Duration) -> Result<String> {
    let client = proxied_client(http_port, deadline)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::internal(format!("external ip request: {}", e)))?;
    let text = response
        .text()
        .await
        .map_err(|e| Error::internal(format!("external ip body: {}", e)))?;
    Ok(text.trim().to_string())
}

/// Ask the OS for a free local port.
pub async fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

fn proxied_client(http_port: u16, deadline: Duration) -> Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(format!("http://127.0.0.1:{}", http_port))
        .map_err(|e| Error::internal(format!("probe proxy: {}", e)))?;
    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(deadline)
        .build()
        .map_err(|e| Error::internal(format!("probe client: {}", e)))
}

/// A short-lived engine instance carrying one standby profile, with a
/// single HTTP inbound on an ephemeral port. Exists only for the duration
/// of one measurement.
#[derive(Debug)]
pub struct ThrowawayEngine {
    child: Child,
    artifact: PathBuf,
    port: u16,
}

impl ThrowawayEngine {
    /// Spawn an engine for `profile` and wait until its inbound accepts.
    pub async fn launch(profile: &ServerProfile, settings: &EngineSettings) -> Result<Self> {
        let port = free_port()
            .await
            .map_err(|e| Error::internal(format!("allocate probe port: {}", e)))?;
        let config = probe_document(profile, port)?;
        let json = config.to_json()?;

        let dir = settings.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        let artifact = dir.join(format!("probe-{}.json", uuid::Uuid::new_v4()));
        fs::write(&artifact, json)
            .await
            .map_err(|e| Error::internal(format!("write probe artifact: {}", e)))?;

        let mut cmd = Command::new(&settings.binary);
        cmd.arg("run")
            .arg("-c")
            .arg(&artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!("Launching probe engine for {} on port {}", profile.name, port);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_file(&artifact).await;
                return Err(Error::internal(format!(
                    "spawn probe engine {:?}: {}",
                    settings.binary, e
                )));
            }
        };

        let deadline = Instant::now() + settings.readiness_timeout();
        loop {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    let _ = fs::remove_file(&artifact).await;
                    return Err(Error::internal(format!(
                        "probe engine exited during startup ({})",
                        status
                    )));
                }
                Err(e) => {
                    let _ = child.kill().await;
                    let _ = fs::remove_file(&artifact).await;
                    return Err(Error::internal(format!("probe engine status: {}", e)));
                }
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                let _ = fs::remove_file(&artifact).await;
                return Err(Error::internal(format!(
                    "probe engine not ready on port {} within {:?}",
                    port,
                    settings.readiness_timeout()
                )));
            }
            sleep(settings.readiness_poll()).await;
        }

        Ok(ThrowawayEngine { child, artifact, port })
    }

    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Tear the instance down and remove its artifact.
    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Probe engine kill failed: {}", e);
        }
        let _ = fs::remove_file(&self.artifact).await;
        // Drop skips its fallback cleanup once the artifact path is cleared
        self.artifact = PathBuf::new();
    }
}

impl Drop for ThrowawayEngine {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the artifact needs explicit removal
        // when a probe future is cancelled mid-measurement
        if self.artifact.as_os_str().is_empty() {
            return;
        }
        let _ = std::fs::remove_file(&self.artifact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileId, Protocol, ShadowsocksOptions};

    fn profile() -> ServerProfile {
        ServerProfile {
            id: ProfileId::new(),
            name: "probe-target".to_string(),
            group: "test".to_string(),
            server: "example.com".to_string(),
            port: 8388,
            protocol: Protocol::Shadowsocks(ShadowsocksOptions {
                method: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_tcp_ping_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let outcome = tcp_ping(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(outcome.is_success());
        assert!(outcome.latency_ms().is_some());
    }

    #[tokio::test]
    async fn test_tcp_ping_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = tcp_ping(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(matches!(outcome, ProbeOutcome::ConnectError { .. }));
    }

    #[tokio::test]
    async fn test_free_port_is_bindable() {
        let port = free_port().await.unwrap();
        assert_ne!(port, 0);
        let listener = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_throwaway_launch_missing_binary() {
        let settings = EngineSettings {
            binary: PathBuf::from("/nonexistent/engine"),
            readiness_timeout_ms: 500,
            readiness_poll_ms: 50,
            ..Default::default()
        };
        let err = ThrowawayEngine::launch(&profile(), &settings).await.unwrap_err();
        assert!(err.to_string().contains("probe engine"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_isolated_url_test_surfaces_launch_failure() {
        // `/bin/true run -c ...` exits immediately, so the harness reports
        // the launch failure instead of hanging on readiness
        let engine = EngineSettings {
            binary: PathBuf::from("/bin/true"),
            readiness_timeout_ms: 1_000,
            readiness_poll_ms: 50,
            ..Default::default()
        };
        let probe = ProbeSettings::default();
        let outcome = isolated_url_test(&profile(), &engine, &probe).await;
        match outcome {
            ProbeOutcome::ConnectError { reason } => {
                assert!(reason.contains("probe engine"), "reason: {}", reason)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
