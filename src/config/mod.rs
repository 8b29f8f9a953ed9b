//! Configuration module
//!
//! Tunables for the connection core. Everything has a default so an empty
//! file (or no file) yields a working configuration; the embedding
//! application overrides what it needs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use url::Url;

use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Engine process supervision
    pub engine: EngineSettings,

    /// Health probing
    pub probe: ProbeSettings,

    /// Automatic failover
    pub failover: FailoverSettings,

    /// Network settings applied to generated engine configs
    pub network: NetworkSettings,
}

impl CoreConfig {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: CoreConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: CoreConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.probe.max_concurrent == 0 {
            return Err(Error::settings("probe.max-concurrent must be at least 1"));
        }
        if self.probe.interval_ms == 0 {
            return Err(Error::settings("probe.interval-ms must be positive"));
        }
        Url::parse(&self.probe.test_url)
            .map_err(|e| Error::settings(format!("probe.test-url: {}", e)))?;
        Url::parse(&self.probe.external_ip_url)
            .map_err(|e| Error::settings(format!("probe.external-ip-url: {}", e)))?;

        if self.failover.failure_threshold == 0 {
            return Err(Error::settings("failover.failure-threshold must be at least 1"));
        }
        if self.failover.exclusion_threshold == 0 {
            return Err(Error::settings("failover.exclusion-threshold must be at least 1"));
        }
        if !(self.failover.ema_alpha > 0.0 && self.failover.ema_alpha <= 1.0) {
            return Err(Error::settings("failover.ema-alpha must be in (0, 1]"));
        }

        if self.engine.readiness_poll_ms == 0 {
            return Err(Error::settings("engine.readiness-poll-ms must be positive"));
        }

        Ok(())
    }
}

/// Engine process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineSettings {
    /// Engine binary; bare names are resolved through PATH
    pub binary: PathBuf,

    /// Directory for generated config artifacts (system temp when unset)
    pub work_dir: Option<PathBuf>,

    /// How long to wait for the engine to accept connections after spawn
    pub readiness_timeout_ms: u64,

    /// Poll cadence during the readiness wait
    pub readiness_poll_ms: u64,

    /// Grace period between the polite termination request and the hard kill
    pub stop_grace_ms: u64,

    /// How long to wait for exit confirmation after the hard kill
    pub kill_confirm_ms: u64,

    /// Extra start attempts before giving a profile up as unstartable
    pub start_retries: u32,

    /// Delay between start attempts
    pub start_retry_delay_ms: u64,
}

impl EngineSettings {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_confirm(&self) -> Duration {
        Duration::from_millis(self.kill_confirm_ms)
    }

    pub fn start_retry_delay(&self) -> Duration {
        Duration::from_millis(self.start_retry_delay_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            binary: PathBuf::from("sing-box"),
            work_dir: None,
            readiness_timeout_ms: 5_000,
            readiness_poll_ms: 100,
            stop_grace_ms: 5_000,
            kill_confirm_ms: 2_000,
            start_retries: 2,
            start_retry_delay_ms: 500,
        }
    }
}

/// Health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProbeSettings {
    /// Cadence of scheduled probes per registered profile
    pub interval_ms: u64,

    /// TCP connect timeout
    pub tcp_timeout_ms: u64,

    /// End-to-end URL test timeout
    pub url_timeout_ms: u64,

    /// URL fetched through the proxy for URL tests; 200 and 204 both pass
    pub test_url: String,

    /// Plain-text what-is-my-ip endpoint used by the exit check
    pub external_ip_url: String,

    /// Upper bound on concurrently running probes
    pub max_concurrent: usize,

    /// How standby profiles are probed
    pub sibling_method: SiblingProbeMethod,
}

impl ProbeSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn url_timeout(&self) -> Duration {
        Duration::from_millis(self.url_timeout_ms)
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            interval_ms: 30_000,
            tcp_timeout_ms: 2_000,
            url_timeout_ms: 5_000,
            test_url: "http://www.gstatic.com/generate_204".to_string(),
            external_ip_url: "https://api.ipify.org".to_string(),
            max_concurrent: 8,
            sibling_method: SiblingProbeMethod::UrlTest,
        }
    }
}

/// Probe method for standby (non-active) profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiblingProbeMethod {
    /// Launch a throwaway engine and fetch the test URL through it
    UrlTest,
    /// TCP connect to the profile's endpoint
    TcpPing,
}

/// Failover settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FailoverSettings {
    /// Initial auto-failover state; toggled at runtime via the handle
    pub enabled: bool,

    /// Consecutive bad samples on the active profile that trigger failover
    pub failure_threshold: u32,

    /// Consecutive failures after which a candidate is skipped entirely
    pub exclusion_threshold: u32,

    /// Latency EMA smoothing factor
    pub ema_alpha: f64,

    /// First retry backoff for a failing candidate
    pub backoff_base_ms: u64,

    /// Backoff ceiling
    pub backoff_max_ms: u64,
}

impl FailoverSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for FailoverSettings {
    fn default() -> Self {
        FailoverSettings {
            enabled: false,
            failure_threshold: 3,
            exclusion_threshold: 3,
            ema_alpha: 0.3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
        }
    }
}

/// User-facing network settings folded into every generated engine config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkSettings {
    /// Remote resolver first, direct resolver second
    pub dns_servers: Vec<String>,

    /// Domains routed around the tunnel; `geosite:` prefix selects a rule set
    pub bypass_domains: Vec<String>,

    /// CIDRs routed around the tunnel; `geoip:` prefix selects a rule set,
    /// `geoip:private` matches RFC 1918 space
    pub bypass_ips: Vec<String>,

    /// Routing mode
    pub mode: ConnectionMode,

    /// Add a TUN inbound for system-wide capture
    pub tun: bool,

    /// Local SOCKS5 listener port
    pub socks_port: u16,

    /// Local HTTP proxy listener port
    pub http_port: u16,

    /// Stream multiplexing for TCP-based protocols
    pub mux: MuxSettings,

    /// TLS ClientHello fragmentation
    pub tls_fragment: TlsFragmentSettings,

    /// Hysteria2 bandwidth hints in Mbps
    pub hysteria2_up_mbps: Option<u32>,
    pub hysteria2_down_mbps: Option<u32>,

    /// User routing rules, applied before the bypass lists
    pub routing_rules: Vec<RoutingRule>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            bypass_domains: Vec::new(),
            bypass_ips: Vec::new(),
            mode: ConnectionMode::Rule,
            tun: false,
            socks_port: 1080,
            http_port: 1081,
            mux: MuxSettings::default(),
            tls_fragment: TlsFragmentSettings::default(),
            hysteria2_up_mbps: None,
            hysteria2_down_mbps: None,
            routing_rules: Vec::new(),
        }
    }
}

/// Routing mode (rule, global)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Bypass lists and user rules apply
    Rule,
    /// Everything except hijacked DNS goes through the tunnel
    Global,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Rule => write!(f, "rule"),
            ConnectionMode::Global => write!(f, "global"),
        }
    }
}

/// Mux settings for vless/vmess/shadowsocks/trojan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MuxSettings {
    pub enabled: bool,

    /// smux, yamux or h2mux
    pub protocol: String,

    pub max_streams: u32,

    pub padding: bool,
}

impl Default for MuxSettings {
    fn default() -> Self {
        MuxSettings {
            enabled: false,
            protocol: "h2mux".to_string(),
            max_streams: 8,
            padding: false,
        }
    }
}

/// TLS ClientHello fragmentation, ranges as "min-max" strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TlsFragmentSettings {
    pub enabled: bool,

    /// Fragment size range in bytes
    pub size: String,

    /// Inter-fragment sleep range in milliseconds
    pub sleep: String,
}

impl Default for TlsFragmentSettings {
    fn default() -> Self {
        TlsFragmentSettings {
            enabled: false,
            size: "10-100".to_string(),
            sleep: "10-100".to_string(),
        }
    }
}

/// A single user routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// What the rule matches on
    #[serde(rename = "type")]
    pub kind: RuleKind,

    /// Domain, CIDR, process name or rule-set code depending on `type`
    pub value: String,

    /// Where matching traffic goes
    #[serde(rename = "action")]
    pub outlet: RuleOutlet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Domain,
    Ip,
    Process,
    Geosite,
    Geoip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOutlet {
    Proxy,
    Direct,
    Block,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CoreConfig::default();
        assert_eq!(config.network.socks_port, 1080);
        assert_eq!(config.network.http_port, 1081);
        assert_eq!(config.network.dns_servers, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(config.probe.max_concurrent, 8);
        assert_eq!(config.failover.failure_threshold, 3);
        assert!(!config.failover.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
engine:
  binary: /usr/local/bin/sing-box
  stop-grace-ms: 3000
probe:
  interval-ms: 10000
  sibling-method: tcp-ping
failover:
  enabled: true
  failure-threshold: 5
network:
  mode: global
  tun: true
  bypass-domains:
    - geosite:ir
    - internal.example.com
  routing-rules:
    - type: process
      value: torrent-client
      action: direct
"#;
        let config = CoreConfig::from_str(yaml).unwrap();
        assert_eq!(config.engine.binary, PathBuf::from("/usr/local/bin/sing-box"));
        assert_eq!(config.engine.stop_grace(), Duration::from_secs(3));
        assert_eq!(config.probe.interval(), Duration::from_secs(10));
        assert_eq!(config.probe.sibling_method, SiblingProbeMethod::TcpPing);
        assert!(config.failover.enabled);
        assert_eq!(config.failover.failure_threshold, 5);
        assert_eq!(config.network.mode, ConnectionMode::Global);
        assert!(config.network.tun);
        assert_eq!(config.network.bypass_domains.len(), 2);
        assert_eq!(
            config.network.routing_rules,
            vec![RoutingRule {
                kind: RuleKind::Process,
                value: "torrent-client".to_string(),
                outlet: RuleOutlet::Direct,
            }]
        );
    }

    #[test]
    fn test_validate_rejects_bad_knobs() {
        let mut config = CoreConfig::default();
        config.failover.ema_alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.failover.ema_alpha = 1.5;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.probe.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.probe.test_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.failover.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_yaml_is_defaults() {
        let config = CoreConfig::from_str("{}").unwrap();
        assert_eq!(config.engine.binary, PathBuf::from("sing-box"));
        assert_eq!(config.probe.test_url, "http://www.gstatic.com/generate_204");
    }
}
