//! Server profiles
//!
//! A profile is an immutable remote endpoint plus protocol credentials,
//! produced by the external subscription/import subsystem. The core only
//! reads profiles; identity (and equality) is the `id` field, so renaming
//! or editing a server elsewhere never confuses an in-flight connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

use crate::config::NetworkSettings;
use crate::{Error, Result};

/// Stable profile identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(Uuid);

impl ProfileId {
    pub fn new() -> Self {
        ProfileId(Uuid::new_v4())
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProfileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(ProfileId)
            .map_err(|e| Error::parse(format!("invalid profile id '{}': {}", s, e)))
    }
}

/// A remote server endpoint with its protocol options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub server: String,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: Protocol,
}

impl ServerProfile {
    /// `host:port` form used by TCP probes and log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }
}

impl PartialEq for ServerProfile {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServerProfile {}

impl Hash for ServerProfile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Protocol-specific options. Adding a protocol means adding a variant here
/// and one match arm in the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Protocol {
    Vless(VlessOptions),
    Vmess(VmessOptions),
    Shadowsocks(ShadowsocksOptions),
    Trojan(TrojanOptions),
    Hysteria2(Hysteria2Options),
    Tuic(TuicOptions),
    Wireguard(WireguardOptions),
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Vless(_) => "vless",
            Protocol::Vmess(_) => "vmess",
            Protocol::Shadowsocks(_) => "shadowsocks",
            Protocol::Trojan(_) => "trojan",
            Protocol::Hysteria2(_) => "hysteria2",
            Protocol::Tuic(_) => "tuic",
            Protocol::Wireguard(_) => "wireguard",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TLS options shared by the TCP-based protocols. Presence means TLS is on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsProfile {
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// uTLS fingerprint, e.g. "chrome".
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub reality: Option<RealityKeys>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealityKeys {
    pub public_key: String,
    #[serde(default)]
    pub short_id: Option<String>,
}

/// Stream transport carried under the protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Ws {
        path: String,
        #[serde(default)]
        host: Option<String>,
    },
}

impl Transport {
    pub fn is_ws(&self) -> bool {
        matches!(self, Transport::Ws { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlessOptions {
    pub uuid: String,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsProfile>,
    #[serde(default)]
    pub transport: Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessOptions {
    pub uuid: String,
    #[serde(default)]
    pub alter_id: u16,
    #[serde(default = "default_vmess_security")]
    pub security: String,
    #[serde(default)]
    pub tls: Option<TlsProfile>,
    #[serde(default)]
    pub transport: Transport,
}

fn default_vmess_security() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowsocksOptions {
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanOptions {
    pub password: String,
    /// Trojan is always TLS; these options refine the handshake.
    #[serde(default)]
    pub tls: TlsProfile,
    #[serde(default)]
    pub transport: Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hysteria2Options {
    pub password: String,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub obfs: Option<ObfsOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfsOptions {
    /// Obfuscation scheme, e.g. "salamander".
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuicOptions {
    pub uuid: String,
    pub password: String,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default = "default_congestion_control")]
    pub congestion_control: String,
    #[serde(default = "default_udp_relay_mode")]
    pub udp_relay_mode: String,
    #[serde(default)]
    pub alpn: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
}

fn default_congestion_control() -> String {
    "bbr".to_string()
}

fn default_udp_relay_mode() -> String {
    "native".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardOptions {
    pub private_key: String,
    pub local_address: Vec<String>,
    pub peer_public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub mtu: Option<u16>,
}

/// Read-only view of the profile list. Refreshing the list is the owning
/// subsystem's concern; the core snapshots it at each convergence.
pub trait ProfileSource: Send + Sync {
    /// Profiles belonging to a group, in the source's order.
    fn list(&self, group: &str) -> Vec<ServerProfile>;

    fn find(&self, id: &ProfileId) -> Option<ServerProfile>;
}

/// Read-only view of the current network settings.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> NetworkSettings;
}

/// In-memory profile source. The embedding application replaces the list
/// when subscriptions refresh; in-flight connections keep their snapshot.
pub struct StaticProfileSource {
    profiles: parking_lot::RwLock<Vec<ServerProfile>>,
}

impl StaticProfileSource {
    pub fn new(profiles: Vec<ServerProfile>) -> Self {
        StaticProfileSource { profiles: parking_lot::RwLock::new(profiles) }
    }

    pub fn replace(&self, profiles: Vec<ServerProfile>) {
        *self.profiles.write() = profiles;
    }

    pub fn all(&self) -> Vec<ServerProfile> {
        self.profiles.read().clone()
    }
}

impl ProfileSource for StaticProfileSource {
    fn list(&self, group: &str) -> Vec<ServerProfile> {
        self.profiles
            .read()
            .iter()
            .filter(|p| p.group == group)
            .cloned()
            .collect()
    }

    fn find(&self, id: &ProfileId) -> Option<ServerProfile> {
        self.profiles.read().iter().find(|p| p.id == *id).cloned()
    }
}

/// In-memory settings source backed by a lock; `snapshot` clones.
pub struct SharedSettings {
    inner: parking_lot::RwLock<NetworkSettings>,
}

impl SharedSettings {
    pub fn new(settings: NetworkSettings) -> Self {
        SharedSettings { inner: parking_lot::RwLock::new(settings) }
    }

    pub fn set(&self, settings: NetworkSettings) {
        *self.inner.write() = settings;
    }
}

impl SettingsSource for SharedSettings {
    fn snapshot(&self) -> NetworkSettings {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_profile(name: &str, group: &str) -> ServerProfile {
        ServerProfile {
            id: ProfileId::new(),
            name: name.to_string(),
            group: group.to_string(),
            server: "example.com".to_string(),
            port: 443,
            protocol: Protocol::Trojan(TrojanOptions {
                password: "secret".to_string(),
                tls: TlsProfile::default(),
                transport: Transport::Tcp,
            }),
        }
    }

    #[test]
    fn test_equality_by_id_only() {
        let a = make_profile("a", "eu");
        let mut b = a.clone();
        b.name = "renamed".to_string();
        b.server = "other.example.com".to_string();
        assert_eq!(a, b);

        let c = make_profile("a", "eu");
        assert_ne!(a, c);
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let json = r#"{
            "id": "6f9619ff-8b86-d011-b42d-00c04fc964ff",
            "name": "frankfurt-1",
            "group": "eu",
            "server": "fra.example.com",
            "port": 443,
            "protocol": "vless",
            "uuid": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
            "flow": "xtls-rprx-vision",
            "tls": {"sni": "fra.example.com", "fingerprint": "chrome"}
        }"#;
        let profile: ServerProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.protocol_name(), "vless");
        assert_eq!(profile.endpoint(), "fra.example.com:443");
        match &profile.protocol {
            Protocol::Vless(o) => {
                assert_eq!(o.flow.as_deref(), Some("xtls-rprx-vision"));
                assert!(o.tls.is_some());
                assert!(!o.transport.is_ws());
            }
            other => panic!("unexpected protocol: {}", other),
        }

        let back = serde_json::to_value(&profile).unwrap();
        assert_eq!(back["protocol"], "vless");
        assert_eq!(back["uuid"], "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
    }

    #[test]
    fn test_ws_transport_parse() {
        let json = r#"{
            "id": "6f9619ff-8b86-d011-b42d-00c04fc964ff",
            "name": "ams-ws",
            "server": "ams.example.com",
            "port": 8443,
            "protocol": "vmess",
            "uuid": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
            "transport": {"type": "ws", "path": "/stream", "host": "cdn.example.com"}
        }"#;
        let profile: ServerProfile = serde_json::from_str(json).unwrap();
        match &profile.protocol {
            Protocol::Vmess(o) => {
                assert_eq!(o.security, "auto");
                assert_eq!(o.alter_id, 0);
                assert!(o.transport.is_ws());
            }
            other => panic!("unexpected protocol: {}", other),
        }
    }

    #[test]
    fn test_static_source_group_filter() {
        let a = make_profile("a", "eu");
        let b = make_profile("b", "eu");
        let c = make_profile("c", "asia");
        let source = StaticProfileSource::new(vec![a.clone(), b.clone(), c.clone()]);

        let eu = source.list("eu");
        assert_eq!(eu.len(), 2);
        assert_eq!(eu[0].id, a.id);
        assert_eq!(eu[1].id, b.id);

        assert_eq!(source.find(&c.id).unwrap().name, "c");
        assert!(source.find(&ProfileId::new()).is_none());
    }
}
