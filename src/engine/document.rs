//! Engine configuration document
//!
//! Typed model of the JSON dialect the external engine binary consumes:
//! log, DNS, inbounds, outbounds, route. Field order is fixed by these
//! struct definitions and every map is ordered, so serializing the same
//! document twice yields identical bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Outbound tag of the active proxy.
pub const TAG_PROXY: &str = "proxy-out";
/// Outbound tag for direct connections.
pub const TAG_DIRECT: &str = "direct";
/// Outbound tag for blocked connections.
pub const TAG_BLOCK: &str = "block";
/// Outbound tag handling hijacked DNS queries.
pub const TAG_DNS: &str = "dns";
/// DNS server tag resolved through the tunnel.
pub const TAG_DNS_REMOTE: &str = "dns-out";
/// DNS server tag resolved directly.
pub const TAG_DNS_DIRECT: &str = "dns_direct";

fn is_false(v: &bool) -> bool {
    !*v
}

/// Fully-resolved engine configuration. Value type: one instance per
/// connection attempt, never shared or mutated after generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
}

impl EngineConfig {
    /// Serialize to the JSON the engine binary reads.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }

    /// Local TCP ports of all inbounds in this document.
    pub fn inbound_ports(&self) -> Vec<u16> {
        self.inbounds.iter().map(|i| i.listen_port()).collect()
    }

    /// Port of the HTTP inbound, used for readiness checks and URL tests.
    pub fn http_port(&self) -> Option<u16> {
        self.inbounds.iter().find_map(|i| match i {
            Inbound::Http { listen_port, .. } => Some(*listen_port),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<DnsRule>,
    pub strategy: String,
    #[serde(rename = "final")]
    pub final_server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    pub server: String,
}

/// Local inbound listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun {
        tag: String,
        interface_name: String,
        inet4_address: String,
        mtu: u16,
        auto_route: bool,
        strict_route: bool,
        endpoint_independent_nat: bool,
    },
    Socks {
        tag: String,
        listen: String,
        listen_port: u16,
    },
    Http {
        tag: String,
        listen: String,
        listen_port: u16,
    },
}

impl Inbound {
    pub fn socks(port: u16) -> Self {
        Inbound::Socks {
            tag: "socks-in".to_string(),
            listen: "127.0.0.1".to_string(),
            listen_port: port,
        }
    }

    pub fn http(port: u16) -> Self {
        Inbound::Http {
            tag: "http-in".to_string(),
            listen: "127.0.0.1".to_string(),
            listen_port: port,
        }
    }

    pub fn tun() -> Self {
        Inbound::Tun {
            tag: "tun-in".to_string(),
            interface_name: "helm_tun".to_string(),
            inet4_address: "172.19.0.1/24".to_string(),
            mtu: 9000,
            auto_route: true,
            strict_route: true,
            endpoint_independent_nat: true,
        }
    }

    /// Listen port; the TUN inbound has none.
    pub fn listen_port(&self) -> u16 {
        match self {
            Inbound::Tun { .. } => 0,
            Inbound::Socks { listen_port, .. } => *listen_port,
            Inbound::Http { listen_port, .. } => *listen_port,
        }
    }
}

/// Outbound definition, tagged by protocol the way the engine expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Direct { tag: String },
    Block { tag: String },
    Dns { tag: String },
    Vless(VlessOutbound),
    Vmess(VmessOutbound),
    Shadowsocks(ShadowsocksOutbound),
    Trojan(TrojanOutbound),
    Hysteria2(Hysteria2Outbound),
    Tuic(TuicOutbound),
    Wireguard(WireguardOutbound),
}

impl Outbound {
    pub fn direct() -> Self {
        Outbound::Direct { tag: TAG_DIRECT.to_string() }
    }

    pub fn block() -> Self {
        Outbound::Block { tag: TAG_BLOCK.to_string() }
    }

    pub fn dns() -> Self {
        Outbound::Dns { tag: TAG_DNS.to_string() }
    }

    pub fn tag(&self) -> &str {
        match self {
            Outbound::Direct { tag }
            | Outbound::Block { tag }
            | Outbound::Dns { tag } => tag,
            Outbound::Vless(o) => &o.tag,
            Outbound::Vmess(o) => &o.tag,
            Outbound::Shadowsocks(o) => &o.tag,
            Outbound::Trojan(o) => &o.tag,
            Outbound::Hysteria2(o) => &o.tag,
            Outbound::Tuic(o) => &o.tag,
            Outbound::Wireguard(o) => &o.tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<WsTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplex: Option<MuxBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub security: String,
    pub alter_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<WsTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplex: Option<MuxBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub method: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplex: Option<MuxBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub tls: TlsBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<WsTransport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplex: Option<MuxBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hysteria2Outbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub up_mbps: u32,
    pub down_mbps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs: Option<ObfsBlock>,
    pub tls: TlsBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuicOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub password: String,
    pub congestion_control: String,
    pub udp_relay_mode: String,
    pub tls: TlsBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireguardOutbound {
    pub tag: String,
    pub local_address: Vec<String>,
    pub private_key: String,
    pub mtu: u16,
    pub peers: Vec<WireguardPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireguardPeer {
    pub server: String,
    pub server_port: u16,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_shared_key: Option<String>,
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsBlock {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utls: Option<UtlsBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<FragmentBlock>,
}

impl TlsBlock {
    pub fn new(server_name: String, insecure: bool) -> Self {
        TlsBlock {
            enabled: true,
            server_name: Some(server_name),
            insecure,
            alpn: Vec::new(),
            utls: None,
            reality: None,
            fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtlsBlock {
    pub enabled: bool,
    pub fingerprint: String,
}

impl UtlsBlock {
    pub fn fingerprint(fp: &str) -> Self {
        UtlsBlock { enabled: true, fingerprint: fp.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealityBlock {
    pub enabled: bool,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

/// TLS record fragmentation, expressed as inclusive ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentBlock {
    pub size: [u16; 2],
    pub sleep: [u16; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsTransport {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl WsTransport {
    pub fn new(path: String, host: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), host);
        WsTransport { kind: "ws".to_string(), path, headers }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxBlock {
    pub enabled: bool,
    pub protocol: String,
    pub max_streams: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub padding: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObfsBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSection {
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_set: Vec<RuleSet>,
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub auto_detect_interface: bool,
}

/// One routing rule; only the populated matchers are serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocol: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_cidr: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_set: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ip_is_private: bool,
    pub outbound: String,
}

/// Remote binary rule-set reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    pub url: String,
    pub download_detour: String,
}

impl RuleSet {
    pub fn remote(tag: String, url: String) -> Self {
        RuleSet {
            tag,
            kind: "remote".to_string(),
            format: "binary".to_string(),
            url,
            download_detour: TAG_DIRECT.to_string(),
        }
    }
}
