//! Engine config generation
//!
//! Maps a server profile plus the current network settings onto a complete
//! engine document. Pure and deterministic: no I/O, no clocks, no random
//! tags, so the same inputs always serialize to the same bytes.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use url::Url;

use crate::common::ConfigError;
use crate::config::{ConnectionMode, NetworkSettings, RuleKind, RuleOutlet, TlsFragmentSettings};
use crate::engine::document::{
    DnsRule, DnsSection, DnsServer, EngineConfig, FragmentBlock, Hysteria2Outbound, Inbound,
    LogSection, MuxBlock, ObfsBlock, Outbound, RealityBlock, RouteRule, RouteSection, RuleSet,
    ShadowsocksOutbound, TlsBlock, TrojanOutbound, TuicOutbound, UtlsBlock, VlessOutbound,
    VmessOutbound, WireguardOutbound, WireguardPeer, WsTransport, TAG_BLOCK, TAG_DIRECT, TAG_DNS,
    TAG_DNS_DIRECT, TAG_DNS_REMOTE, TAG_PROXY,
};
use crate::profile::{Protocol, ServerProfile, TlsProfile, Transport};

const GEOIP_RULE_SET_URL: &str =
    "https://raw.githubusercontent.com/soffchen/sing-geoip/rule-set/geoip-{code}.srs";
const GEOSITE_RULE_SET_URL: &str =
    "https://raw.githubusercontent.com/soffchen/sing-geosite/rule-set/{code}.srs";
const IRAN_GEOIP_RULE_SET_URL: &str =
    "https://raw.githubusercontent.com/Chocolate4U/Iran-sing-box-rules/rule-set/geoip-ir.srs";
const IRAN_GEOSITE_RULE_SET_URL: &str =
    "https://raw.githubusercontent.com/Chocolate4U/Iran-sing-box-rules/rule-set/geosite-ir.srs";

/// Prefix on bypass entries that selects a remote rule set.
const GEOSITE_PREFIX: &str = "geosite:";
const GEOIP_PREFIX: &str = "geoip:";

const DEFAULT_REMOTE_DNS: &str = "1.1.1.1";
const DEFAULT_DIRECT_DNS: &str = "8.8.8.8";

const DEFAULT_HY2_UP_MBPS: u32 = 50;
const DEFAULT_HY2_DOWN_MBPS: u32 = 100;
const WIREGUARD_MTU: u16 = 1420;

/// Build the full engine document for a profile under the given settings.
pub fn generate(
    profile: &ServerProfile,
    settings: &NetworkSettings,
) -> Result<EngineConfig, ConfigError> {
    validate_settings(settings)?;
    let fragment = fragment_block(&settings.tls_fragment)?;

    let proxy = build_proxy_outbound(profile, settings, fragment.as_ref())?;
    let (route, block_referenced) = build_route(settings);

    let mut outbounds = vec![Outbound::direct(), proxy, Outbound::dns()];
    if block_referenced {
        outbounds.push(Outbound::block());
    }

    Ok(EngineConfig {
        log: LogSection { level: "info".to_string(), timestamp: true },
        dns: build_dns(settings),
        inbounds: build_inbounds(settings),
        outbounds,
        route,
    })
}

/// Build the lean document used by isolated URL probes: one HTTP inbound on
/// `local_port`, no rule sets (nothing to download), quiet logging.
pub fn probe_document(
    profile: &ServerProfile,
    local_port: u16,
) -> Result<EngineConfig, ConfigError> {
    if local_port == 0 {
        return Err(ConfigError::network("probe inbound port is zero"));
    }
    let settings = NetworkSettings::default();
    let proxy = build_proxy_outbound(profile, &settings, None)?;

    Ok(EngineConfig {
        log: LogSection { level: "warn".to_string(), timestamp: false },
        dns: DnsSection {
            servers: vec![
                DnsServer {
                    tag: TAG_DNS_REMOTE.to_string(),
                    address: DEFAULT_REMOTE_DNS.to_string(),
                    detour: None,
                },
                DnsServer {
                    tag: TAG_DNS_DIRECT.to_string(),
                    address: DEFAULT_DIRECT_DNS.to_string(),
                    detour: None,
                },
            ],
            rules: Vec::new(),
            strategy: "prefer_ipv4".to_string(),
            final_server: TAG_DNS_REMOTE.to_string(),
        },
        inbounds: vec![Inbound::http(local_port)],
        outbounds: vec![Outbound::direct(), proxy],
        route: RouteSection {
            rules: Vec::new(),
            rule_set: Vec::new(),
            final_outbound: TAG_PROXY.to_string(),
            auto_detect_interface: false,
        },
    })
}

fn validate_settings(settings: &NetworkSettings) -> Result<(), ConfigError> {
    if settings.socks_port == 0 || settings.http_port == 0 {
        return Err(ConfigError::network("inbound ports must be nonzero"));
    }
    if settings.socks_port == settings.http_port {
        return Err(ConfigError::network(format!(
            "socks-port and http-port collide on {}",
            settings.socks_port
        )));
    }

    for server in &settings.dns_servers {
        if !is_valid_dns_address(server) {
            return Err(ConfigError::network(format!(
                "dns server '{}' is neither an IP nor a resolver URL",
                server
            )));
        }
    }

    if settings.hysteria2_up_mbps == Some(0) || settings.hysteria2_down_mbps == Some(0) {
        return Err(ConfigError::protocol("hysteria2 bandwidth must be nonzero"));
    }

    for entry in &settings.bypass_ips {
        if entry.starts_with(GEOIP_PREFIX) {
            continue;
        }
        if !is_valid_cidr(entry) {
            return Err(ConfigError::network(format!(
                "bypass ip '{}' is not an IP or CIDR",
                entry
            )));
        }
    }

    for rule in &settings.routing_rules {
        if rule.value.trim().is_empty() {
            return Err(ConfigError::network("routing rule with empty value"));
        }
        if rule.kind == RuleKind::Ip && !is_valid_cidr(&rule.value) {
            return Err(ConfigError::network(format!(
                "routing rule ip '{}' is not an IP or CIDR",
                rule.value
            )));
        }
    }

    Ok(())
}

fn is_valid_dns_address(address: &str) -> bool {
    if address == "local" {
        return true;
    }
    if address.contains("://") {
        return Url::parse(address).is_ok();
    }
    address.parse::<IpAddr>().is_ok()
}

fn is_valid_cidr(entry: &str) -> bool {
    entry.parse::<IpNet>().is_ok() || entry.parse::<IpAddr>().is_ok()
}

/// Parse "min-max" fragment ranges; `None` when fragmentation is off.
fn fragment_block(
    settings: &TlsFragmentSettings,
) -> Result<Option<FragmentBlock>, ConfigError> {
    if !settings.enabled {
        return Ok(None);
    }
    let size = parse_range(&settings.size)
        .ok_or_else(|| ConfigError::network(format!(
            "tls-fragment size '{}' is not a min-max range",
            settings.size
        )))?;
    let sleep = parse_range(&settings.sleep)
        .ok_or_else(|| ConfigError::network(format!(
            "tls-fragment sleep '{}' is not a min-max range",
            settings.sleep
        )))?;
    Ok(Some(FragmentBlock { size, sleep }))
}

fn parse_range(raw: &str) -> Option<[u16; 2]> {
    let mut parts = raw.split('-');
    let low = parts.next()?.trim().parse().ok()?;
    let high = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || low > high {
        return None;
    }
    Some([low, high])
}

fn build_dns(settings: &NetworkSettings) -> DnsSection {
    let remote = settings
        .dns_servers
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_REMOTE_DNS.to_string());
    let direct = settings
        .dns_servers
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_DIRECT_DNS.to_string());

    // Plain bypass domains resolve through the direct resolver so the
    // answer matches where the traffic actually goes.
    let plain_domains: Vec<String> = settings
        .bypass_domains
        .iter()
        .filter(|d| !d.starts_with(GEOSITE_PREFIX))
        .cloned()
        .collect();
    let mut rules = Vec::new();
    if !plain_domains.is_empty() {
        rules.push(DnsRule { domain: plain_domains, server: TAG_DNS_DIRECT.to_string() });
    }

    DnsSection {
        servers: vec![
            DnsServer { tag: TAG_DNS_REMOTE.to_string(), address: remote, detour: None },
            DnsServer { tag: TAG_DNS_DIRECT.to_string(), address: direct, detour: None },
        ],
        rules,
        strategy: "prefer_ipv4".to_string(),
        final_server: TAG_DNS_REMOTE.to_string(),
    }
}

fn build_inbounds(settings: &NetworkSettings) -> Vec<Inbound> {
    let mut inbounds = Vec::with_capacity(3);
    if settings.tun {
        inbounds.push(Inbound::tun());
    }
    inbounds.push(Inbound::socks(settings.socks_port));
    inbounds.push(Inbound::http(settings.http_port));
    inbounds
}

fn build_route(settings: &NetworkSettings) -> (RouteSection, bool) {
    let mut rules = vec![RouteRule {
        protocol: vec!["dns".to_string()],
        outbound: TAG_DNS.to_string(),
        ..Default::default()
    }];
    let mut rule_sets: Vec<RuleSet> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut block_referenced = false;

    // Global mode tunnels everything; only the DNS hijack rule survives.
    if settings.mode == ConnectionMode::Rule {
        for rule in &settings.routing_rules {
            let outbound = match rule.outlet {
                RuleOutlet::Proxy => TAG_PROXY,
                RuleOutlet::Direct => TAG_DIRECT,
                RuleOutlet::Block => {
                    block_referenced = true;
                    TAG_BLOCK
                }
            };
            let outbound = outbound.to_string();
            match rule.kind {
                RuleKind::Domain => rules.push(RouteRule {
                    domain: vec![rule.value.clone()],
                    outbound,
                    ..Default::default()
                }),
                RuleKind::Ip => rules.push(RouteRule {
                    ip_cidr: vec![rule.value.clone()],
                    outbound,
                    ..Default::default()
                }),
                RuleKind::Process => rules.push(RouteRule {
                    process_name: vec![rule.value.clone()],
                    outbound,
                    ..Default::default()
                }),
                RuleKind::Geosite => {
                    let tag = format!("geosite-{}", rule.value);
                    rules.push(RouteRule {
                        rule_set: vec![tag.clone()],
                        outbound,
                        ..Default::default()
                    });
                    add_rule_set(&mut rule_sets, &mut seen, tag, geosite_url(&rule.value));
                }
                RuleKind::Geoip => {
                    let tag = format!("geoip-{}", rule.value);
                    rules.push(RouteRule {
                        rule_set: vec![tag.clone()],
                        outbound,
                        ..Default::default()
                    });
                    add_rule_set(&mut rule_sets, &mut seen, tag, geoip_url(&rule.value));
                }
            }
        }

        let mut geoip_codes: Vec<&str> = settings
            .bypass_ips
            .iter()
            .filter_map(|e| e.strip_prefix(GEOIP_PREFIX))
            .collect();
        let plain_ips: Vec<String> = settings
            .bypass_ips
            .iter()
            .filter(|e| !e.starts_with(GEOIP_PREFIX))
            .cloned()
            .collect();

        if let Some(pos) = geoip_codes.iter().position(|c| *c == "private") {
            geoip_codes.remove(pos);
            rules.push(RouteRule {
                ip_is_private: true,
                outbound: TAG_DIRECT.to_string(),
                ..Default::default()
            });
        }
        if !geoip_codes.is_empty() {
            let tags: Vec<String> = geoip_codes.iter().map(|c| format!("geoip-{}", c)).collect();
            rules.push(RouteRule {
                rule_set: tags,
                outbound: TAG_DIRECT.to_string(),
                ..Default::default()
            });
            for code in &geoip_codes {
                add_rule_set(&mut rule_sets, &mut seen, format!("geoip-{}", code), geoip_url(code));
            }
        }
        if !plain_ips.is_empty() {
            rules.push(RouteRule {
                ip_cidr: plain_ips,
                outbound: TAG_DIRECT.to_string(),
                ..Default::default()
            });
        }

        let geosite_codes: Vec<&str> = settings
            .bypass_domains
            .iter()
            .filter_map(|d| d.strip_prefix(GEOSITE_PREFIX))
            .collect();
        let plain_domains: Vec<String> = settings
            .bypass_domains
            .iter()
            .filter(|d| !d.starts_with(GEOSITE_PREFIX))
            .cloned()
            .collect();

        if !geosite_codes.is_empty() {
            let tags: Vec<String> =
                geosite_codes.iter().map(|c| format!("geosite-{}", c)).collect();
            rules.push(RouteRule {
                rule_set: tags,
                outbound: TAG_DIRECT.to_string(),
                ..Default::default()
            });
            for code in &geosite_codes {
                add_rule_set(
                    &mut rule_sets,
                    &mut seen,
                    format!("geosite-{}", code),
                    geosite_url(code),
                );
            }
        }
        if !plain_domains.is_empty() {
            rules.push(RouteRule {
                domain: plain_domains,
                outbound: TAG_DIRECT.to_string(),
                ..Default::default()
            });
        }
    }

    let route = RouteSection {
        rules,
        rule_set: rule_sets,
        final_outbound: TAG_PROXY.to_string(),
        auto_detect_interface: true,
    };
    (route, block_referenced)
}

fn add_rule_set(rule_sets: &mut Vec<RuleSet>, seen: &mut HashSet<String>, tag: String, url: String) {
    if seen.insert(tag.clone()) {
        rule_sets.push(RuleSet::remote(tag, url));
    }
}

fn geoip_url(code: &str) -> String {
    if code == "ir" {
        IRAN_GEOIP_RULE_SET_URL.to_string()
    } else {
        GEOIP_RULE_SET_URL.replace("{code}", code)
    }
}

fn geosite_url(code: &str) -> String {
    if code == "ir" || code == "tld-ir" {
        IRAN_GEOSITE_RULE_SET_URL.to_string()
    } else {
        GEOSITE_RULE_SET_URL.replace("{code}", code)
    }
}

fn build_proxy_outbound(
    profile: &ServerProfile,
    settings: &NetworkSettings,
    fragment: Option<&FragmentBlock>,
) -> Result<Outbound, ConfigError> {
    require(&profile.server, "server address")?;
    if profile.port == 0 {
        return Err(ConfigError::protocol("server port is zero"));
    }

    let server = profile.server.clone();
    let port = profile.port;

    let outbound = match &profile.protocol {
        Protocol::Vless(o) => {
            require(&o.uuid, "vless uuid")?;
            let mut vless = VlessOutbound {
                tag: TAG_PROXY.to_string(),
                server,
                server_port: port,
                uuid: o.uuid.clone(),
                flow: None,
                tls: None,
                transport: None,
                multiplex: mux_block(settings),
            };
            if let Some(tls) = &o.tls {
                vless.tls = Some(tls_block(
                    tls,
                    &profile.server,
                    vec!["h2".to_string(), "http/1.1".to_string()],
                    fragment,
                )?);
            }
            match &o.transport {
                Transport::Ws { path, host } => {
                    vless.transport = Some(ws_transport(path, host, &o.tls, &profile.server));
                }
                // flow is an XTLS feature and only valid on a raw TCP stream
                Transport::Tcp => {
                    vless.flow = o.flow.clone().filter(|f| !f.is_empty());
                }
            }
            Outbound::Vless(vless)
        }

        Protocol::Vmess(o) => {
            require(&o.uuid, "vmess uuid")?;
            let mut vmess = VmessOutbound {
                tag: TAG_PROXY.to_string(),
                server,
                server_port: port,
                uuid: o.uuid.clone(),
                security: o.security.clone(),
                alter_id: o.alter_id,
                tls: None,
                transport: None,
                multiplex: mux_block(settings),
            };
            if let Some(tls) = &o.tls {
                vmess.tls = Some(tls_block(tls, &profile.server, Vec::new(), fragment)?);
            }
            if let Transport::Ws { path, host } = &o.transport {
                vmess.transport = Some(ws_transport(path, host, &o.tls, &profile.server));
            }
            Outbound::Vmess(vmess)
        }

        Protocol::Shadowsocks(o) => {
            require(&o.method, "shadowsocks method")?;
            require(&o.password, "shadowsocks password")?;
            Outbound::Shadowsocks(ShadowsocksOutbound {
                tag: TAG_PROXY.to_string(),
                server,
                server_port: port,
                method: o.method.clone(),
                password: o.password.clone(),
                multiplex: mux_block(settings),
            })
        }

        Protocol::Trojan(o) => {
            require(&o.password, "trojan password")?;
            let mut trojan = TrojanOutbound {
                tag: TAG_PROXY.to_string(),
                server,
                server_port: port,
                password: o.password.clone(),
                tls: tls_block(&o.tls, &profile.server, Vec::new(), fragment)?,
                transport: None,
                multiplex: mux_block(settings),
            };
            if let Transport::Ws { path, host } = &o.transport {
                let tls = Some(o.tls.clone());
                trojan.transport = Some(ws_transport(path, host, &tls, &profile.server));
            }
            Outbound::Trojan(trojan)
        }

        Protocol::Hysteria2(o) => {
            require(&o.password, "hysteria2 password")?;
            let obfs = match &o.obfs {
                Some(obfs) => {
                    require(&obfs.kind, "hysteria2 obfs type")?;
                    require(&obfs.password, "hysteria2 obfs password")?;
                    Some(ObfsBlock { kind: obfs.kind.clone(), password: obfs.password.clone() })
                }
                None => None,
            };
            Outbound::Hysteria2(Hysteria2Outbound {
                tag: TAG_PROXY.to_string(),
                server,
                server_port: port,
                password: o.password.clone(),
                up_mbps: settings.hysteria2_up_mbps.unwrap_or(DEFAULT_HY2_UP_MBPS),
                down_mbps: settings.hysteria2_down_mbps.unwrap_or(DEFAULT_HY2_DOWN_MBPS),
                obfs,
                tls: TlsBlock::new(
                    o.sni.clone().unwrap_or_else(|| profile.server.clone()),
                    o.insecure,
                ),
            })
        }

        Protocol::Tuic(o) => {
            require(&o.uuid, "tuic uuid")?;
            require(&o.password, "tuic password")?;
            let mut tls = TlsBlock::new(
                o.sni.clone().unwrap_or_else(|| profile.server.clone()),
                o.allow_insecure,
            );
            if let Some(alpn) = &o.alpn {
                tls.alpn = vec![alpn.clone()];
            }
            tls.utls = Some(UtlsBlock::fingerprint("chrome"));
            Outbound::Tuic(TuicOutbound {
                tag: TAG_PROXY.to_string(),
                server,
                server_port: port,
                uuid: o.uuid.clone(),
                password: o.password.clone(),
                congestion_control: o.congestion_control.clone(),
                udp_relay_mode: o.udp_relay_mode.clone(),
                tls,
            })
        }

        Protocol::Wireguard(o) => {
            require(&o.private_key, "wireguard private key")?;
            require(&o.peer_public_key, "wireguard peer public key")?;
            if o.local_address.is_empty() {
                return Err(ConfigError::protocol("wireguard local address is empty"));
            }
            let allowed_ips = if o.allowed_ips.is_empty() {
                vec!["0.0.0.0/0".to_string()]
            } else {
                o.allowed_ips.clone()
            };
            Outbound::Wireguard(WireguardOutbound {
                tag: TAG_PROXY.to_string(),
                local_address: o.local_address.clone(),
                private_key: o.private_key.clone(),
                mtu: o.mtu.unwrap_or(WIREGUARD_MTU),
                peers: vec![WireguardPeer {
                    server,
                    server_port: port,
                    public_key: o.peer_public_key.clone(),
                    pre_shared_key: o.preshared_key.clone().filter(|k| !k.is_empty()),
                    allowed_ips,
                }],
            })
        }
    };

    Ok(outbound)
}

fn require(value: &str, what: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::protocol(format!("{} is empty", what)))
    } else {
        Ok(())
    }
}

fn tls_block(
    tls: &TlsProfile,
    server: &str,
    alpn: Vec<String>,
    fragment: Option<&FragmentBlock>,
) -> Result<TlsBlock, ConfigError> {
    let server_name = tls.sni.clone().unwrap_or_else(|| server.to_string());
    let mut block = TlsBlock::new(server_name, tls.insecure);
    block.alpn = alpn;
    if let Some(fp) = &tls.fingerprint {
        block.utls = Some(UtlsBlock::fingerprint(fp));
    }
    if let Some(keys) = &tls.reality {
        if keys.public_key.trim().is_empty() {
            return Err(ConfigError::protocol("reality public key is empty"));
        }
        block.reality = Some(RealityBlock {
            enabled: true,
            public_key: keys.public_key.clone(),
            short_id: keys.short_id.clone(),
        });
    }
    block.fragment = fragment.cloned();
    Ok(block)
}

/// Host header preference: explicit transport host, then SNI, then the
/// server address itself.
fn ws_transport(
    path: &str,
    host: &Option<String>,
    tls: &Option<TlsProfile>,
    server: &str,
) -> WsTransport {
    let host = host
        .clone()
        .or_else(|| tls.as_ref().and_then(|t| t.sni.clone()))
        .unwrap_or_else(|| server.to_string());
    WsTransport::new(path.to_string(), host)
}

fn mux_block(settings: &NetworkSettings) -> Option<MuxBlock> {
    if !settings.mux.enabled {
        return None;
    }
    Some(MuxBlock {
        enabled: true,
        protocol: settings.mux.protocol.clone(),
        max_streams: settings.mux.max_streams,
        padding: settings.mux.padding,
    })
}
