/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod ttl;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use utils::config::{Config, Rate};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub server: ServerConfig,
    pub spf: SpfConfig,
    pub defer: DeferConfig,
    pub flood: FloodConfig,
    pub policy: PolicyConfig,
    pub zones: Vec<ZoneConfig>,
    pub abuse: AbuseConfig,
    pub gossip: GossipConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub data_dir: PathBuf,
    pub command_bind: Option<SocketAddr>,
    pub policy_bind: Option<SocketAddr>,
    pub dns_bind: Option<SocketAddr>,
    pub max_connections: u64,
    pub session_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SpfConfig {
    /// RFC 7208 wants PERMERROR after a syntax error; the engine
    /// historically answers SOFTFAIL on fallthrough instead.
    pub strict_errors: bool,
    pub best_guess: String,
}

#[derive(Debug, Clone)]
pub struct DeferConfig {
    pub softfail: Duration,
    pub gray: Duration,
    pub black: Duration,
    pub flood: Duration,
    pub flood_max_retry: u32,
}

/// Minimum believable inter-arrival time per identifier class; anything
/// arriving faster is a flood.
#[derive(Debug, Clone)]
pub struct FloodConfig {
    pub ip: f64,
    pub sender: f64,
    pub helo: f64,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub reverse_required: bool,
    pub spam_url: Option<String>,
    pub unblock_url: Option<String>,
    pub release_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Dnsbl,
    Dnswl,
    Uribl,
    Score,
    Dnsal,
}

#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub apex: String,
    pub kind: ZoneKind,
}

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    pub limit: Rate,
    pub ban: Duration,
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub bind: Option<SocketAddr>,
    pub peers: Vec<SocketAddr>,
}

impl CoreConfig {
    pub fn parse(config: &mut Config) -> Self {
        let hostname = config
            .value("server.hostname")
            .unwrap_or("localhost")
            .to_string();

        let mut zones = Vec::new();
        for name in config.sub_keys("zone") {
            let apex = config
                .value(("zone", name.as_str(), "apex"))
                .unwrap_or(name.as_str())
                .trim_matches('.')
                .to_lowercase();
            let kind_name = config
                .value(("zone", name.as_str(), "type"))
                .unwrap_or(name.as_str())
                .to_string();
            let kind = match kind_name.as_str() {
                "dnsbl" => ZoneKind::Dnsbl,
                "dnswl" => ZoneKind::Dnswl,
                "uribl" => ZoneKind::Uribl,
                "score" => ZoneKind::Score,
                "dnsal" => ZoneKind::Dnsal,
                other => {
                    config.new_build_error(
                        ("zone", name.as_str(), "type"),
                        format!("unknown zone type {other:?}"),
                    );
                    continue;
                }
            };
            zones.push(ZoneConfig { apex, kind });
        }

        let peer_values = config
            .values("gossip.peers")
            .map(|(_, value)| value.to_string())
            .collect::<Vec<_>>();
        let mut peers = Vec::with_capacity(peer_values.len());
        for value in peer_values {
            match value.parse::<SocketAddr>() {
                Ok(addr) => peers.push(addr),
                Err(_) => {
                    config.new_build_error(
                        "gossip.peers",
                        format!("invalid peer address {value:?}"),
                    );
                }
            }
        }

        CoreConfig {
            server: ServerConfig {
                hostname,
                data_dir: config.property_or_default("server.data-dir", "./data"),
                command_bind: config.property("server.listener.command.bind"),
                policy_bind: config.property("server.listener.policy.bind"),
                dns_bind: config.property("server.listener.dns.bind"),
                max_connections: config
                    .property_or_default("server.max-connections", "8192"),
                session_timeout: config
                    .property_or_default("server.session-timeout", "20s"),
            },
            spf: SpfConfig {
                strict_errors: config.property_or_default("spf.strict-errors", "false"),
                best_guess: config
                    .value("spf.best-guess")
                    .unwrap_or("v=spf1 a/24//48 mx/24//48 ptr ?all")
                    .to_string(),
            },
            defer: DeferConfig {
                softfail: config.property_or_default("defer.softfail", "1m"),
                gray: config.property_or_default("defer.gray", "10m"),
                black: config.property_or_default("defer.black", "1d"),
                flood: config.property_or_default("defer.flood", "1m"),
                flood_max_retry: config.property_or_default("defer.flood-max-retry", "16"),
            },
            flood: FloodConfig {
                ip: config.property_or_default("flood.ip", "1"),
                sender: config.property_or_default("flood.sender", "30"),
                helo: config.property_or_default("flood.helo", "10"),
            },
            policy: PolicyConfig {
                reverse_required: config.property_or_default("policy.reverse-required", "false"),
                spam_url: config.value("policy.url.spam").map(str::to_string),
                unblock_url: config.value("policy.url.unblock").map(str::to_string),
                release_url: config.value("policy.url.release").map(str::to_string),
            },
            zones,
            abuse: AbuseConfig {
                limit: config.property_or_default("abuse.limit", "16384/7d"),
                ban: config.property_or_default("abuse.ban", "7d"),
            },
            gossip: GossipConfig {
                bind: config.property("gossip.bind"),
                peers,
            },
        }
    }
}
