/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Zone evaluation: maps a query name under one of the configured zones
//! to its answer. Reversed addresses and hostnames both resolve to
//! identifier tokens; TTLs grade confidence.

use std::net::Ipv4Addr;

use common::config::{ZoneConfig, ZoneKind};
use common::ip::{parse_reverse_v4, parse_reverse_v6};
use filter::reputation::Status;
use filter::token::{registered_domain, rooted};
use filter::Engine;

pub const TTL_LOW: u32 = 86_400;
pub const TTL_MEDIUM: u32 = 259_200;
pub const TTL_HIGH: u32 = 432_000;

const ADDR_LISTED: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
const ADDR_LISTED_COLD: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 3);
const ADDR_WHITE: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 4);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneAnswer {
    NxDomain,
    Listed {
        address: Ipv4Addr,
        ttl: u32,
        reason: String,
    },
}

impl ZoneAnswer {
    fn listed(address: Ipv4Addr, ttl: u32, reason: impl Into<String>) -> Self {
        ZoneAnswer::Listed {
            address,
            ttl,
            reason: reason.into(),
        }
    }
}

/// The queried identifier under a zone: a reversed address or a
/// hostname label sequence.
enum ZoneQuery {
    Ip(std::net::IpAddr),
    Host(String),
}

/// Resolves a query name to its zone answer; `None` means no configured
/// zone is authoritative for the name.
pub fn evaluate(engine: &Engine, name: &str) -> Option<ZoneAnswer> {
    let (zone, qualifier) = match_zone(&engine.core.config.zones, name)?;
    if qualifier.is_empty() {
        // The zone apex itself holds no data.
        return Some(ZoneAnswer::NxDomain);
    }

    let query = if let Some(ip) = parse_reverse_v4(qualifier) {
        ZoneQuery::Ip(common::ip::canonical(ip.into()))
    } else if let Some(ip) = parse_reverse_v6(qualifier) {
        ZoneQuery::Ip(common::ip::canonical(ip.into()))
    } else {
        ZoneQuery::Host(qualifier.to_string())
    };

    // Loopback test conventions: 127.0.0.1 is the guaranteed negative,
    // 127.0.0.2 the guaranteed positive.
    if let ZoneQuery::Ip(ip) = &query {
        if ip.to_string() == "127.0.0.1" || ip.to_string() == "127.0.0.0" {
            return Some(ZoneAnswer::NxDomain);
        }
        if ip.to_string() == "127.0.0.2" {
            return Some(ZoneAnswer::listed(
                ADDR_LISTED,
                TTL_LOW,
                "test point for positive response",
            ));
        }
    }

    Some(match zone.kind {
        ZoneKind::Dnsbl => dnsbl(engine, &query),
        ZoneKind::Dnswl => dnswl(engine, &query),
        ZoneKind::Uribl => uribl(engine, &query),
        ZoneKind::Score => score(engine, &query),
        ZoneKind::Dnsal => dnsal(engine, &query),
    })
}

fn match_zone<'x>(zones: &'x [ZoneConfig], name: &'x str) -> Option<(&'x ZoneConfig, &'x str)> {
    for zone in zones {
        if name == zone.apex {
            return Some((zone, ""));
        }
        if let Some(qualifier) = name.strip_suffix(&format!(".{}", zone.apex)) {
            return Some((zone, qualifier));
        }
    }
    None
}

fn token_of(query: &ZoneQuery) -> String {
    match query {
        ZoneQuery::Ip(ip) => ip.to_string(),
        ZoneQuery::Host(host) => rooted(host),
    }
}

fn dnsbl(engine: &Engine, query: &ZoneQuery) -> ZoneAnswer {
    let token = token_of(query);
    engine.analysis.enqueue(&token);
    let status = engine.reputation.status(&token);
    let blocked = match query {
        ZoneQuery::Ip(ip) => engine.lists.block.matches_ip(*ip),
        ZoneQuery::Host(host) => {
            if engine.lists.is_generic_dynamic(host) {
                // Dynamic rDNS is listed outright; fresh reputation only
                // softens the confidence.
                return if status == Status::White {
                    ZoneAnswer::listed(
                        ADDR_LISTED_COLD,
                        TTL_MEDIUM,
                        format!("{host} is a generic or dynamic name"),
                    )
                } else {
                    ZoneAnswer::listed(
                        ADDR_LISTED,
                        TTL_HIGH,
                        format!("{host} is a generic or dynamic name"),
                    )
                };
            }
            engine.lists.block.matches_token(&token)
        }
    };

    let reason = format!("{} is listed in this server", display_token(query));
    if blocked {
        match status {
            Status::Black | Status::Block => ZoneAnswer::listed(ADDR_LISTED, TTL_HIGH, reason),
            Status::Gray => ZoneAnswer::listed(ADDR_LISTED, TTL_MEDIUM, reason),
            Status::White => ZoneAnswer::listed(ADDR_LISTED_COLD, TTL_LOW, reason),
        }
    } else if matches!(status, Status::Black | Status::Block) {
        ZoneAnswer::listed(ADDR_LISTED, TTL_LOW, reason)
    } else if let ZoneQuery::Host(host) = query {
        // A clean subdomain of a dirty registered domain is still listed.
        match registered_domain(host) {
            Some(domain) if domain != host.trim_start_matches('.') => {
                let domain_token = format!(".{domain}");
                if matches!(
                    engine.reputation.status(&domain_token),
                    Status::Black | Status::Block
                ) {
                    ZoneAnswer::listed(
                        ADDR_LISTED,
                        TTL_LOW,
                        format!("{domain} is listed in this server"),
                    )
                } else {
                    ZoneAnswer::NxDomain
                }
            }
            _ => ZoneAnswer::NxDomain,
        }
    } else {
        ZoneAnswer::NxDomain
    }
}

fn dnswl(engine: &Engine, query: &ZoneQuery) -> ZoneAnswer {
    let token = token_of(query);
    let status = engine.reputation.status(&token);
    if status != Status::White {
        return ZoneAnswer::NxDomain;
    }
    let blocked = match query {
        ZoneQuery::Ip(ip) => engine.lists.block.matches_ip(*ip),
        ZoneQuery::Host(_) => engine.lists.block.matches_token(&token),
    };
    if blocked {
        return ZoneAnswer::NxDomain;
    }

    let reason = format!("{} is known good in this server", display_token(query));
    if engine.lists.ignore.matches_token(&token) {
        if is_good(engine, &token) {
            ZoneAnswer::listed(ADDR_LISTED, TTL_HIGH, reason)
        } else {
            ZoneAnswer::listed(ADDR_LISTED_COLD, TTL_HIGH, reason)
        }
    } else if is_good(engine, &token) {
        ZoneAnswer::listed(ADDR_LISTED, TTL_LOW, reason)
    } else if matches!(query, ZoneQuery::Ip(ip) if engine.lists.white.matches_ip(*ip)) {
        ZoneAnswer::listed(ADDR_WHITE, TTL_LOW, reason)
    } else {
        ZoneAnswer::NxDomain
    }
}

/// Established good traffic: real volume observed and not a single
/// complaint against it.
fn is_good(engine: &Engine, token: &str) -> bool {
    engine.reputation.get(token).is_some_and(|distribution| {
        distribution.complaints() == 0 && distribution.minimum_interarrival().is_some()
    })
}

fn uribl(engine: &Engine, query: &ZoneQuery) -> ZoneAnswer {
    let key = match query {
        ZoneQuery::Ip(ip) => ip.to_string(),
        ZoneQuery::Host(host) => host.clone(),
    };
    if engine
        .lists
        .block
        .contains_exact(&format!("HREF={}", key.to_lowercase()))
    {
        return ZoneAnswer::listed(
            ADDR_LISTED,
            TTL_LOW,
            format!("{key} is blocked as url signature"),
        );
    }
    if engine
        .lists
        .block
        .contains_exact(&format!("SIG={}", key.to_lowercase()))
    {
        return ZoneAnswer::listed(
            ADDR_LISTED_COLD,
            TTL_LOW,
            format!("{key} is blocked as executable signature"),
        );
    }
    ZoneAnswer::NxDomain
}

fn score(engine: &Engine, query: &ZoneQuery) -> ZoneAnswer {
    let token = token_of(query);
    match engine.reputation.probability(&token) {
        Some(probability) => {
            let score = 100u8.saturating_sub((100.0 * probability) as u8);
            ZoneAnswer::listed(
                Ipv4Addr::new(127, 0, 1, score),
                TTL_LOW,
                format!("{} scores {score} of 100", display_token(query)),
            )
        }
        None => ZoneAnswer::NxDomain,
    }
}

fn dnsal(engine: &Engine, query: &ZoneQuery) -> ZoneAnswer {
    let email = match query {
        ZoneQuery::Ip(ip) => engine.abuse_contacts.lookup_ip(*ip),
        ZoneQuery::Host(host) => engine.abuse_contacts.lookup_domain(host),
    };
    match email {
        Some(email) => ZoneAnswer::listed(ADDR_LISTED, TTL_LOW, email),
        None => ZoneAnswer::NxDomain,
    }
}

fn display_token(query: &ZoneQuery) -> String {
    match query {
        ZoneQuery::Ip(ip) => ip.to_string(),
        ZoneQuery::Host(host) => host.clone(),
    }
}
