/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Sender-policy record parsing. Published records are frequently broken,
//! so parsing is a repair pass as much as a grammar: recognisable CIDR
//! fragments inside unknown tokens are rewritten into valid mechanisms and
//! everything else sets the syntax-error flag instead of failing the
//! record.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ahash::AHashSet;
use common::ip::{Cidr, RESERVED_V4};

use crate::Qualifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    Ip4 {
        qualifier: Qualifier,
        cidr: Cidr,
        /// Overlaps IANA-reserved space; never matches.
        reserved: bool,
    },
    Ip6 {
        qualifier: Qualifier,
        cidr: Cidr,
    },
    A {
        qualifier: Qualifier,
        host: Option<String>,
        mask4: u8,
        mask6: u8,
    },
    Mx {
        qualifier: Qualifier,
        host: Option<String>,
        mask4: u8,
        mask6: u8,
    },
    Ptr {
        qualifier: Qualifier,
        host: Option<String>,
    },
    Exists {
        qualifier: Qualifier,
        host: String,
    },
    Include {
        host: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRecord {
    /// Mechanisms in evaluation-complexity order: address literals first,
    /// then DNS mechanisms, then includes, PTR last.
    pub mechanisms: Vec<Mechanism>,
    pub all: Option<Qualifier>,
    pub redirect: Option<String>,
    pub explanation: Option<String>,
    /// At least one token could not be interpreted.
    pub error: bool,
}

impl ParsedRecord {
    /// Parses one or more policy strings into a single merged record.
    /// Multiple published records are folded together the way repeated
    /// tokens within one record are: first occurrence wins.
    pub fn parse(registries: &[String]) -> Self {
        let mut ip_list = Vec::new();
        let mut dns_list = Vec::new();
        let mut include_list = Vec::new();
        let mut ptr_list = Vec::new();
        let mut visited: AHashSet<String> = AHashSet::new();
        let mut record = ParsedRecord::default();

        for registry in registries {
            for raw_token in registry.split_ascii_whitespace() {
                let token = normalize_token(raw_token);
                if token.is_empty() || !visited.insert(token.clone()) {
                    continue;
                }
                match classify(&token) {
                    Token::Version => {}
                    Token::All(qualifier) => {
                        record.all.get_or_insert(qualifier);
                    }
                    Token::Mechanism(
                        mech @ (Mechanism::Ip4 { .. } | Mechanism::Ip6 { .. }),
                    ) => ip_list.push(mech),
                    Token::Mechanism(
                        mech @ (Mechanism::A { .. } | Mechanism::Mx { .. } | Mechanism::Exists { .. }),
                    ) => dns_list.push(mech),
                    Token::Mechanism(mech @ Mechanism::Include { .. }) => include_list.push(mech),
                    Token::Mechanism(mech @ Mechanism::Ptr { .. }) => ptr_list.push(mech),
                    Token::Redirect(host) => {
                        record.redirect.get_or_insert(host);
                    }
                    Token::Explanation(host) => {
                        record.explanation.get_or_insert(host);
                    }
                    Token::Repaired(mech) => {
                        // A salvageable address hid inside a broken token.
                        ip_list.push(mech);
                        record.error = true;
                    }
                    Token::Unknown => {
                        record.error = true;
                    }
                }
            }
        }

        record.mechanisms = ip_list;
        record.mechanisms.append(&mut dns_list);
        record.mechanisms.append(&mut include_list);
        record.mechanisms.append(&mut ptr_list);
        record
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty() && self.all.is_none() && self.redirect.is_none()
    }
}

enum Token {
    Version,
    All(Qualifier),
    Mechanism(Mechanism),
    Redirect(String),
    Explanation(String),
    Repaired(Mechanism),
    Unknown,
}

fn normalize_token(token: &str) -> String {
    token
        .trim_matches(|ch| ch == '"' || ch == '\\')
        .to_lowercase()
}

fn classify(token: &str) -> Token {
    match token {
        "v=spf1" | "spf1" | "v=msv1" | "+" => return Token::Version,
        _ => {}
    }
    // Opaque tracking modifiers some providers publish.
    if token.len() == 32 && token.starts_with("t=") {
        return Token::Version;
    }
    if let Some(host) = token.strip_prefix("redirect=") {
        return Token::Redirect(host.to_string());
    }
    if let Some(host) = token.strip_prefix("exp=") {
        return Token::Explanation(host.to_string());
    }

    let (qualifier, body) = split_qualifier(token);
    if body == "all" {
        // Permissive qualifiers are not honoured for all: both `all` and
        // `+all` demote to NEUTRAL.
        return Token::All(match qualifier {
            Some(Qualifier::Fail) => Qualifier::Fail,
            Some(Qualifier::SoftFail) => Qualifier::SoftFail,
            _ => Qualifier::Neutral,
        });
    }
    let qualifier = qualifier.unwrap_or(Qualifier::Pass);

    if let Some(mech) = parse_ip4(body, qualifier) {
        return Token::Mechanism(mech);
    }
    if let Some(mech) = parse_ip6(body, qualifier) {
        return Token::Mechanism(mech);
    }
    if let Some(mech) = parse_host_mechanism(body, qualifier) {
        return Token::Mechanism(mech);
    }

    // Repair pass: salvage an address literal from an unknown token.
    if let Some(cidr) = extract_v4_cidr(body) {
        return Token::Repaired(Mechanism::Ip4 {
            qualifier,
            reserved: is_reserved_v4(&cidr),
            cidr,
        });
    }
    if let Some(cidr) = extract_v6_cidr(body) {
        return Token::Repaired(Mechanism::Ip6 { qualifier, cidr });
    }

    Token::Unknown
}

fn split_qualifier(token: &str) -> (Option<Qualifier>, &str) {
    match token.as_bytes().first() {
        Some(b'+') => (Some(Qualifier::Pass), &token[1..]),
        Some(b'-') => (Some(Qualifier::Fail), &token[1..]),
        Some(b'~') => (Some(Qualifier::SoftFail), &token[1..]),
        Some(b'?') => (Some(Qualifier::Neutral), &token[1..]),
        _ => (None, token),
    }
}

fn parse_ip4(body: &str, qualifier: Qualifier) -> Option<Mechanism> {
    let inetnum = body
        .strip_prefix("ip4:")
        .or_else(|| body.strip_prefix("ipv4:"))
        .or_else(|| body.strip_prefix("ip:"))
        .unwrap_or(body);
    let cidr = parse_v4_cidr(inetnum)?;
    Some(Mechanism::Ip4 {
        qualifier,
        reserved: is_reserved_v4(&cidr),
        cidr,
    })
}

fn parse_ip6(body: &str, qualifier: Qualifier) -> Option<Mechanism> {
    let inetnum = body
        .strip_prefix("ip6:")
        .or_else(|| body.strip_prefix("ipv6:"))
        .unwrap_or(body);
    let cidr = parse_v6_cidr(inetnum)?;
    Some(Mechanism::Ip6 { qualifier, cidr })
}

fn parse_host_mechanism(body: &str, qualifier: Qualifier) -> Option<Mechanism> {
    let (name, tail) = match body.find([':', '/']) {
        Some(pos) if body.as_bytes()[pos] == b':' => {
            (&body[..pos], &body[pos + 1..])
        }
        Some(pos) => (&body[..pos], &body[pos..]),
        None => (body, ""),
    };

    match name {
        "a" | "mx" => {
            let (host, mask_part) = split_host_masks(tail);
            let (mask4, mask6) = parse_masks(mask_part)?;
            let host = valid_optional_host(host)?;
            Some(if name == "a" {
                Mechanism::A {
                    qualifier,
                    host,
                    mask4,
                    mask6,
                }
            } else {
                Mechanism::Mx {
                    qualifier,
                    host,
                    mask4,
                    mask6,
                }
            })
        }
        "ptr" => Some(Mechanism::Ptr {
            qualifier,
            host: valid_optional_host(tail)?,
        }),
        "exists" => {
            if tail.is_empty() || !is_plausible_host(tail) {
                None
            } else {
                Some(Mechanism::Exists {
                    qualifier,
                    host: tail.to_string(),
                })
            }
        }
        "include" => {
            if tail.is_empty() || !is_plausible_host(tail) {
                None
            } else {
                Some(Mechanism::Include {
                    host: tail.to_string(),
                })
            }
        }
        _ => None,
    }
}

fn split_host_masks(tail: &str) -> (&str, &str) {
    match tail.find('/') {
        Some(pos) => (&tail[..pos], &tail[pos..]),
        None => (tail, ""),
    }
}

fn parse_masks(mask_part: &str) -> Option<(u8, u8)> {
    if mask_part.is_empty() {
        return Some((32, 128));
    }
    let (mask4_part, mask6_part) = match mask_part.split_once("//") {
        Some((m4, m6)) => (m4, Some(m6)),
        None => (mask_part, None),
    };
    let mask4 = match mask4_part.strip_prefix('/') {
        Some("") | None if mask4_part.is_empty() => 32,
        Some("") => return None,
        Some(digits) => digits.parse().ok().filter(|m| *m <= 32)?,
        None => return None,
    };
    let mask6 = match mask6_part {
        Some(digits) if !digits.is_empty() => digits.parse().ok().filter(|m| *m <= 128)?,
        Some(_) => return None,
        None => 128,
    };
    Some((mask4, mask6))
}

fn valid_optional_host(host: &str) -> Option<Option<String>> {
    if host.is_empty() {
        Some(None)
    } else if is_plausible_host(host) {
        Some(Some(host.to_string()))
    } else {
        None
    }
}

/// Accepts hostnames and macro expressions; anything with whitespace or
/// control characters is rejected.
fn is_plausible_host(host: &str) -> bool {
    !host.is_empty()
        && host.bytes().all(|ch| {
            ch.is_ascii_alphanumeric()
                || matches!(ch, b'-' | b'.' | b'_' | b'%' | b'{' | b'}')
        })
}

fn parse_v4_cidr(inetnum: &str) -> Option<Cidr> {
    let (addr, prefix) = match inetnum.split_once('/') {
        Some((addr, prefix)) => (addr, prefix.parse().ok().filter(|p| *p <= 32)?),
        None => (inetnum, 32),
    };
    let addr: Ipv4Addr = addr.parse().ok()?;
    Cidr::new(addr.into(), prefix)
}

fn parse_v6_cidr(inetnum: &str) -> Option<Cidr> {
    if !inetnum.contains(':') {
        return None;
    }
    let (addr, prefix) = match inetnum.split_once('/') {
        Some((addr, prefix)) => (addr, prefix.parse().ok().filter(|p| *p <= 128)?),
        None => (inetnum, 128),
    };
    let addr: Ipv6Addr = addr.parse().ok()?;
    Cidr::new(addr.into(), prefix)
}

fn is_reserved_v4(cidr: &Cidr) -> bool {
    RESERVED_V4.iter().any(|reserved| reserved.overlaps(cidr))
}

fn extract_v4_cidr(token: &str) -> Option<Cidr> {
    token
        .split(|ch: char| !ch.is_ascii_digit() && ch != '.' && ch != '/')
        .find_map(parse_v4_cidr)
}

fn extract_v6_cidr(token: &str) -> Option<Cidr> {
    token
        .split(|ch: char| !ch.is_ascii_hexdigit() && ch != ':' && ch != '/' && ch != '.')
        .find_map(parse_v6_cidr)
}

impl FromStr for ParsedRecord {
    type Err = ();

    fn from_str(registry: &str) -> Result<Self, Self::Err> {
        Ok(ParsedRecord::parse(&[registry.to_string()]))
    }
}
