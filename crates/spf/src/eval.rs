/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Sender-policy evaluation. Mechanisms run in the order the parser laid
//! them out (cheapest first), includes recurse up to ten levels deep with
//! a visited-host guard, and `ptr` is honoured only at the top level.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use ahash::AHashSet;
use common::ip::{canonical, Cidr};
use common::resolver::{DnsError, Resolver};

use crate::record::{Mechanism, ParsedRecord};
use crate::registry::SpfRegistry;
use crate::{Qualifier, SpfResult};

/// MX targets examined per mechanism, per RFC 7208 §4.6.4.
const MAX_MX_TARGETS: usize = 10;
const MAX_DEPTH: u32 = 10;

pub struct SpfVerifier<'x> {
    registry: &'x SpfRegistry,
    resolver: &'x Resolver,
    strict_errors: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum EvalError {
    /// An include target does not exist; the caller skips the mechanism.
    HostNotFound,
    /// Transient DNS failure.
    Unavailable,
    /// Syntax-error fallthrough: no mechanism matched in a record that
    /// failed to parse cleanly.
    Syntax,
}

type EvalResult = Result<Option<Qualifier>, EvalError>;

impl<'x> SpfVerifier<'x> {
    pub fn new(registry: &'x SpfRegistry, resolver: &'x Resolver, strict_errors: bool) -> Self {
        SpfVerifier {
            registry,
            resolver,
            strict_errors,
        }
    }

    /// Evaluates the policy of `domain` for a transaction. The domain is
    /// normally the sender's; an inexistent domain answers NONE here and
    /// is rejected separately by the pipeline.
    pub async fn verify(
        &self,
        domain: &str,
        ip: IpAddr,
        sender: &str,
        helo: &str,
    ) -> SpfResult {
        let entry = match self.registry.lookup(self.resolver, domain).await {
            Ok(entry) => entry,
            Err(DnsError::NotFound) => return SpfResult::None,
            Err(_) => return SpfResult::TempError,
        };
        let record = match entry.record {
            Some(record) => record,
            None => return SpfResult::None,
        };

        let ip = canonical(ip);
        let mut visited = AHashSet::new();
        match self
            .qualifier(&record, domain, ip, sender, helo, 0, &mut visited)
            .await
        {
            Ok(Some(qualifier)) => qualifier.into(),
            Ok(None) => SpfResult::None,
            Err(EvalError::Syntax) => {
                if self.strict_errors {
                    SpfResult::PermError
                } else {
                    SpfResult::SoftFail
                }
            }
            Err(EvalError::HostNotFound) => SpfResult::None,
            Err(EvalError::Unavailable) => SpfResult::TempError,
        }
    }

    fn qualifier<'a>(
        &'a self,
        record: &'a ParsedRecord,
        domain: &'a str,
        ip: IpAddr,
        sender: &'a str,
        helo: &'a str,
        depth: u32,
        visited: &'a mut AHashSet<String>,
    ) -> Pin<Box<dyn Future<Output = EvalResult> + Send + 'a>> {
        Box::pin(async move {
            if depth > MAX_DEPTH || !visited.insert(domain.to_lowercase()) {
                return Ok(None);
            }

            for mechanism in &record.mechanisms {
                match mechanism {
                    Mechanism::Include { host } => {
                        let Some(target) = expand_macros(host, domain, ip, sender, helo) else {
                            continue;
                        };
                        match self.include(&target, ip, sender, helo, depth, visited).await {
                            Ok(Some(qualifier)) => return Ok(Some(qualifier)),
                            Ok(None) | Err(EvalError::HostNotFound) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    Mechanism::Ptr { qualifier, host } => {
                        if depth == 0
                            && self.match_ptr(host.as_deref(), domain, ip, sender, helo).await?
                        {
                            return Ok(Some(*qualifier));
                        }
                    }
                    _ => {
                        if self
                            .match_simple(mechanism, domain, ip, sender, helo)
                            .await?
                        {
                            return Ok(Some(mechanism_qualifier(mechanism)));
                        }
                    }
                }
            }

            if let Some(redirect) = &record.redirect {
                let Some(target) = expand_macros(redirect, domain, ip, sender, helo) else {
                    return Ok(None);
                };
                let entry = match self.registry.lookup(self.resolver, &target).await {
                    Ok(entry) => entry,
                    Err(DnsError::NotFound) => return Ok(None),
                    Err(_) => return Err(EvalError::Unavailable),
                };
                return match entry.record {
                    Some(redirected) => {
                        self.qualifier(&redirected, &target, ip, sender, helo, 0, visited)
                            .await
                    }
                    None => Ok(None),
                };
            }

            if record.error {
                Err(EvalError::Syntax)
            } else if depth > 0 {
                // `all` only applies at the top of the tree.
                Ok(None)
            } else {
                Ok(record.all)
            }
        })
    }

    async fn include(
        &self,
        target: &str,
        ip: IpAddr,
        sender: &str,
        helo: &str,
        depth: u32,
        visited: &mut AHashSet<String>,
    ) -> EvalResult {
        let entry = match self.registry.lookup(self.resolver, target).await {
            Ok(entry) => entry,
            Err(DnsError::NotFound) => return Err(EvalError::HostNotFound),
            Err(_) => return Err(EvalError::Unavailable),
        };
        match entry.record {
            Some(record) => {
                self.qualifier(&record, target, ip, sender, helo, depth + 1, visited)
                    .await
            }
            None => Err(EvalError::HostNotFound),
        }
    }

    async fn match_simple(
        &self,
        mechanism: &Mechanism,
        domain: &str,
        ip: IpAddr,
        sender: &str,
        helo: &str,
    ) -> Result<bool, EvalError> {
        match mechanism {
            Mechanism::Ip4 {
                cidr, reserved, ..
            } => Ok(!*reserved && cidr.contains(ip)),
            Mechanism::Ip6 { cidr, .. } => Ok(cidr.contains(ip)),
            Mechanism::A {
                host, mask4, mask6, ..
            } => {
                let target = match expand_target(host.as_deref(), domain, ip, sender, helo) {
                    Some(target) => target,
                    None => return Ok(false),
                };
                self.match_addresses(&target, ip, *mask4, *mask6).await
            }
            Mechanism::Mx {
                host, mask4, mask6, ..
            } => {
                let target = match expand_target(host.as_deref(), domain, ip, sender, helo) {
                    Some(target) => target,
                    None => return Ok(false),
                };
                let exchanges = match self.resolver.mx(&target).await {
                    Ok(exchanges) => exchanges,
                    Err(DnsError::NotFound | DnsError::Empty | DnsError::Invalid) => {
                        return Ok(false)
                    }
                    Err(_) => return Err(EvalError::Unavailable),
                };
                for exchange in exchanges.iter().take(MAX_MX_TARGETS) {
                    if self.match_addresses(exchange, ip, *mask4, *mask6).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Exists { host, .. } => {
                let Some(target) = expand_macros(host, domain, ip, sender, helo) else {
                    return Ok(false);
                };
                match self.resolver.a(&target).await {
                    Ok(addresses) => Ok(!addresses.is_empty()),
                    Err(DnsError::NotFound | DnsError::Empty | DnsError::Invalid) => Ok(false),
                    Err(_) => Err(EvalError::Unavailable),
                }
            }
            Mechanism::Include { .. } | Mechanism::Ptr { .. } => Ok(false),
        }
    }

    async fn match_addresses(
        &self,
        host: &str,
        ip: IpAddr,
        mask4: u8,
        mask6: u8,
    ) -> Result<bool, EvalError> {
        let addresses = match self.resolver.ip(host).await {
            Ok(addresses) => addresses,
            Err(DnsError::NotFound | DnsError::Empty | DnsError::Invalid) => return Ok(false),
            Err(_) => return Err(EvalError::Unavailable),
        };
        for address in addresses {
            let mask = match address {
                IpAddr::V4(_) => mask4,
                IpAddr::V6(_) => mask6,
            };
            if let Some(cidr) = Cidr::new(address, mask) {
                if cidr.contains(ip) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn match_ptr(
        &self,
        host: Option<&str>,
        domain: &str,
        ip: IpAddr,
        sender: &str,
        helo: &str,
    ) -> Result<bool, EvalError> {
        let target = match expand_target(host, domain, ip, sender, helo) {
            Some(target) => target,
            None => return Ok(false),
        };
        let suffix = format!(".{}", target.trim_start_matches('.'));
        let names = match self.resolver.ptr(ip).await {
            Ok(names) => names,
            Err(DnsError::NotFound | DnsError::Empty | DnsError::Invalid) => return Ok(false),
            Err(_) => return Err(EvalError::Unavailable),
        };
        Ok(names
            .iter()
            .any(|name| name == &suffix[1..] || name.ends_with(&suffix)))
    }
}

fn mechanism_qualifier(mechanism: &Mechanism) -> Qualifier {
    match mechanism {
        Mechanism::Ip4 { qualifier, .. }
        | Mechanism::Ip6 { qualifier, .. }
        | Mechanism::A { qualifier, .. }
        | Mechanism::Mx { qualifier, .. }
        | Mechanism::Ptr { qualifier, .. }
        | Mechanism::Exists { qualifier, .. } => *qualifier,
        Mechanism::Include { .. } => Qualifier::Pass,
    }
}

fn expand_target(
    host: Option<&str>,
    domain: &str,
    ip: IpAddr,
    sender: &str,
    helo: &str,
) -> Option<String> {
    match host {
        Some(host) => expand_macros(host, domain, ip, sender, helo),
        None => Some(domain.to_string()),
    }
}

/// Expands the macro subset seen in the wild: `%{s}`, `%{l}`, `%{o}`,
/// `%{d}`, `%{i}`, `%{h}`, `%{v}`, with optional right-truncation digits
/// and the `r` reversal transformer. A host still containing `%` after
/// expansion is unresolvable and the mechanism does not match.
pub fn expand_macros(
    host: &str,
    domain: &str,
    ip: IpAddr,
    sender: &str,
    helo: &str,
) -> Option<String> {
    if !host.contains('%') {
        return Some(host.to_lowercase());
    }

    let (local, sender_domain) = sender.split_once('@').unwrap_or(("postmaster", sender));
    let mut out = String::with_capacity(host.len());
    let mut chars = host.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('_') => out.push(' '),
            Some('-') => out.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                    body.push(inner);
                }
                let mut body_chars = body.chars();
                let letter = body_chars.next()?;
                let rest: String = body_chars.collect();
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                let reverse = rest[digits.len()..].starts_with(['r', 'R']);
                let value = match letter.to_ascii_lowercase() {
                    's' => sender.to_string(),
                    'l' => local.to_string(),
                    'o' => sender_domain.to_string(),
                    'd' => domain.to_string(),
                    'h' => helo.to_string(),
                    'i' => match ip {
                        IpAddr::V4(v4) => v4.to_string(),
                        IpAddr::V6(v6) => common::ip::reverse_nibbles_v6(v6)
                            .split('.')
                            .rev()
                            .collect::<Vec<_>>()
                            .join("."),
                    },
                    'v' => match ip {
                        IpAddr::V4(_) => "in-addr".to_string(),
                        IpAddr::V6(_) => "ip6".to_string(),
                    },
                    _ => return None,
                };
                out.push_str(&transform(&value, &digits, reverse));
            }
            _ => return None,
        }
    }

    if out.contains('%') {
        None
    } else {
        Some(out.to_lowercase())
    }
}

fn transform(value: &str, digits: &str, reverse: bool) -> String {
    let mut parts: Vec<&str> = value.split('.').collect();
    if reverse {
        parts.reverse();
    }
    if let Ok(count) = digits.parse::<usize>() {
        if count > 0 && count < parts.len() {
            parts = parts.split_off(parts.len() - count);
        }
    }
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use common::resolver::{MockDns, Resolver};

    use super::{expand_macros, SpfVerifier};
    use crate::registry::SpfRegistry;
    use crate::SpfResult;

    const BEST_GUESS: &str = "v=spf1 a/24//48 mx/24//48 ptr ?all";
    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 5));

    fn zone() -> MockDns {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:198.51.100.0/28 mx -all".to_string()],
        );
        mock.mx.insert(
            "example.com".to_string(),
            vec!["mx.example.com".to_string()],
        );
        mock.a.insert(
            "mx.example.com".to_string(),
            vec![Ipv4Addr::new(198, 51, 100, 25)],
        );
        mock
    }

    async fn verify(mock: MockDns, domain: &str, ip: IpAddr) -> SpfResult {
        let resolver = Resolver::mock(mock);
        let registry = SpfRegistry::new(BEST_GUESS);
        SpfVerifier::new(&registry, &resolver, false)
            .verify(domain, ip, "alice@example.com", "mx.example.com")
            .await
    }

    #[tokio::test]
    async fn ip4_literal_match() {
        assert_eq!(verify(zone(), "example.com", IP).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn mx_match() {
        // The /28 misses but the MX exchange resolves to this address.
        let mut mock = zone();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:198.51.100.0/28 mx -all".to_string()],
        );
        assert_eq!(
            verify(
                mock,
                "example.com",
                IpAddr::V4(Ipv4Addr::new(198, 51, 100, 25))
            )
            .await,
            SpfResult::Pass
        );

        // Without a matching exchange the qualifier falls through to all.
        let mut mock = zone();
        mock.mx.insert(
            "example.com".to_string(),
            vec!["other.example.net".to_string()],
        );
        mock.a.insert(
            "other.example.net".to_string(),
            vec![Ipv4Addr::new(203, 0, 113, 30)],
        );
        assert_eq!(
            verify(
                mock,
                "example.com",
                IpAddr::V4(Ipv4Addr::new(198, 51, 100, 25))
            )
            .await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn fail_on_all() {
        assert_eq!(
            verify(
                zone(),
                "example.com",
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 99))
            )
            .await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn include_chain_respects_depth_limit() {
        let mut mock = MockDns::default();
        // A chain of twelve includes; the eleventh level is cut off, so
        // evaluation falls through to the outer -all.
        for hop in 0..12 {
            mock.txt.insert(
                format!("hop{hop}.example"),
                vec![format!("v=spf1 include:hop{}.example -all", hop + 1)],
            );
        }
        assert_eq!(
            verify(mock, "hop0.example", IP).await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn include_cycle_terminates() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "a.example".to_string(),
            vec!["v=spf1 include:b.example ~all".to_string()],
        );
        mock.txt.insert(
            "b.example".to_string(),
            vec!["v=spf1 include:a.example ip4:198.51.100.5 -all".to_string()],
        );
        // The cycle back into a.example is ignored; the literal matches.
        assert_eq!(verify(mock, "a.example", IP).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn include_host_not_found_continues() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 include:gone.example ip4:198.51.100.5 -all".to_string()],
        );
        assert_eq!(verify(mock, "example.com", IP).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn reserved_ip4_never_matches() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:10.0.0.0/8 -all".to_string()],
        );
        assert_eq!(
            verify(mock, "example.com", IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))).await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn syntax_error_fallthrough_is_softfail() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 broken!token -all".to_string()],
        );
        assert_eq!(
            verify(mock, "example.com", IP).await,
            SpfResult::SoftFail
        );
    }

    #[tokio::test]
    async fn strict_mode_returns_permerror() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 broken!token -all".to_string()],
        );
        let resolver = Resolver::mock(mock);
        let registry = SpfRegistry::new(BEST_GUESS);
        let result = SpfVerifier::new(&registry, &resolver, true)
            .verify("example.com", IP, "alice@example.com", "mx.example.com")
            .await;
        assert_eq!(result, SpfResult::PermError);
    }

    #[tokio::test]
    async fn redirect_follows_target() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 redirect=_spf.example.net".to_string()],
        );
        mock.txt.insert(
            "_spf.example.net".to_string(),
            vec!["v=spf1 ip4:198.51.100.0/24 -all".to_string()],
        );
        assert_eq!(verify(mock, "example.com", IP).await, SpfResult::Pass);
    }

    #[tokio::test]
    async fn dns_outage_yields_temperror() {
        let mut mock = zone();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 a:dead.example -all".to_string()],
        );
        mock.unavailable.insert("dead.example".to_string());
        assert_eq!(
            verify(mock, "example.com", IP).await,
            SpfResult::TempError
        );
    }

    #[tokio::test]
    async fn ptr_only_at_top_level() {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "outer.example".to_string(),
            vec!["v=spf1 include:inner.example -all".to_string()],
        );
        mock.txt.insert(
            "inner.example".to_string(),
            vec!["v=spf1 ptr ~all".to_string()],
        );
        mock.ptr
            .insert(IP.to_string(), vec!["mail.inner.example".to_string()]);
        // The nested ptr would match, but ptr is skipped below the top.
        assert_eq!(verify(mock, "outer.example", IP).await, SpfResult::Fail);
    }

    #[test]
    fn macro_expansion() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5));
        assert_eq!(
            expand_macros("%{i}.spf.example.net", "d.example", ip, "a@b.c", "helo"),
            Some("192.0.2.5.spf.example.net".to_string())
        );
        assert_eq!(
            expand_macros("%{d}", "d.example", ip, "a@b.c", "helo"),
            Some("d.example".to_string())
        );
        assert_eq!(
            expand_macros("%{o}._spf.example", "d.example", ip, "a@b.c", "helo"),
            Some("b.c._spf.example".to_string())
        );
        assert_eq!(
            expand_macros("%{d2}", "a.b.c.example", ip, "a@b.c", "helo"),
            Some("c.example".to_string())
        );
        // Unknown macro letters make the host unresolvable.
        assert_eq!(expand_macros("%{x}", "d", ip, "a@b.c", "helo"), None);

        let v6 = IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap());
        let expanded = expand_macros("%{i}.zone", "d", v6, "a@b.c", "helo").unwrap();
        assert!(expanded.starts_with("2.0.0.1."));
        assert!(expanded.ends_with(".zone"));
    }
}
