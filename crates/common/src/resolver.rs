/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use utils::config::Config;

use crate::ip::canonical;

/// Bounded-latency DNS lookups. Record caching is delegated to the
/// resolver's positive/negative cache; every call carries the configured
/// deadline so a dead upstream degrades to `Unavailable` instead of
/// stalling a session.
pub struct Resolver {
    backend: Backend,
    timeout: Duration,
}

enum Backend {
    Hickory(TokioAsyncResolver),
    #[cfg(any(test, feature = "test_mode"))]
    Mock(MockDns),
}

/// Static zone data for tests: a name (or address) maps to its records,
/// a missing key answers NXDOMAIN and `unavailable` simulates an outage.
#[cfg(any(test, feature = "test_mode"))]
#[derive(Debug, Default)]
pub struct MockDns {
    pub a: ahash::AHashMap<String, Vec<Ipv4Addr>>,
    pub aaaa: ahash::AHashMap<String, Vec<Ipv6Addr>>,
    pub mx: ahash::AHashMap<String, Vec<String>>,
    pub txt: ahash::AHashMap<String, Vec<String>>,
    pub ptr: ahash::AHashMap<String, Vec<String>>,
    pub unavailable: ahash::AHashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// The queried name does not exist (NXDOMAIN).
    #[error("host not found")]
    NotFound,
    /// The name exists but holds no records of the queried type.
    #[error("no records")]
    Empty,
    /// SERVFAIL, refused, network failure or deadline exceeded.
    #[error("DNS unavailable")]
    Unavailable,
    /// The query itself cannot be asked (bad name).
    #[error("invalid DNS query")]
    Invalid,
}

pub type DnsResult<T> = Result<T, DnsError>;

impl Resolver {
    pub fn parse(config: &mut Config) -> Self {
        let resolver_type = config
            .value("resolver.type")
            .unwrap_or("system")
            .to_string();
        let (resolver_config, mut opts) = match resolver_type.as_str() {
            "cloudflare" => (ResolverConfig::cloudflare(), ResolverOpts::default()),
            "quad9" => (ResolverConfig::quad9(), ResolverOpts::default()),
            "google" => (ResolverConfig::google(), ResolverOpts::default()),
            "system" => read_system_conf().unwrap_or_else(|err| {
                config.new_build_warning(
                    "resolver.type",
                    format!("Failed to read system DNS config, using Cloudflare: {err}"),
                );
                (ResolverConfig::cloudflare(), ResolverOpts::default())
            }),
            "custom" => {
                let mut resolver_config = ResolverConfig::new();
                let urls = config
                    .values("resolver.custom")
                    .map(|(_, url)| url.to_string())
                    .collect::<Vec<_>>();
                for url in &urls {
                    let (proto, addr) = match url.split_once("://") {
                        Some(("udp", addr)) => (Protocol::Udp, addr),
                        Some(("tcp", addr)) => (Protocol::Tcp, addr),
                        Some((other, addr)) => {
                            config.new_parse_error(
                                "resolver.custom",
                                format!("invalid custom resolver protocol {other:?}"),
                            );
                            (Protocol::Udp, addr)
                        }
                        None => (Protocol::Udp, url.as_str()),
                    };
                    let addr = if addr.contains(':') {
                        addr.to_string()
                    } else {
                        format!("{addr}:53")
                    };
                    match addr.parse::<SocketAddr>() {
                        Ok(addr) => {
                            resolver_config
                                .add_name_server(NameServerConfig::new(addr, proto));
                        }
                        Err(_) => {
                            config.new_parse_error(
                                "resolver.custom",
                                format!("invalid custom resolver address {addr:?}"),
                            );
                        }
                    }
                }
                (resolver_config, ResolverOpts::default())
            }
            other => {
                config.new_parse_error(
                    "resolver.type",
                    format!("unknown resolver type {other:?}"),
                );
                (ResolverConfig::cloudflare(), ResolverOpts::default())
            }
        };

        let timeout = config.property_or_default::<Duration>("resolver.timeout", "5s");
        opts.timeout = timeout;
        opts.attempts = config.property_or_default::<usize>("resolver.attempts", "2");
        opts.validate = false;
        opts.preserve_intermediates = false;
        opts.try_tcp_on_error = config.property_or_default::<bool>("resolver.try-tcp", "true");
        opts.positive_max_ttl = config
            .property::<Duration>("resolver.cache.positive-ttl")
            .into();
        opts.negative_max_ttl = config
            .property::<Duration>("resolver.cache.negative-ttl")
            .into();

        Resolver {
            backend: Backend::Hickory(TokioAsyncResolver::tokio(resolver_config, opts)),
            timeout: config.property_or_default::<Duration>("resolver.deadline", "15s"),
        }
    }

    #[cfg(any(test, feature = "test_mode"))]
    pub fn mock(mock: MockDns) -> Self {
        Resolver {
            backend: Backend::Mock(mock),
            timeout: Duration::from_secs(1),
        }
    }

    pub async fn a(&self, host: &str) -> DnsResult<Vec<Ipv4Addr>> {
        let host = fqdn(host)?;
        match &self.backend {
            Backend::Hickory(resolver) => {
                let lookup = self.bounded(resolver.ipv4_lookup(host)).await?;
                Ok(lookup.into_iter().map(|a| a.0).collect())
            }
            #[cfg(any(test, feature = "test_mode"))]
            Backend::Mock(mock) => mock.get(&mock.a, &host),
        }
    }

    pub async fn aaaa(&self, host: &str) -> DnsResult<Vec<Ipv6Addr>> {
        let host = fqdn(host)?;
        match &self.backend {
            Backend::Hickory(resolver) => {
                let lookup = self.bounded(resolver.ipv6_lookup(host)).await?;
                Ok(lookup.into_iter().map(|aaaa| aaaa.0).collect())
            }
            #[cfg(any(test, feature = "test_mode"))]
            Backend::Mock(mock) => mock.get(&mock.aaaa, &host),
        }
    }

    /// A and AAAA merged, canonicalised.
    pub async fn ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        let mut ips = Vec::new();
        let mut missing = 0;
        match self.a(host).await {
            Ok(addrs) => ips.extend(addrs.into_iter().map(IpAddr::V4)),
            Err(DnsError::NotFound | DnsError::Empty) => missing += 1,
            Err(err) => return Err(err),
        }
        match self.aaaa(host).await {
            Ok(addrs) => {
                ips.extend(addrs.into_iter().map(|ip| canonical(IpAddr::V6(ip))));
            }
            Err(DnsError::NotFound | DnsError::Empty) => missing += 1,
            Err(err) => {
                if ips.is_empty() && missing > 0 {
                    return Err(err);
                }
            }
        }
        if missing == 2 {
            Err(DnsError::NotFound)
        } else {
            Ok(ips)
        }
    }

    /// MX exchange hostnames ordered by preference, lowercase, no trailing
    /// dot. A null MX (`.`) yields an empty list.
    pub async fn mx(&self, host: &str) -> DnsResult<Vec<String>> {
        let host = fqdn(host)?;
        match &self.backend {
            Backend::Hickory(resolver) => {
                let lookup = self.bounded(resolver.mx_lookup(host)).await?;
                let mut records: Vec<_> = lookup
                    .into_iter()
                    .map(|mx| (mx.preference(), hostname(&mx.exchange().to_utf8())))
                    .filter(|(_, name)| !name.is_empty())
                    .collect();
                records.sort();
                Ok(records.into_iter().map(|(_, name)| name).collect())
            }
            #[cfg(any(test, feature = "test_mode"))]
            Backend::Mock(mock) => mock.get(&mock.mx, &host),
        }
    }

    /// TXT strings with multi-string records concatenated per RFC 7208
    /// §3.3.
    pub async fn txt(&self, host: &str) -> DnsResult<Vec<String>> {
        let host = fqdn(host)?;
        match &self.backend {
            Backend::Hickory(resolver) => {
                let lookup = self.bounded(resolver.txt_lookup(host)).await?;
                Ok(lookup
                    .into_iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part).into_owned())
                            .collect::<Vec<_>>()
                            .concat()
                    })
                    .collect())
            }
            #[cfg(any(test, feature = "test_mode"))]
            Backend::Mock(mock) => mock.get(&mock.txt, &host),
        }
    }

    /// PTR names for an address, lowercase, no trailing dot.
    pub async fn ptr(&self, ip: IpAddr) -> DnsResult<Vec<String>> {
        match &self.backend {
            Backend::Hickory(resolver) => {
                let lookup = self.bounded(resolver.reverse_lookup(ip)).await?;
                Ok(lookup
                    .into_iter()
                    .map(|ptr| hostname(&ptr.to_utf8()))
                    .filter(|name| !name.is_empty())
                    .collect())
            }
            #[cfg(any(test, feature = "test_mode"))]
            Backend::Mock(mock) => mock.get(&mock.ptr, &canonical(ip).to_string()),
        }
    }

    async fn bounded<T>(
        &self,
        lookup: impl std::future::Future<Output = Result<T, ResolveError>>,
    ) -> DnsResult<T> {
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(DnsError::from(err)),
            Err(_) => Err(DnsError::Unavailable),
        }
    }
}

#[cfg(any(test, feature = "test_mode"))]
impl MockDns {
    fn get<T: Clone>(
        &self,
        map: &ahash::AHashMap<String, Vec<T>>,
        host: &str,
    ) -> DnsResult<Vec<T>> {
        let host = host.trim_end_matches('.');
        if self.unavailable.contains(host) {
            Err(DnsError::Unavailable)
        } else {
            match map.get(host) {
                Some(records) if records.is_empty() => Err(DnsError::Empty),
                Some(records) => Ok(records.clone()),
                None => Err(DnsError::NotFound),
            }
        }
    }
}

impl From<ResolveError> for DnsError {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => match response_code {
                ResponseCode::NXDomain => DnsError::NotFound,
                ResponseCode::NoError => DnsError::Empty,
                _ => DnsError::Unavailable,
            },
            ResolveErrorKind::Timeout | ResolveErrorKind::Io(_) | ResolveErrorKind::Proto(_) => {
                DnsError::Unavailable
            }
            _ => DnsError::Unavailable,
        }
    }
}

fn fqdn(host: &str) -> DnsResult<String> {
    let host = host.trim().trim_end_matches('.').to_lowercase();
    if host.is_empty()
        || host.len() > 253
        || !host
            .bytes()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == b'-' || ch == b'.' || ch == b'_')
    {
        Err(DnsError::Invalid)
    } else {
        Ok(format!("{host}."))
    }
}

fn hostname(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::fqdn;
    use crate::resolver::DnsError;

    #[test]
    fn fqdn_validation() {
        assert_eq!(fqdn("Example.COM."), Ok("example.com.".to_string()));
        assert_eq!(fqdn("mx1.example.net"), Ok("mx1.example.net.".to_string()));
        assert_eq!(fqdn(""), Err(DnsError::Invalid));
        assert_eq!(fqdn("bad host"), Err(DnsError::Invalid));
    }
}
