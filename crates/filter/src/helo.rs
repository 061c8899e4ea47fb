/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! HELO forward-confirmation cache. Each entry holds the A/AAAA address
//! sets of a HELO hostname so that `match(ip, helo)` and the dual-stack
//! unique addresses come from cache instead of a lookup per transaction.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use common::config::ttl;
use common::ip::canonical;
use common::resolver::{DnsError, Resolver};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use utils::unix_secs;

use crate::token::is_hostname;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeloEntry {
    /// Empty after NXDOMAIN; kept so negative answers also cache.
    pub addresses: Vec<IpAddr>,
    pub unique_v4: Option<IpAddr>,
    pub unique_v6: Option<IpAddr>,
    pub queries: u32,
    pub last_refresh: u64,
    pub last_query: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeloSnapshotRecord {
    pub host: String,
    #[serde(flatten)]
    pub entry: HeloEntry,
}

#[derive(Default)]
pub struct HeloCache {
    map: RwLock<AHashMap<String, HeloEntry>>,
    dirty: AtomicBool,
}

impl HeloCache {
    /// True when the HELO hostname resolves to the peer address.
    pub async fn matches(&self, resolver: &Resolver, ip: IpAddr, helo: &str) -> bool {
        let Some(host) = normalize(helo) else {
            return false;
        };
        let ip = canonical(ip);
        self.entry(resolver, &host)
            .await
            .is_some_and(|entry| entry.addresses.contains(&ip))
    }

    /// Dual-stack equivalence: the single IPv4 and single IPv6 address of
    /// a hostname, when each family resolves to exactly one.
    pub async fn unique_addresses(
        &self,
        resolver: &Resolver,
        host: &str,
    ) -> (Option<IpAddr>, Option<IpAddr>) {
        let Some(host) = normalize(host) else {
            return (None, None);
        };
        match self.entry(resolver, &host).await {
            Some(entry) => (entry.unique_v4, entry.unique_v6),
            None => (None, None),
        }
    }

    async fn entry(&self, resolver: &Resolver, host: &str) -> Option<HeloEntry> {
        let now = unix_secs();
        {
            let mut map = self.map.write();
            if let Some(entry) = map.get_mut(host) {
                if now.saturating_sub(entry.last_refresh) <= ttl::HELO_REFRESH.as_secs() {
                    entry.queries = entry.queries.saturating_add(1);
                    entry.last_query = now;
                    let entry = entry.clone();
                    self.dirty.store(true, Ordering::Relaxed);
                    return Some(entry);
                }
            }
        }

        let entry = self.resolve(resolver, host).await?;
        self.map.write().insert(host.to_string(), entry.clone());
        self.dirty.store(true, Ordering::Relaxed);
        Some(entry)
    }

    async fn resolve(&self, resolver: &Resolver, host: &str) -> Option<HeloEntry> {
        let now = unix_secs();
        let addresses = match resolver.ip(host).await {
            Ok(addresses) => addresses,
            Err(DnsError::NotFound | DnsError::Empty | DnsError::Invalid) => Vec::new(),
            Err(DnsError::Unavailable) => {
                // Keep whatever was cached rather than flapping on outages.
                return self.map.read().get(host).cloned();
            }
        };
        let v4: Vec<_> = addresses.iter().filter(|ip| ip.is_ipv4()).collect();
        let v6: Vec<_> = addresses.iter().filter(|ip| ip.is_ipv6()).collect();
        Some(HeloEntry {
            unique_v4: (v4.len() == 1).then(|| *v4[0]),
            unique_v6: (v6.len() == 1).then(|| *v6[0]),
            addresses,
            queries: 1,
            last_refresh: now,
            last_query: now,
        })
    }

    /// Drops entries nobody queried for two weeks.
    pub fn expire(&self) {
        let now = unix_secs();
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, entry| {
            now.saturating_sub(entry.last_query) <= ttl::HELO_EVICT.as_secs()
        });
        if map.len() != before {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<HeloSnapshotRecord> {
        self.map
            .read()
            .iter()
            .map(|(host, entry)| HeloSnapshotRecord {
                host: host.clone(),
                entry: entry.clone(),
            })
            .collect()
    }

    pub fn restore(&self, snapshot: Vec<HeloSnapshotRecord>) {
        let now = unix_secs();
        let mut map = self.map.write();
        for record in snapshot {
            if now.saturating_sub(record.entry.last_query) <= ttl::HELO_EVICT.as_secs() {
                map.insert(record.host, record.entry);
            }
        }
    }
}

fn normalize(helo: &str) -> Option<String> {
    let host = helo
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_lowercase();
    is_hostname(&host).then_some(host)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use common::resolver::{MockDns, Resolver};

    use super::HeloCache;

    fn resolver() -> Resolver {
        let mut mock = MockDns::default();
        mock.a.insert(
            "mx.example.com".to_string(),
            vec![Ipv4Addr::new(192, 0, 2, 5)],
        );
        mock.aaaa.insert(
            "mx.example.com".to_string(),
            vec!["2001:db8::25".parse::<Ipv6Addr>().unwrap()],
        );
        mock.a.insert(
            "multi.example.com".to_string(),
            vec![Ipv4Addr::new(192, 0, 2, 10), Ipv4Addr::new(192, 0, 2, 11)],
        );
        Resolver::mock(mock)
    }

    #[tokio::test]
    async fn forward_confirmation() {
        let cache = HeloCache::default();
        let resolver = resolver();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5));
        assert!(cache.matches(&resolver, ip, "mx.example.com").await);
        assert!(cache.matches(&resolver, ip, "MX.Example.COM.").await);
        assert!(
            !cache
                .matches(&resolver, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), "mx.example.com")
                .await
        );
        assert!(!cache.matches(&resolver, ip, "gone.example.com").await);
        assert!(!cache.matches(&resolver, ip, "not a hostname").await);
    }

    #[tokio::test]
    async fn dual_stack_uniques() {
        let cache = HeloCache::default();
        let resolver = resolver();
        let (v4, v6) = cache.unique_addresses(&resolver, "mx.example.com").await;
        assert_eq!(v4, Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))));
        assert_eq!(
            v6,
            Some(IpAddr::V6("2001:db8::25".parse().unwrap()))
        );

        // Two A records: no unique IPv4.
        let (v4, _) = cache.unique_addresses(&resolver, "multi.example.com").await;
        assert_eq!(v4, None);
    }

    #[tokio::test]
    async fn negative_answers_cache_too() {
        let cache = HeloCache::default();
        let resolver = resolver();
        assert!(
            !cache
                .matches(
                    &resolver,
                    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
                    "gone.example.com"
                )
                .await
        );
        let snapshot = cache.snapshot();
        assert!(snapshot.iter().any(|record| record.host == "gone.example.com"
            && record.entry.addresses.is_empty()));
    }
}
