/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Name-keyed cache of parsed sender-policy records. Records are fetched
//! on first query, refreshed by a background scheduler when under query
//! pressure, flagged inexistent on repeated NXDOMAIN and evicted after two
//! weeks without queries. The raw merged registry text is what persists;
//! mechanisms are re-parsed on load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use common::config::ttl;
use common::resolver::{DnsError, DnsResult, Resolver};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use utils::unix_secs;

use crate::record::ParsedRecord;

/// NXDOMAIN answers beyond this, under sustained query pressure, mark the
/// domain definitely inexistent.
const NXDOMAIN_LIMIT: u32 = 3;
const NXDOMAIN_QUERY_LIMIT: u32 = 32;

/// Background refresh only re-resolves records with real traffic.
const REFRESH_QUERY_FLOOR: u32 = 3;

#[derive(Debug, Clone)]
pub struct SpfEntry {
    /// `None` after an NXDOMAIN answer.
    pub record: Option<Arc<ParsedRecord>>,
    pub registry: Option<String>,
    pub nxdomain: u32,
    pub queries: u32,
    pub last_refresh: u64,
    pub last_query: u64,
}

impl SpfEntry {
    pub fn is_inexistent(&self) -> bool {
        self.record.is_none()
    }

    pub fn is_definitely_inexistent(&self) -> bool {
        self.record.is_none()
            && self.nxdomain > NXDOMAIN_LIMIT
            && self.queries > NXDOMAIN_QUERY_LIMIT
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpfSnapshotRecord {
    pub host: String,
    pub registry: Option<String>,
    pub nxdomain: u32,
    pub queries: u32,
    pub last_refresh: u64,
    pub last_query: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GuessSnapshotRecord {
    pub host: String,
    pub registry: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    NotLoaded,
}

pub struct SpfRegistry {
    records: RwLock<AHashMap<String, SpfEntry>>,
    guesses: RwLock<AHashMap<String, String>>,
    best_guess: String,
    dirty: AtomicBool,
    guess_dirty: AtomicBool,
}

impl SpfRegistry {
    pub fn new(best_guess: impl Into<String>) -> Self {
        SpfRegistry {
            records: RwLock::new(AHashMap::new()),
            guesses: RwLock::new(AHashMap::new()),
            best_guess: best_guess.into(),
            dirty: AtomicBool::new(false),
            guess_dirty: AtomicBool::new(false),
        }
    }

    /// Returns the cached entry for a domain, fetching it on first use.
    /// Every call counts as a query for the refresh scheduler.
    pub async fn lookup(&self, resolver: &Resolver, host: &str) -> DnsResult<SpfEntry> {
        let host = host.trim_end_matches('.').to_lowercase();
        if let Some(entry) = self.touch(&host) {
            return Ok(entry);
        }

        // First query for this domain: resolve now, best-guess on outage.
        let entry = self.fetch(resolver, &host, true).await?;
        let mut records = self.records.write();
        let entry = records
            .entry(host)
            .and_modify(|existing| {
                existing.queries += 1;
                existing.last_query = unix_secs();
            })
            .or_insert(entry)
            .clone();
        drop(records);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(entry)
    }

    fn touch(&self, host: &str) -> Option<SpfEntry> {
        let mut records = self.records.write();
        let entry = records.get_mut(host)?;
        entry.queries = entry.queries.saturating_add(1);
        entry.last_query = unix_secs();
        self.dirty.store(true, Ordering::Relaxed);
        Some(entry.clone())
    }

    async fn fetch(
        &self,
        resolver: &Resolver,
        host: &str,
        guess_when_unavailable: bool,
    ) -> DnsResult<SpfEntry> {
        let now = unix_secs();
        let registries = match resolver.txt(host).await {
            Ok(strings) => {
                let registries: Vec<String> = strings
                    .into_iter()
                    .filter(|txt| {
                        txt.starts_with("v=spf1 ") || txt == "v=spf1"
                    })
                    .collect();
                if registries.is_empty() {
                    vec![self.guess_for(host)]
                } else {
                    registries
                }
            }
            Err(DnsError::Empty) => vec![self.guess_for(host)],
            Err(DnsError::NotFound) => {
                return Ok(SpfEntry {
                    record: None,
                    registry: None,
                    nxdomain: 1,
                    queries: 1,
                    last_refresh: now,
                    last_query: now,
                });
            }
            Err(err @ (DnsError::Unavailable | DnsError::Invalid)) => {
                if guess_when_unavailable && err == DnsError::Unavailable {
                    vec![self.guess_for(host)]
                } else {
                    return Err(err);
                }
            }
        };

        let record = ParsedRecord::parse(&registries);
        Ok(SpfEntry {
            record: Some(Arc::new(record)),
            registry: Some(registries.join("\n")),
            nxdomain: 0,
            queries: 1,
            last_refresh: now,
            last_query: now,
        })
    }

    /// Re-resolves a cached record in place. `Updated` resets the query
    /// pressure counter; a DNS outage keeps the stale record.
    pub async fn refresh(&self, resolver: &Resolver, host: &str) -> RefreshOutcome {
        let host = host.trim_end_matches('.').to_lowercase();
        if !self.records.read().contains_key(&host) {
            return RefreshOutcome::NotLoaded;
        }
        match self.fetch(resolver, &host, false).await {
            Ok(mut fetched) => {
                let mut records = self.records.write();
                if let Some(entry) = records.get_mut(&host) {
                    fetched.queries = 0;
                    fetched.last_query = entry.last_query;
                    if fetched.record.is_none() {
                        // NXDOMAIN accumulates across refreshes.
                        fetched.nxdomain = entry.nxdomain.saturating_add(1);
                        fetched.queries = entry.queries;
                    }
                    *entry = fetched;
                }
                drop(records);
                self.dirty.store(true, Ordering::Relaxed);
                RefreshOutcome::Updated
            }
            Err(err) => {
                tracing::debug!(
                    context = "spf",
                    event = "refresh-failed",
                    domain = host.as_str(),
                    "Keeping stale record: {err}"
                );
                RefreshOutcome::Updated
            }
        }
    }

    /// Picks the record with the highest query pressure for the background
    /// refresh loop, if any is both stale and busy enough.
    pub fn refresh_candidate(&self) -> Option<String> {
        let now = unix_secs();
        let records = self.records.read();
        records
            .iter()
            .filter(|(_, entry)| {
                entry.queries > REFRESH_QUERY_FLOOR
                    && now.saturating_sub(entry.last_refresh) > ttl::SPF_REFRESH.as_secs()
            })
            .max_by_key(|(_, entry)| entry.queries)
            .map(|(host, _)| host.clone())
    }

    /// Drops records that nobody queried for two weeks.
    pub fn expire(&self) {
        let now = unix_secs();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, entry| {
            now.saturating_sub(entry.last_query) <= ttl::SPF_EVICT.as_secs()
        });
        if records.len() != before {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn get(&self, host: &str) -> Option<SpfEntry> {
        self.records
            .read()
            .get(&host.trim_end_matches('.').to_lowercase())
            .cloned()
    }

    fn guess_for(&self, host: &str) -> String {
        self.guesses
            .read()
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.best_guess.clone())
    }

    pub fn add_guess(&self, host: &str, registry: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        let replaced = self
            .guesses
            .write()
            .insert(host.clone(), registry.to_string());
        // Re-parse any cached record that was built from the old guess.
        self.records.write().remove(&host);
        self.guess_dirty.store(true, Ordering::Relaxed);
        replaced.is_none()
    }

    pub fn drop_guess(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        let removed = self.guesses.write().remove(&host).is_some();
        if removed {
            self.records.write().remove(&host);
            self.guess_dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    pub fn guesses(&self) -> Vec<(String, String)> {
        let mut list: Vec<_> = self
            .guesses
            .read()
            .iter()
            .map(|(host, registry)| (host.clone(), registry.clone()))
            .collect();
        list.sort();
        list
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn take_guess_dirty(&self) -> bool {
        self.guess_dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn mark_guess_dirty(&self) {
        self.guess_dirty.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<SpfSnapshotRecord> {
        self.records
            .read()
            .iter()
            .map(|(host, entry)| SpfSnapshotRecord {
                host: host.clone(),
                registry: entry.registry.clone(),
                nxdomain: entry.nxdomain,
                queries: entry.queries,
                last_refresh: entry.last_refresh,
                last_query: entry.last_query,
            })
            .collect()
    }

    pub fn restore(&self, snapshot: Vec<SpfSnapshotRecord>) {
        let now = unix_secs();
        let mut records = self.records.write();
        for item in snapshot {
            if now.saturating_sub(item.last_query) > ttl::SPF_EVICT.as_secs() {
                continue;
            }
            let record = item.registry.as_ref().map(|registry| {
                Arc::new(ParsedRecord::parse(
                    &registry.lines().map(str::to_string).collect::<Vec<_>>(),
                ))
            });
            records.insert(
                item.host,
                SpfEntry {
                    record,
                    registry: item.registry,
                    nxdomain: item.nxdomain,
                    queries: item.queries,
                    last_refresh: item.last_refresh,
                    last_query: item.last_query,
                },
            );
        }
    }

    pub fn guess_snapshot(&self) -> Vec<GuessSnapshotRecord> {
        self.guesses
            .read()
            .iter()
            .map(|(host, registry)| GuessSnapshotRecord {
                host: host.clone(),
                registry: registry.clone(),
            })
            .collect()
    }

    pub fn restore_guesses(&self, snapshot: Vec<GuessSnapshotRecord>) {
        let mut guesses = self.guesses.write();
        for item in snapshot {
            guesses.insert(item.host, item.registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use common::resolver::{MockDns, Resolver};

    use super::{RefreshOutcome, SpfRegistry};

    const BEST_GUESS: &str = "v=spf1 a/24//48 mx/24//48 ptr ?all";

    fn resolver() -> Resolver {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:198.51.100.0/24 -all".to_string()],
        );
        mock.txt.insert(
            "nospf.example".to_string(),
            vec!["some other txt".to_string()],
        );
        Resolver::mock(mock)
    }

    #[tokio::test]
    async fn fetches_and_caches() {
        let registry = SpfRegistry::new(BEST_GUESS);
        let resolver = resolver();

        let entry = registry.lookup(&resolver, "example.com").await.unwrap();
        assert!(!entry.is_inexistent());
        assert_eq!(entry.queries, 1);

        let entry = registry.lookup(&resolver, "Example.COM.").await.unwrap();
        assert_eq!(entry.queries, 2);
    }

    #[tokio::test]
    async fn best_guess_when_no_record() {
        let registry = SpfRegistry::new(BEST_GUESS);
        let resolver = resolver();

        let entry = registry.lookup(&resolver, "nospf.example").await.unwrap();
        let record = entry.record.unwrap();
        // The fallback carries a, mx and ptr mechanisms plus ?all.
        assert_eq!(record.mechanisms.len(), 3);
        assert!(record.all.is_some());
    }

    #[tokio::test]
    async fn nxdomain_counts_toward_inexistence() {
        let registry = SpfRegistry::new(BEST_GUESS);
        let resolver = resolver();

        let entry = registry
            .lookup(&resolver, "definitely.not.a.domain")
            .await
            .unwrap();
        assert!(entry.is_inexistent());
        assert!(!entry.is_definitely_inexistent());

        for _ in 0..4 {
            registry.refresh(&resolver, "definitely.not.a.domain").await;
        }
        for _ in 0..40 {
            registry
                .lookup(&resolver, "definitely.not.a.domain")
                .await
                .unwrap();
        }
        let entry = registry.get("definitely.not.a.domain").unwrap();
        assert!(entry.is_definitely_inexistent());
    }

    #[tokio::test]
    async fn refresh_requires_loaded_record() {
        let registry = SpfRegistry::new(BEST_GUESS);
        let resolver = resolver();

        assert_eq!(
            registry.refresh(&resolver, "example.com").await,
            RefreshOutcome::NotLoaded
        );
        registry.lookup(&resolver, "example.com").await.unwrap();
        assert_eq!(
            registry.refresh(&resolver, "example.com").await,
            RefreshOutcome::Updated
        );
    }

    #[tokio::test]
    async fn guess_override_replaces_cached_record() {
        let registry = SpfRegistry::new(BEST_GUESS);
        let resolver = resolver();

        registry.lookup(&resolver, "nospf.example").await.unwrap();
        assert!(registry.add_guess("nospf.example", "v=spf1 ip4:203.0.113.0/24 -all"));
        let entry = registry.lookup(&resolver, "nospf.example").await.unwrap();
        assert_eq!(entry.record.unwrap().mechanisms.len(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let registry = SpfRegistry::new(BEST_GUESS);
        let now = utils::unix_secs();
        registry.restore(vec![super::SpfSnapshotRecord {
            host: "example.com".to_string(),
            registry: Some("v=spf1 mx -all".to_string()),
            nxdomain: 0,
            queries: 7,
            last_refresh: now,
            last_query: now,
        }]);
        let entry = registry.get("example.com").unwrap();
        assert_eq!(entry.queries, 7);
        assert_eq!(entry.record.unwrap().mechanisms.len(), 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].registry.as_deref(), Some("v=spf1 mx -all"));
    }
}
