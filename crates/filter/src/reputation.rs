/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Per-token reputation. Each identifier keeps a complaint counter and an
//! incremental normal distribution over query inter-arrival times; the
//! estimated ham volume is one week of traffic at the minimum plausible
//! inter-arrival, and the spam probability derived from the two drives a
//! WHITE → GRAY → BLACK → BLOCK state machine with hysteresis.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use common::config::ttl;
use common::config::FloodConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use utils::unix_millis;

use crate::token::{classify, is_ip_token, TokenClass};

const P_WHITE: f32 = 1.0 / 64.0;
const P_GRAY: f32 = 0.25;
const P_BLACK: f32 = 0.50;
const P_BLOCK: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    White,
    Gray,
    Black,
    Block,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::White => "WHITE",
            Status::Gray => "GRAY",
            Status::Black => "BLACK",
            Status::Block => "BLOCK",
        }
    }
}

/// Incremental normal distribution over inter-arrival seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalDistribution {
    count: u64,
    sum: f64,
    sum_squares: f64,
}

impl NormalDistribution {
    pub fn with_element(value: f64) -> Self {
        let mut distribution = NormalDistribution::default();
        distribution.add_element(value);
        distribution
    }

    pub fn add_element(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn standard_error(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = ((self.sum_squares - self.sum * self.sum / n) / (n - 1.0)).max(0.0);
        (variance / n).sqrt()
    }

    /// Lower confidence bound of the mean inter-arrival, clamped
    /// non-negative.
    pub fn minimum(&self) -> f64 {
        (self.average() - self.standard_error()).max(0.0)
    }

    pub fn maximum(&self) -> f64 {
        self.average() + self.standard_error()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    complaints: u32,
    last_query: u64,
    last_complaint: u64,
    status: Status,
    frequency: Option<NormalDistribution>,
}

impl Default for Distribution {
    fn default() -> Self {
        Distribution {
            complaints: 0,
            last_query: 0,
            last_complaint: 0,
            status: Status::White,
            frequency: None,
        }
    }
}

impl Distribution {
    pub fn add_query(&mut self) {
        let now = unix_millis();
        let interval = if self.last_query == 0 {
            0.0
        } else {
            now.saturating_sub(self.last_query) as f64 / 1000.0
        };
        self.last_query = now;
        if interval == 0.0 {
            self.frequency = None;
        } else {
            match &mut self.frequency {
                Some(frequency) => frequency.add_element(interval),
                None => self.frequency = Some(NormalDistribution::with_element(interval)),
            }
        }
    }

    pub fn add_spam(&mut self) -> bool {
        if self.complaints < u32::MAX {
            self.complaints += 1;
            self.last_complaint = unix_millis();
            true
        } else {
            false
        }
    }

    pub fn remove_spam(&mut self) -> bool {
        if self.complaints > 0 {
            self.complaints -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) -> bool {
        if self.complaints == 0 {
            false
        } else {
            self.complaints = 0;
            self.status = Status::White;
            true
        }
    }

    pub fn complaints(&self) -> u32 {
        self.complaints
    }

    pub fn is_expired(&self) -> bool {
        unix_millis().saturating_sub(self.last_query)
            > ttl::DISTRIBUTION_EVICT.as_millis() as u64
    }

    pub fn minimum_interarrival(&self) -> Option<f64> {
        self.frequency.as_ref().map(NormalDistribution::minimum)
    }

    /// Local (ham, spam) sample estimated from the traffic frequency.
    pub fn binomial(&self) -> (u64, u64) {
        match &self.frequency {
            Some(frequency) if frequency.minimum() > 0.0 => {
                let total =
                    ((ttl::HAM_WINDOW_SECS / frequency.minimum()) as u64).max(self.complaints as u64);
                (total - self.complaints as u64, self.complaints as u64)
            }
            _ => (0, 0),
        }
    }

    /// Spam probability with the minimum-sample floor: high probabilities
    /// need enough complaints before they are believed.
    pub fn probability(&self, extra: (u64, u64)) -> f32 {
        let (ham, spam) = self.binomial();
        let ham = ham + extra.0;
        let spam = spam + extra.1;
        let total = ham + spam;
        if total == 0 {
            return 0.0;
        }
        let probability = spam as f32 / total as f32;
        if probability > P_GRAY && spam < 3 {
            P_GRAY
        } else if probability > P_BLACK && spam < 5 {
            P_BLACK
        } else if probability > P_BLOCK && spam < 7 {
            P_BLOCK
        } else {
            probability
        }
    }

    /// Advances the state machine. Listing happens at the probability
    /// peak; the label only fully clears once the probability has fallen
    /// well below the listing threshold.
    pub fn refresh_status(&mut self, token: &str, extra: (u64, u64)) -> Status {
        let previous = self.status;
        let probability = self.probability(extra);
        self.status = if probability < P_WHITE {
            Status::White
        } else if probability < P_GRAY {
            if previous == Status::Black {
                Status::Gray
            } else {
                previous
            }
        } else if probability > P_BLOCK {
            if is_ip_token(token) {
                Status::Black
            } else {
                Status::Block
            }
        } else if probability > P_BLACK {
            Status::Black
        } else if probability > P_GRAY {
            if is_ip_token(token) {
                Status::Gray
            } else {
                Status::Black
            }
        } else {
            previous
        };
        self.status
    }

    pub fn is_flood(&self, token: &str, flood: &FloodConfig) -> bool {
        match self.minimum_interarrival() {
            Some(minimum) => {
                let threshold = match classify(token) {
                    TokenClass::Ip => flood.ip,
                    TokenClass::Sender => flood.sender,
                    TokenClass::Helo => flood.helo,
                };
                minimum < threshold
            }
            None => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DistributionSnapshotRecord {
    pub token: String,
    #[serde(flatten)]
    pub distribution: Distribution,
}

/// Peer-contributed binomials aggregated per token, already weighted by
/// the sending peer's observed agreement rate.
#[derive(Debug, Default, Clone)]
struct PeerBinomial {
    ham: u64,
    spam: u64,
}

#[derive(Debug, Default)]
struct PeerTrust {
    agreements: u64,
    total: u64,
}

impl PeerTrust {
    fn weight(&self) -> f64 {
        if self.total < 8 {
            1.0
        } else {
            match self.agreements as f64 / self.total as f64 {
                rate if rate >= 0.8 => 1.0,
                rate if rate >= 0.5 => 0.5,
                _ => 0.25,
            }
        }
    }
}

pub struct ReputationStore {
    map: RwLock<AHashMap<String, Distribution>>,
    peer_map: RwLock<AHashMap<String, AHashMap<SocketAddr, PeerBinomial>>>,
    peer_trust: RwLock<AHashMap<SocketAddr, PeerTrust>>,
    flood: FloodConfig,
    dirty: AtomicBool,
}

impl ReputationStore {
    pub fn new(flood: FloodConfig) -> Self {
        ReputationStore {
            map: RwLock::new(AHashMap::new()),
            peer_map: RwLock::new(AHashMap::new()),
            peer_trust: RwLock::new(AHashMap::new()),
            flood,
            dirty: AtomicBool::new(false),
        }
    }

    fn peer_extra(&self, token: &str) -> (u64, u64) {
        self.peer_map
            .read()
            .get(token)
            .map(|peers| {
                peers.values().fold((0, 0), |(ham, spam), binomial| {
                    (ham + binomial.ham, spam + binomial.spam)
                })
            })
            .unwrap_or((0, 0))
    }

    pub fn add_query(&self, token: &str) {
        let mut map = self.map.write();
        map.entry(token.to_string()).or_default().add_query();
        drop(map);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Registers a complaint. Returns the new distribution for gossip when
    /// the counter moved.
    pub fn add_spam(&self, token: &str) -> Option<Distribution> {
        let extra = self.peer_extra(token);
        let mut map = self.map.write();
        let distribution = map.entry(token.to_string()).or_default();
        if distribution.add_spam() {
            distribution.refresh_status(token, extra);
            let snapshot = distribution.clone();
            drop(map);
            self.dirty.store(true, Ordering::Relaxed);
            Some(snapshot)
        } else {
            None
        }
    }

    pub fn remove_spam(&self, token: &str) -> Option<Distribution> {
        let extra = self.peer_extra(token);
        let mut map = self.map.write();
        let distribution = map.get_mut(token)?;
        if distribution.remove_spam() {
            distribution.refresh_status(token, extra);
            let snapshot = distribution.clone();
            drop(map);
            self.dirty.store(true, Ordering::Relaxed);
            Some(snapshot)
        } else {
            None
        }
    }

    /// Clears the complaint counter of every token matching the given
    /// key or rooted under it. Returns the cleared tokens.
    pub fn clear(&self, key: &str) -> Vec<String> {
        let mut cleared = Vec::new();
        let mut map = self.map.write();
        for (token, distribution) in map.iter_mut() {
            if token == key || (key.starts_with('.') && token.ends_with(key)) {
                if distribution.clear() {
                    cleared.push(token.clone());
                }
            }
        }
        drop(map);
        if !cleared.is_empty() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        cleared
    }

    pub fn drop_token(&self, token: &str) -> bool {
        let removed = self.map.write().remove(token).is_some();
        self.peer_map.write().remove(token);
        if removed {
            self.dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    pub fn status(&self, token: &str) -> Status {
        let extra = self.peer_extra(token);
        let mut map = self.map.write();
        match map.get_mut(token) {
            Some(distribution) => distribution.refresh_status(token, extra),
            None => Status::White,
        }
    }

    pub fn probability(&self, token: &str) -> Option<f32> {
        let extra = self.peer_extra(token);
        self.map
            .read()
            .get(token)
            .map(|distribution| distribution.probability(extra))
    }

    pub fn get(&self, token: &str) -> Option<Distribution> {
        self.map.read().get(token).cloned()
    }

    pub fn is_blacklisted(&self, token: &str) -> bool {
        self.status(token) == Status::Black
    }

    pub fn is_greylisted(&self, token: &str) -> bool {
        self.status(token) == Status::Gray
    }

    pub fn is_blocked_status(&self, token: &str) -> bool {
        self.status(token) == Status::Block
    }

    pub fn is_flood(&self, token: &str) -> bool {
        self.map
            .read()
            .get(token)
            .is_some_and(|distribution| distribution.is_flood(token, &self.flood))
    }

    /// Applies a reputation delta received from a peer. The delta is
    /// weighted by how often this peer has agreed with local observations.
    pub fn apply_peer(
        &self,
        peer: SocketAddr,
        token: &str,
        complaints: u32,
        minimum_interarrival: f64,
    ) {
        let weight = {
            let mut trust = self.peer_trust.write();
            let entry = trust.entry(peer).or_default();
            let peer_black = estimate_probability(complaints, minimum_interarrival) >= P_GRAY;
            let local_black =
                matches!(self.status(token), Status::Black | Status::Block | Status::Gray);
            entry.total += 1;
            if peer_black == local_black {
                entry.agreements += 1;
            }
            entry.weight()
        };

        let estimated = if minimum_interarrival > 0.0 {
            (ttl::HAM_WINDOW_SECS / minimum_interarrival) as u64
        } else {
            0
        };
        let ham = estimated.max(complaints as u64) - complaints as u64;
        let spam = (complaints as f64 * weight) as u64;

        self.peer_map
            .write()
            .entry(token.to_string())
            .or_default()
            .insert(peer, PeerBinomial { ham, spam });
    }

    pub fn drop_peer_token(&self, token: &str) {
        self.peer_map.write().remove(token);
    }

    /// Drops distributions with no queries in two weeks.
    pub fn expire(&self) {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, distribution| !distribution.is_expired());
        let changed = map.len() != before;
        drop(map);
        let live: ahash::AHashSet<String> =
            self.map.read().keys().cloned().collect();
        self.peer_map.write().retain(|token, _| live.contains(token));
        if changed {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<DistributionSnapshotRecord> {
        self.map
            .read()
            .iter()
            .map(|(token, distribution)| DistributionSnapshotRecord {
                token: token.clone(),
                distribution: distribution.clone(),
            })
            .collect()
    }

    pub fn restore(&self, snapshot: Vec<DistributionSnapshotRecord>) {
        let mut map = self.map.write();
        for record in snapshot {
            if !record.distribution.is_expired() {
                map.insert(record.token, record.distribution);
            }
        }
    }
}

fn estimate_probability(complaints: u32, minimum_interarrival: f64) -> f32 {
    if minimum_interarrival <= 0.0 {
        return 0.0;
    }
    let total = ((ttl::HAM_WINDOW_SECS / minimum_interarrival) as u64).max(complaints as u64);
    if total == 0 {
        0.0
    } else {
        complaints as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use common::config::FloodConfig;

    use super::{Distribution, NormalDistribution, ReputationStore, Status};

    fn flood() -> FloodConfig {
        FloodConfig {
            ip: 1.0,
            sender: 30.0,
            helo: 10.0,
        }
    }

    /// Distribution with a synthetic frequency: `total` queries a week.
    fn with_weekly_volume(total: u64) -> Distribution {
        let mut distribution = Distribution::default();
        let interval = 7.0 * 86400.0 / total as f64;
        let mut frequency = NormalDistribution::default();
        for _ in 0..16 {
            frequency.add_element(interval);
        }
        distribution.frequency = Some(frequency);
        distribution.last_query = utils::unix_millis();
        distribution
    }

    #[test]
    fn normal_distribution_statistics() {
        let mut nd = NormalDistribution::default();
        for value in [10.0, 12.0, 8.0, 10.0] {
            nd.add_element(value);
        }
        assert!((nd.average() - 10.0).abs() < 0.001);
        assert!(nd.minimum() < nd.average());
        assert!(nd.maximum() > nd.average());
        assert!(nd.minimum() >= 0.0);
    }

    #[test]
    fn probability_floors_until_enough_complaints() {
        // Two complaints against four weekly queries: the raw probability
        // of 0.5 is capped at 0.25 until there are three complaints.
        let mut distribution = with_weekly_volume(4);
        distribution.add_spam();
        distribution.add_spam();
        assert!((distribution.probability((0, 0)) - 0.25).abs() < f32::EPSILON);

        // Four of five: capped at 0.5 until five complaints.
        let mut distribution = with_weekly_volume(5);
        for _ in 0..4 {
            distribution.add_spam();
        }
        assert!((distribution.probability((0, 0)) - 0.50).abs() < f32::EPSILON);

        // Six of seven: capped at 0.75 until seven complaints.
        let mut distribution = with_weekly_volume(7);
        for _ in 0..6 {
            distribution.add_spam();
        }
        assert!((distribution.probability((0, 0)) - 0.75).abs() < f32::EPSILON);

        // Eight of nine: enough complaints, believed in full.
        let mut distribution = with_weekly_volume(9);
        for _ in 0..8 {
            distribution.add_spam();
        }
        assert!(distribution.probability((0, 0)) > 0.85);
    }

    #[test]
    fn status_hysteresis() {
        let mut distribution = with_weekly_volume(100);
        // Push to BLACK.
        for _ in 0..60 {
            distribution.add_spam();
        }
        assert_eq!(distribution.refresh_status("@spam.example", (0, 0)), Status::Black);

        // Improve to just under GRAY threshold: BLACK relaxes to GRAY,
        // not WHITE.
        while distribution.complaints() > 20 {
            distribution.remove_spam();
        }
        assert_eq!(distribution.refresh_status("@spam.example", (0, 0)), Status::Gray);

        // Only near-zero probability fully clears the label.
        while distribution.complaints() > 0 {
            distribution.remove_spam();
        }
        assert_eq!(distribution.refresh_status("@spam.example", (0, 0)), Status::White);
    }

    #[test]
    fn ip_tokens_top_out_at_black() {
        let mut distribution = with_weekly_volume(100);
        for _ in 0..90 {
            distribution.add_spam();
        }
        assert_eq!(distribution.refresh_status("192.0.2.5", (0, 0)), Status::Black);

        let mut domain = with_weekly_volume(100);
        for _ in 0..90 {
            domain.add_spam();
        }
        assert_eq!(domain.refresh_status("@spam.example", (0, 0)), Status::Block);
    }

    #[test]
    fn flood_thresholds_by_class() {
        let fast = with_weekly_volume(7 * 86400 * 2); // 0.5s interval
        assert!(fast.is_flood("192.0.2.5", &flood()));
        assert!(fast.is_flood("alice@example.com", &flood()));

        let slow = with_weekly_volume(7 * 86400 / 20); // 20s interval
        assert!(!slow.is_flood("192.0.2.5", &flood()));
        assert!(slow.is_flood("alice@example.com", &flood())); // < 30s
    }

    #[test]
    fn clear_resets_matching_tokens() {
        let store = ReputationStore::new(flood());
        store.add_query(".mx.example.com");
        store.add_spam(".mx.example.com");
        store.add_spam(".example.com");

        let cleared = store.clear(".example.com");
        assert_eq!(cleared.len(), 2);
        assert_eq!(store.get(".mx.example.com").unwrap().complaints(), 0);
    }

    #[test]
    fn complaint_counter_round_trip() {
        let store = ReputationStore::new(flood());
        assert!(store.add_spam("192.0.2.5").is_some());
        assert!(store.remove_spam("192.0.2.5").is_some());
        // A second removal has nothing left to undo.
        assert!(store.remove_spam("192.0.2.5").is_none());
    }

    #[test]
    fn snapshot_round_trip() {
        let store = ReputationStore::new(flood());
        store.add_query("192.0.2.5");
        store.add_spam("192.0.2.5");

        let snapshot = store.snapshot();
        let restored = ReputationStore::new(flood());
        restored.restore(snapshot);
        assert_eq!(restored.get("192.0.2.5").unwrap().complaints(), 1);
    }
}
