/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Complaint ledger: an append-only map from ticket timestamp to the
//! accountable tokens that were complained about. Timestamp uniqueness is
//! what makes complaints idempotent; a colliding key bumps by one
//! microsecond until free.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use common::config::ttl;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use utils::unix_micros;

#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerSnapshotRecord {
    pub time: u64,
    pub tokens: String,
}

pub struct ComplaintLedger {
    map: RwLock<BTreeMap<u64, String>>,
    dirty: AtomicBool,
}

impl Default for ComplaintLedger {
    fn default() -> Self {
        ComplaintLedger {
            map: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
        }
    }
}

impl ComplaintLedger {
    /// Records a complaint keyed by the ticket's timestamp in
    /// microseconds. Returns `false` when the exact ticket was already
    /// complained about.
    pub fn insert(&self, ticket_micros: u64, tokens: &str) -> bool {
        let mut map = self.map.write();
        match map.get(&ticket_micros) {
            Some(existing) if existing == tokens => return false,
            Some(_) => {
                // Different complaint landing on a taken slot: bump until
                // a free microsecond is found.
                let mut key = ticket_micros + 1;
                while map.contains_key(&key) {
                    if map.get(&key).is_some_and(|existing| existing == tokens) {
                        return false;
                    }
                    key += 1;
                }
                map.insert(key, tokens.to_string());
            }
            None => {
                map.insert(ticket_micros, tokens.to_string());
            }
        }
        drop(map);
        self.dirty.store(true, Ordering::Relaxed);
        true
    }

    /// Withdraws a complaint. Returns the stored token string, or `None`
    /// when the ticket was never complained about (or already removed).
    pub fn remove(&self, ticket_micros: u64, tokens: &str) -> Option<String> {
        let mut map = self.map.write();
        // The entry usually sits at the exact key; bumped entries are
        // right behind it.
        let key = map
            .range(ticket_micros..)
            .take_while(|(time, _)| **time < ticket_micros + 1000)
            .find(|(_, existing)| existing.as_str() == tokens)
            .map(|(time, _)| *time)?;
        let removed = map.remove(&key);
        drop(map);
        self.dirty.store(true, Ordering::Relaxed);
        removed
    }

    pub fn contains(&self, ticket_micros: u64, tokens: &str) -> bool {
        self.map
            .read()
            .range(ticket_micros..)
            .take_while(|(time, _)| **time < ticket_micros + 1000)
            .any(|(_, existing)| existing.as_str() == tokens)
    }

    /// Drops entries older than one week.
    pub fn expire(&self) {
        let horizon =
            unix_micros().saturating_sub(ttl::LEDGER_TTL.as_micros() as u64);
        let mut map = self.map.write();
        let keep = map.split_off(&horizon);
        let expired = !map.is_empty();
        *map = keep;
        drop(map);
        if expired {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<LedgerSnapshotRecord> {
        self.map
            .read()
            .iter()
            .map(|(time, tokens)| LedgerSnapshotRecord {
                time: *time,
                tokens: tokens.clone(),
            })
            .collect()
    }

    pub fn restore(&self, snapshot: Vec<LedgerSnapshotRecord>) {
        let horizon =
            unix_micros().saturating_sub(ttl::LEDGER_TTL.as_micros() as u64);
        let mut map = self.map.write();
        for record in snapshot {
            if record.time >= horizon {
                map.insert(record.time, record.tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ComplaintLedger;

    #[test]
    fn duplicate_complaints_rejected() {
        let ledger = ComplaintLedger::default();
        assert!(ledger.insert(1_000_000, "192.0.2.5 .mx.example.com"));
        assert!(!ledger.insert(1_000_000, "192.0.2.5 .mx.example.com"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn collisions_bump_by_a_microsecond() {
        let ledger = ComplaintLedger::default();
        assert!(ledger.insert(1_000_000, "192.0.2.5"));
        assert!(ledger.insert(1_000_000, "198.51.100.7"));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains(1_000_000, "198.51.100.7"));
    }

    #[test]
    fn remove_round_trip() {
        let ledger = ComplaintLedger::default();
        ledger.insert(1_000_000, "192.0.2.5");
        assert_eq!(
            ledger.remove(1_000_000, "192.0.2.5").as_deref(),
            Some("192.0.2.5")
        );
        // A second removal finds nothing.
        assert!(ledger.remove(1_000_000, "192.0.2.5").is_none());
    }

    #[test]
    fn expiry_keeps_recent_entries() {
        let ledger = ComplaintLedger::default();
        ledger.insert(1, "ancient.example");
        ledger.insert(utils::unix_micros(), "192.0.2.5");
        ledger.expire();
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.contains(1, "ancient.example"));
    }
}
