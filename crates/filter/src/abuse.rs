/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Abuse throttle for the DNS-list frontend. Malformed or unauthorised
//! queries count per source network (/25 for IPv4, /52 for IPv6); a
//! network exceeding the configured budget is refused for a week.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use common::config::AbuseConfig;
use common::ip::{canonical, Cidr};
use parking_lot::RwLock;
use utils::unix_secs;

const ABUSE_PREFIX_V4: u8 = 25;
const ABUSE_PREFIX_V6: u8 = 52;

#[derive(Debug, Clone, Default)]
pub struct AbusePeriod {
    pub first: u64,
    pub last: u64,
    pub count: u64,
    pub banned_until: u64,
}

#[derive(Default)]
pub struct AbuseRegistry {
    map: RwLock<AHashMap<String, AbusePeriod>>,
    dirty: AtomicBool,
}

pub fn abuse_key(ip: IpAddr) -> String {
    let ip = canonical(ip);
    let prefix = match ip {
        IpAddr::V4(_) => ABUSE_PREFIX_V4,
        IpAddr::V6(_) => ABUSE_PREFIX_V6,
    };
    Cidr::new(ip, prefix)
        .map(|cidr| cidr.to_string())
        .unwrap_or_else(|| ip.to_string())
}

impl AbuseRegistry {
    /// Counts one abuse event for the source network. Returns `true` when
    /// this event tripped the ban.
    pub fn register_event(&self, ip: IpAddr, config: &AbuseConfig) -> bool {
        let key = abuse_key(ip);
        let now = unix_secs();
        let mut map = self.map.write();
        let period = map.entry(key).or_default();
        if period.first == 0 || now.saturating_sub(period.first) > config.limit.period.as_secs()
        {
            period.first = now;
            period.count = 0;
        }
        period.last = now;
        period.count += 1;
        let newly_banned = period.count > config.limit.requests && period.banned_until <= now;
        if newly_banned {
            period.banned_until = now + config.ban.as_secs();
        }
        drop(map);
        self.dirty.store(true, Ordering::Relaxed);
        newly_banned
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let key = abuse_key(ip);
        self.map
            .read()
            .get(&key)
            .is_some_and(|period| period.banned_until > unix_secs())
    }

    pub fn expire(&self, config: &AbuseConfig) {
        let now = unix_secs();
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, period| {
            period.banned_until > now
                || now.saturating_sub(period.last) <= config.limit.period.as_secs()
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

    /// `dns.abuse.txt` lines: `cidr first last count banned-until`.
    pub fn snapshot_lines(&self) -> Vec<String> {
        self.map
            .read()
            .iter()
            .map(|(cidr, period)| {
                format!(
                    "{cidr} {} {} {} {}",
                    period.first, period.last, period.count, period.banned_until
                )
            })
            .collect()
    }

    pub fn restore_lines(&self, lines: impl Iterator<Item = String>) {
        let mut map = self.map.write();
        for line in lines {
            let mut parts = line.split_whitespace();
            let (Some(cidr), Some(first), Some(last), Some(count), Some(banned_until)) = (
                parts.next(),
                parts.next().and_then(|v| v.parse().ok()),
                parts.next().and_then(|v| v.parse().ok()),
                parts.next().and_then(|v| v.parse().ok()),
                parts.next().and_then(|v| v.parse().ok()),
            ) else {
                continue;
            };
            map.insert(
                cidr.to_string(),
                AbusePeriod {
                    first,
                    last,
                    count,
                    banned_until,
                },
            );
        }
    }
}

/// Abuse contacts (RFC 2142-style) keyed by CIDR or rooted domain,
/// served by the DNSAL zone and maintained through the admin verbs.
#[derive(Default)]
pub struct AbuseContacts {
    map: RwLock<AHashMap<String, String>>,
    dirty: AtomicBool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct AbuseContactRecord {
    pub key: String,
    pub email: String,
}

impl AbuseContacts {
    pub fn add(&self, key: &str, email: &str) -> bool {
        let Some(key) = normalize_contact_key(key) else {
            return false;
        };
        let replaced = self
            .map
            .write()
            .insert(key, email.to_lowercase())
            .is_none();
        self.dirty.store(true, Ordering::Relaxed);
        replaced
    }

    pub fn drop_contact(&self, key: &str) -> bool {
        let Some(key) = normalize_contact_key(key) else {
            return false;
        };
        let removed = self.map.write().remove(&key).is_some();
        if removed {
            self.dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    /// Longest-match contact for an address: host CIDR first, then any
    /// containing block.
    pub fn lookup_ip(&self, ip: IpAddr) -> Option<String> {
        let ip = canonical(ip);
        let map = self.map.read();
        let mut best: Option<(u8, &String)> = None;
        for (key, email) in map.iter() {
            if let Ok(cidr) = key.parse::<Cidr>() {
                if cidr.contains(ip) && best.map_or(true, |(prefix, _)| cidr.prefix() > prefix)
                {
                    best = Some((cidr.prefix(), email));
                }
            }
        }
        best.map(|(_, email)| email.clone())
    }

    pub fn lookup_domain(&self, host: &str) -> Option<String> {
        let host = host.trim_start_matches('.').to_lowercase();
        let map = self.map.read();
        let mut labels = host.as_str();
        loop {
            if let Some(email) = map.get(&format!(".{labels}")) {
                return Some(email.clone());
            }
            match labels.split_once('.') {
                Some((_, rest)) if rest.contains('.') => labels = rest,
                _ => return None,
            }
        }
    }

    pub fn entries(&self) -> Vec<AbuseContactRecord> {
        let mut entries: Vec<AbuseContactRecord> = self
            .map
            .read()
            .iter()
            .map(|(key, email)| AbuseContactRecord {
                key: key.clone(),
                email: email.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn restore(&self, records: Vec<AbuseContactRecord>) {
        let mut map = self.map.write();
        for record in records {
            map.insert(record.key, record.email);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

fn normalize_contact_key(key: &str) -> Option<String> {
    if let Ok(cidr) = key.parse::<Cidr>() {
        Some(cidr.to_string())
    } else {
        let host = key.trim_start_matches('.').to_lowercase();
        crate::token::is_hostname(&host).then(|| format!(".{host}"))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use common::config::AbuseConfig;
    use utils::config::Rate;

    use super::{abuse_key, AbuseRegistry};

    fn config(limit: u64) -> AbuseConfig {
        AbuseConfig {
            limit: Rate {
                requests: limit,
                period: Duration::from_secs(7 * 86400),
            },
            ban: Duration::from_secs(7 * 86400),
        }
    }

    #[test]
    fn keys_group_by_network() {
        let a = abuse_key(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));
        let b = abuse_key(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 126)));
        let c = abuse_key(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 200)));
        assert_eq!(a, b); // same /25
        assert_ne!(a, c); // other half of the /24
    }

    #[test]
    fn ban_after_budget_exceeded() {
        let registry = AbuseRegistry::default();
        let config = config(10);
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));

        for _ in 0..10 {
            assert!(!registry.register_event(ip, &config));
        }
        assert!(!registry.is_banned(ip));
        // The 11th event trips the ban.
        assert!(registry.register_event(ip, &config));
        assert!(registry.is_banned(ip));
        // Neighbours in the same /25 are banned with it.
        assert!(registry.is_banned(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 77))));
        // A different network is unaffected.
        assert!(!registry.is_banned(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))));
    }

    #[test]
    fn snapshot_round_trip() {
        let registry = AbuseRegistry::default();
        let config = config(2);
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        for _ in 0..4 {
            registry.register_event(ip, &config);
        }

        let restored = AbuseRegistry::default();
        restored.restore_lines(registry.snapshot_lines().into_iter());
        assert!(restored.is_banned(ip));
    }

    #[test]
    fn abuse_contacts_longest_match() {
        let contacts = super::AbuseContacts::default();
        assert!(contacts.add("198.51.100.0/24", "abuse@isp.example"));
        assert!(contacts.add("198.51.100.64/26", "noc@isp.example"));
        assert!(contacts.add(".isp.example", "abuse@isp.example"));
        assert!(!contacts.add("not a key", "x@y.example"));

        let narrow = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 70));
        assert_eq!(
            contacts.lookup_ip(narrow).as_deref(),
            Some("noc@isp.example")
        );
        let wide = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(
            contacts.lookup_ip(wide).as_deref(),
            Some("abuse@isp.example")
        );
        assert!(contacts.lookup_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))).is_none());

        assert_eq!(
            contacts.lookup_domain("smtp.out.isp.example").as_deref(),
            Some("abuse@isp.example")
        );
        assert!(contacts.lookup_domain("other.example").is_none());
    }
}
