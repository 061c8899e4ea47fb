/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use common::ip::{normalize_ip, reverse_v4, reverse_nibbles_v6, Cidr};
use common::resolver::Resolver;
use parking_lot::RwLock;
use regex::Regex;

use crate::token::{domain_of, is_email, is_hostname, registered_domain};

/// Which entry families a list accepts.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub cidr: bool,
    pub regex: bool,
    pub whois: bool,
    pub dnsbl: bool,
    pub fail_qualifier: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Capabilities {
            cidr: true,
            regex: true,
            whois: true,
            dnsbl: true,
            fail_qualifier: true,
        }
    }

    pub fn tokens_only() -> Self {
        Capabilities {
            cidr: true,
            regex: false,
            whois: false,
            dnsbl: false,
            fail_qualifier: false,
        }
    }

    pub fn patterns() -> Self {
        Capabilities {
            cidr: false,
            regex: true,
            whois: false,
            dnsbl: false,
            fail_qualifier: false,
        }
    }

    pub fn recipients() -> Self {
        Capabilities {
            cidr: false,
            regex: false,
            whois: false,
            dnsbl: false,
            fail_qualifier: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListError {
    #[error("unsupported token shape for this list")]
    UnsupportedShape,
    #[error("invalid token: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionQuery<'x> {
    pub client: Option<&'x str>,
    pub ip: &'x str,
    pub sender: Option<&'x str>,
    /// Rooted confirmed hostname, `.mx.example.com`.
    pub hostname: Option<&'x str>,
    pub result: &'x str,
    pub recipient: Option<&'x str>,
}

/// One policy list. `exact` also holds qualifier- and recipient-scoped
/// entries (`token;PASS`, `token>rcpt@dom`), which only transaction
/// queries generate candidates for.
pub struct PolicyList {
    name: &'static str,
    capabilities: Capabilities,
    exact: RwLock<BTreeSet<String>>,
    cidrs: RwLock<BTreeSet<String>>,
    regexes: RwLock<Vec<(String, Regex)>>,
    whois: RwLock<BTreeSet<String>>,
    dnsbl: RwLock<BTreeSet<String>>,
    dirty: AtomicBool,
}

impl PolicyList {
    pub fn new(name: &'static str, capabilities: Capabilities) -> Self {
        PolicyList {
            name,
            capabilities,
            exact: RwLock::new(BTreeSet::new()),
            cidrs: RwLock::new(BTreeSet::new()),
            regexes: RwLock::new(Vec::new()),
            whois: RwLock::new(BTreeSet::new()),
            dnsbl: RwLock::new(BTreeSet::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Normalises and stores a token in its matcher family. Returns
    /// `false` when the entry already existed.
    pub fn add(&self, token: &str) -> Result<bool, ListError> {
        let added = match normalize_entry(token, &self.capabilities)? {
            Entry::Exact(value) => self.exact.write().insert(value),
            Entry::Cidr(value) => self.cidrs.write().insert(value.to_string()),
            Entry::Regex(pattern, regex) => {
                let mut regexes = self.regexes.write();
                if regexes.iter().any(|(existing, _)| *existing == pattern) {
                    false
                } else {
                    regexes.push((pattern, regex));
                    true
                }
            }
            Entry::Whois(value) => self.whois.write().insert(value),
            Entry::Dnsbl(value) => self.dnsbl.write().insert(value),
        };
        if added {
            self.dirty.store(true, Ordering::Relaxed);
        }
        Ok(added)
    }

    pub fn drop_entry(&self, token: &str) -> bool {
        let Ok(entry) = normalize_entry(token, &self.capabilities) else {
            return false;
        };
        let removed = match entry {
            Entry::Exact(value) => self.exact.write().remove(&value),
            Entry::Cidr(value) => self.cidrs.write().remove(&value.to_string()),
            Entry::Regex(pattern, _) => {
                let mut regexes = self.regexes.write();
                let before = regexes.len();
                regexes.retain(|(existing, _)| *existing != pattern);
                regexes.len() != before
            }
            Entry::Whois(value) => self.whois.write().remove(&value),
            Entry::Dnsbl(value) => self.dnsbl.write().remove(&value),
        };
        if removed {
            self.dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains_exact(&self, token: &str) -> bool {
        self.exact.read().contains(token)
    }

    /// Membership for a single token: exact, rooted-suffix chain, sender
    /// domain forms, CIDR and regex families.
    pub fn matches_token(&self, token: &str) -> bool {
        let exact = self.exact.read();
        if exact.contains(token) {
            return true;
        }

        if let Some(ip) = normalize_ip(token) {
            drop(exact);
            return self.matches_ip(ip) || self.matches_regex(token);
        }

        // Hostname shapes match any listed parent suffix.
        let host = token.strip_prefix('.').unwrap_or(token);
        if is_hostname(host) || token.starts_with('.') {
            for suffix in suffix_chain(host) {
                if exact.contains(&suffix) {
                    return true;
                }
            }
        }

        // Mailboxes also match their domain forms.
        if is_email(token) {
            if let Some(domain) = domain_of(token) {
                if exact.contains(&format!("@{domain}")) {
                    return true;
                }
                for suffix in suffix_chain(domain) {
                    if exact.contains(&suffix) {
                        return true;
                    }
                }
            }
        }
        if let Some(domain) = token.strip_prefix('@') {
            for suffix in suffix_chain(domain) {
                if exact.contains(&suffix) {
                    return true;
                }
            }
        }

        drop(exact);
        self.matches_regex(token)
    }

    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        let canonical = common::ip::canonical(ip);
        if self.exact.read().contains(&canonical.to_string()) {
            return true;
        }
        self.cidrs
            .read()
            .iter()
            .filter_map(|cidr| cidr.parse::<Cidr>().ok())
            .any(|cidr| cidr.contains(canonical))
    }

    fn matches_regex(&self, token: &str) -> bool {
        let regexes = self.regexes.read();
        regexes.iter().any(|(_, regex)| regex.is_match(token))
    }

    /// Recipient membership: mailbox, `@domain`, domain suffixes.
    pub fn matches_recipient(&self, recipient: &str) -> bool {
        let recipient = recipient.to_lowercase();
        let exact = self.exact.read();
        if exact.contains(&recipient) {
            return true;
        }
        if let Some(domain) = domain_of(&recipient) {
            if exact.contains(&format!("@{domain}")) {
                return true;
            }
            for suffix in suffix_chain(domain) {
                if exact.contains(&suffix) {
                    return true;
                }
            }
        }
        drop(exact);
        self.matches_regex(&recipient)
    }

    /// Transaction membership: candidates derived from every identifier
    /// of the transaction, plain and scoped by SPF result, recipient and
    /// client.
    pub fn matches_transaction(&self, query: &TransactionQuery<'_>) -> bool {
        let exact = self.exact.read();
        for candidate in candidate_keys(query) {
            if exact.contains(&candidate) {
                return true;
            }
        }
        drop(exact);

        if let Some(ip) = normalize_ip(query.ip) {
            if self.matches_ip(ip) {
                return true;
            }
        }
        if self.matches_regex(query.ip) {
            return true;
        }
        if let Some(sender) = query.sender {
            if self.matches_regex(sender) {
                return true;
            }
        }
        if let Some(hostname) = query.hostname {
            if self.matches_regex(hostname) {
                return true;
            }
        }
        false
    }

    /// Clears entries that made a transaction match: the exact-candidate
    /// set plus a host CIDR. Returns what was removed.
    pub fn clear_transaction(&self, query: &TransactionQuery<'_>) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let mut exact = self.exact.write();
            for candidate in candidate_keys(query) {
                if exact.remove(&candidate) {
                    removed.push(candidate);
                }
            }
        }
        if let Some(ip) = normalize_ip(query.ip) {
            let host_cidr = Cidr::host(ip).to_string();
            if self.cidrs.write().remove(&host_cidr) {
                removed.push(format!("CIDR={host_cidr}"));
            }
        }
        if !removed.is_empty() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    /// External DNSBL references (`DNSBL=zone;127.0.0.2`): the peer
    /// address is looked up in the referenced zone and matches when the
    /// answer equals the listed value.
    pub async fn matches_dnsbl(&self, resolver: &Resolver, ip: IpAddr) -> bool {
        let references: Vec<String> = self.dnsbl.read().iter().cloned().collect();
        if references.is_empty() {
            return false;
        }
        let reversed = match common::ip::canonical(ip) {
            IpAddr::V4(v4) => reverse_v4(v4),
            IpAddr::V6(v6) => reverse_nibbles_v6(v6),
        };
        for reference in references {
            let Some((zone, value)) = reference
                .strip_prefix("DNSBL=")
                .and_then(|r| r.split_once(';'))
            else {
                continue;
            };
            let Some(expect) = normalize_ip(value) else {
                continue;
            };
            if let Ok(addresses) = resolver.a(&format!("{reversed}.{zone}")).await {
                if addresses.iter().any(|a| IpAddr::V4(*a) == expect) {
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.exact.read().len()
            + self.cidrs.read().len()
            + self.regexes.read().len()
            + self.whois.read().len()
            + self.dnsbl.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Every entry in its canonical spelling, for SHOW and persistence.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self.exact.read().iter().cloned().collect();
        entries.extend(self.cidrs.read().iter().map(|cidr| format!("CIDR={cidr}")));
        entries.extend(
            self.regexes
                .read()
                .iter()
                .map(|(pattern, _)| format!("REGEX={pattern}")),
        );
        entries.extend(self.whois.read().iter().cloned());
        entries.extend(self.dnsbl.read().iter().cloned());
        entries
    }

    pub fn restore(&self, entries: Vec<String>) {
        for entry in entries {
            if let Err(err) = self.add(&entry) {
                tracing::warn!(
                    context = "list",
                    event = "restore-skip",
                    list = self.name,
                    entry = entry.as_str(),
                    "Skipping entry: {err}"
                );
            }
        }
    }
}

enum Entry {
    Exact(String),
    Cidr(Cidr),
    Regex(String, Regex),
    Whois(String),
    Dnsbl(String),
}

/// Splits an entry into its matcher family, validating as the original
/// token vocabulary does: `CIDR=`, `REGEX=`, `WHOIS/field=value`,
/// `DNSBL=zone;value`, plain tokens with optional `;QUALIFIER` and
/// `>recipient` scopes.
fn normalize_entry(token: &str, capabilities: &Capabilities) -> Result<Entry, ListError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ListError::Invalid("empty token".to_string()));
    }

    if let Some(rest) = token.strip_prefix("CIDR=") {
        if !capabilities.cidr {
            return Err(ListError::UnsupportedShape);
        }
        let cidr: Cidr = rest
            .parse()
            .map_err(|_| ListError::Invalid(format!("bad CIDR {rest:?}")))?;
        return Ok(Entry::Cidr(cidr));
    }
    if let Some(pattern) = token.strip_prefix("REGEX=") {
        if !capabilities.regex {
            return Err(ListError::UnsupportedShape);
        }
        let regex = Regex::new(pattern)
            .map_err(|err| ListError::Invalid(format!("bad regex: {err}")))?;
        return Ok(Entry::Regex(pattern.to_string(), regex));
    }
    if token.starts_with("WHOIS/") {
        if !capabilities.whois {
            return Err(ListError::UnsupportedShape);
        }
        if !token.contains('=') {
            return Err(ListError::Invalid("WHOIS entry needs field=value".to_string()));
        }
        return Ok(Entry::Whois(token.to_string()));
    }
    if let Some(rest) = token.strip_prefix("DNSBL=") {
        if !capabilities.dnsbl {
            return Err(ListError::UnsupportedShape);
        }
        let (zone, value) = rest
            .split_once(';')
            .ok_or_else(|| ListError::Invalid("DNSBL entry needs zone;value".to_string()))?;
        if !is_hostname(zone) || normalize_ip(value).is_none() {
            return Err(ListError::Invalid(format!("bad DNSBL reference {rest:?}")));
        }
        return Ok(Entry::Dnsbl(format!(
            "DNSBL={};{}",
            zone.to_lowercase(),
            normalize_ip(value).unwrap_or_else(|| unreachable!())
        )));
    }

    // HREF and executable-signature entries used by the URI zone.
    if let Some(rest) = token.strip_prefix("HREF=") {
        return Ok(Entry::Exact(format!("HREF={}", rest.to_lowercase())));
    }
    if let Some(rest) = token.strip_prefix("SIG=") {
        return Ok(Entry::Exact(format!("SIG={}", rest.to_lowercase())));
    }

    // Plain token, with optional qualifier and recipient scope.
    let (body, scope) = split_scopes(token, capabilities)?;
    let body = body.to_lowercase();

    if let Some(ip) = normalize_ip(&body) {
        return Ok(Entry::Exact(format!("{ip}{scope}")));
    }
    if body.starts_with('@') && is_hostname(&body[1..]) {
        return Ok(Entry::Exact(format!("{body}{scope}")));
    }
    if let Some(host) = body.strip_prefix('.') {
        if is_hostname(host) {
            return Ok(Entry::Exact(format!(".{host}{scope}")));
        }
    }
    if is_email(&body) {
        return Ok(Entry::Exact(format!("{body}{scope}")));
    }
    if is_hostname(&body) {
        // Bare hostnames are stored rooted.
        return Ok(Entry::Exact(format!(".{body}{scope}")));
    }

    Err(ListError::Invalid(format!("unrecognised token {token:?}")))
}

fn split_scopes<'x>(
    token: &'x str,
    capabilities: &Capabilities,
) -> Result<(&'x str, String), ListError> {
    let mut scope = String::new();
    let (token, recipient) = match token.split_once('>') {
        Some((token, recipient)) => {
            let recipient = recipient.to_lowercase();
            if !is_email(&recipient)
                && !(recipient.starts_with('@') && is_hostname(&recipient[1..]))
            {
                return Err(ListError::Invalid(format!(
                    "bad recipient scope {recipient:?}"
                )));
            }
            (token, Some(recipient))
        }
        None => (token, None),
    };
    let (token, qualifier) = match token.split_once(';') {
        Some((token, qualifier)) => {
            let qualifier = qualifier.to_uppercase();
            let allowed = matches!(
                qualifier.as_str(),
                "PASS" | "SOFTFAIL" | "NEUTRAL" | "NONE"
            ) || (capabilities.fail_qualifier && qualifier == "FAIL");
            if !allowed {
                return Err(ListError::Invalid(format!("bad qualifier {qualifier:?}")));
            }
            (token, Some(qualifier))
        }
        None => (token, None),
    };
    if let Some(qualifier) = qualifier {
        scope.push(';');
        scope.push_str(&qualifier);
    }
    if let Some(recipient) = recipient {
        scope.push('>');
        scope.push_str(&recipient);
    }
    Ok((token, scope))
}

/// `.mx.spam.example.com` → every rooted parent down to the registered
/// domain.
fn suffix_chain(host: &str) -> Vec<String> {
    let host = host.trim_start_matches('.').to_lowercase();
    let stop = registered_domain(&host).unwrap_or_else(|| host.clone());
    let mut chain = Vec::new();
    let mut rest = host.as_str();
    loop {
        chain.push(format!(".{rest}"));
        if rest == stop {
            break;
        }
        match rest.split_once('.') {
            Some((_, parent)) if parent.contains('.') => rest = parent,
            _ => break,
        }
    }
    chain
}

fn candidate_keys(query: &TransactionQuery<'_>) -> Vec<String> {
    let mut bases = vec![query.ip.to_string()];
    if let Some(sender) = query.sender {
        let sender = sender.to_lowercase();
        if let Some(domain) = domain_of(&sender).map(str::to_string) {
            bases.push(format!("@{domain}"));
            bases.extend(suffix_chain(&domain));
        }
        bases.push(sender);
    }
    if let Some(hostname) = query.hostname {
        bases.extend(suffix_chain(hostname));
    }

    let mut scoped = Vec::with_capacity(bases.len() * 2);
    for base in bases {
        scoped.push(format!("{base};{}", query.result));
        scoped.push(base);
    }

    let mut candidates = Vec::with_capacity(scoped.len() * 3);
    for key in scoped {
        if let Some(recipient) = query.recipient {
            let recipient = recipient.to_lowercase();
            candidates.push(format!("{key}>{recipient}"));
            if let Some(domain) = domain_of(&recipient) {
                candidates.push(format!("{key}>@{domain}"));
            }
        }
        candidates.push(key);
    }

    if let Some(client) = query.client {
        let client_scoped: Vec<String> = candidates
            .iter()
            .map(|key| format!("{client}:{key}"))
            .collect();
        candidates.extend(client_scoped);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::{Capabilities, ListError, PolicyList, TransactionQuery};

    fn list() -> PolicyList {
        PolicyList::new("block", Capabilities::full())
    }

    #[test]
    fn entry_families_split_at_insert() {
        let list = list();
        assert!(list.add("192.0.2.5").unwrap());
        assert!(list.add("CIDR=198.51.100.0/24").unwrap());
        assert!(list.add("REGEX=^bulk[0-9]+@").unwrap());
        assert!(list.add("WHOIS/ownerid=12.345.678/0001-90").unwrap());
        assert!(list.add("DNSBL=zen.spamhaus.org;127.0.0.2").unwrap());
        assert!(list.add(".spam.example.com").unwrap());
        assert!(list.add("@spammer.example").unwrap());
        assert_eq!(list.len(), 7);

        // Duplicates are reported, not stored twice.
        assert!(!list.add("192.0.2.5").unwrap());
    }

    #[test]
    fn capability_enforcement() {
        let recipients = PolicyList::new("trap", Capabilities::recipients());
        assert_eq!(
            recipients.add("CIDR=10.0.0.0/8"),
            Err(ListError::UnsupportedShape)
        );
        assert_eq!(
            recipients.add("REGEX=.*"),
            Err(ListError::UnsupportedShape)
        );
        assert!(recipients.add("honeypot@test.tld").is_ok());
    }

    #[test]
    fn bad_entries_rejected() {
        let list = list();
        assert!(matches!(list.add("REGEX=(unbalanced"), Err(ListError::Invalid(_))));
        assert!(matches!(list.add("DNSBL=zone-no-value"), Err(ListError::Invalid(_))));
        assert!(matches!(list.add("!!!"), Err(ListError::Invalid(_))));
        assert!(matches!(list.add("token;BOGUS"), Err(ListError::Invalid(_))));
    }

    #[test]
    fn token_matching_with_suffixes() {
        let list = list();
        list.add(".example.com").unwrap();
        assert!(list.matches_token(".mx.spam.example.com"));
        assert!(list.matches_token("mx.example.com"));
        assert!(list.matches_token("alice@example.com"));
        assert!(list.matches_token("@example.com"));
        assert!(!list.matches_token(".example.org"));
        // Suffix matching stops at the registered domain.
        assert!(!list.matches_token(".notexample.com"));
    }

    #[test]
    fn cidr_matching() {
        let list = list();
        list.add("CIDR=198.51.100.0/24").unwrap();
        assert!(list.matches_ip(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 77))));
        assert!(!list.matches_ip(IpAddr::V4(Ipv4Addr::new(198, 51, 101, 1))));
        assert!(list.matches_token("198.51.100.77"));
    }

    #[test]
    fn regex_matching() {
        let list = list();
        list.add("REGEX=^bulk[0-9]+@").unwrap();
        assert!(list.matches_token("bulk42@anywhere.example"));
        assert!(!list.matches_token("alice@anywhere.example"));
    }

    #[test]
    fn transaction_candidates() {
        let list = list();
        list.add("@spam.example;FAIL").unwrap();
        let query = TransactionQuery {
            client: None,
            ip: "192.0.2.5",
            sender: Some("x@spam.example"),
            hostname: Some(".mx.spam.example"),
            result: "FAIL",
            recipient: Some("bob@test.tld"),
        };
        assert!(list.matches_transaction(&query));
        assert!(!list.matches_transaction(&TransactionQuery {
            result: "PASS",
            ..query
        }));
    }

    #[test]
    fn recipient_scoped_entries() {
        let list = list();
        list.add(".bulk.example>bob@test.tld").unwrap();
        let query = TransactionQuery {
            client: None,
            ip: "192.0.2.5",
            sender: Some("news@bulk.example"),
            hostname: Some(".out.bulk.example"),
            result: "PASS",
            recipient: Some("bob@test.tld"),
        };
        assert!(list.matches_transaction(&query));
        assert!(!list.matches_transaction(&TransactionQuery {
            recipient: Some("carol@test.tld"),
            ..query
        }));
    }

    #[test]
    fn clear_removes_matching_entries() {
        let list = list();
        list.add("192.0.2.5").unwrap();
        list.add(".spam.example").unwrap();
        let query = TransactionQuery {
            client: None,
            ip: "192.0.2.5",
            sender: Some("x@spam.example"),
            hostname: Some(".mx.spam.example"),
            result: "PASS",
            recipient: None,
        };
        let removed = list.clear_transaction(&query);
        assert!(removed.contains(&"192.0.2.5".to_string()));
        assert!(removed.contains(&".spam.example".to_string()));
        assert!(!list.matches_transaction(&query));
    }

    #[test]
    fn entries_round_trip() {
        let list = list();
        list.add("192.0.2.5").unwrap();
        list.add("CIDR=198.51.100.0/24").unwrap();
        list.add("REGEX=^bulk").unwrap();

        let restored = PolicyList::new("block", Capabilities::full());
        restored.restore(list.entries());
        assert_eq!(restored.len(), 3);
        assert!(restored.matches_token("bulk@x.example"));
    }
}
