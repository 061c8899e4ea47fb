/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Identifier tokens. A token is a plain string in one of a handful of
//! shapes; the shape decides whether it accumulates reputation, how
//! policy lists match it and how the expanded set is built.
//!
//! - `192.0.2.5` / `2001:db8::1`: canonical peer address
//! - `.mx.example.com`: rooted hostname suffix
//! - `@example.com`: sending domain
//! - `alice@example.com`: full mailbox (freemail providers)
//! - `>bob@test.tld`: recipient tag, never accumulates reputation
//! - `client@tenant.tld:`: tenant tag, same treatment

use std::collections::BTreeSet;
use std::net::IpAddr;

use common::ip::normalize_ip;

pub type TokenSet = BTreeSet<String>;

/// True for tokens that accumulate reputation: addresses, rooted
/// hostnames, sending domains and mailboxes. Tags and list patterns do
/// not.
pub fn is_accountable(token: &str) -> bool {
    if token.is_empty() || token.starts_with('>') || token.ends_with(':') {
        false
    } else if let Some(host) = token.strip_prefix('.') {
        is_hostname(host)
    } else if let Some(host) = token.strip_prefix('@') {
        is_hostname(host)
    } else if token.contains('@') {
        is_email(token)
    } else {
        normalize_ip(token).is_some() || is_hostname(token)
    }
}

pub fn is_ip_token(token: &str) -> bool {
    normalize_ip(token).is_some()
}

/// Plain hostname with at least two labels and an alphabetic TLD.
pub fn is_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 || !host.contains('.') {
        return false;
    }
    let mut labels = 0;
    for label in host.split('.') {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
            || !label
                .bytes()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == b'-' || ch == b'_')
        {
            return false;
        }
        labels += 1;
    }
    labels >= 2
        && host
            .rsplit('.')
            .next()
            .is_some_and(|tld| tld.bytes().all(|ch| ch.is_ascii_alphabetic()))
}

pub fn is_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && local.len() <= 64
                && !local.contains('@')
                && local.bytes().all(|ch| {
                    ch.is_ascii_alphanumeric()
                        || matches!(ch, b'.' | b'-' | b'_' | b'+' | b'=' | b'/')
                })
                && is_hostname(domain)
        }
        None => false,
    }
}

pub fn domain_of(address: &str) -> Option<&str> {
    address.split_once('@').map(|(_, domain)| domain)
}

/// Registered (public-suffix aware) domain of a hostname.
pub fn registered_domain(host: &str) -> Option<String> {
    let host = host.trim_start_matches('.').trim_end_matches('.');
    psl::domain_str(host).map(|domain| domain.to_lowercase())
}

/// Reserved top-level domains that can never receive internet mail.
pub fn is_reserved_domain(host: &str) -> bool {
    let host = host
        .trim_start_matches('@')
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_lowercase();
    let tld = host.rsplit('.').next().unwrap_or(host.as_str());
    matches!(
        tld,
        "test" | "example" | "invalid" | "localhost" | "local" | "lan" | "corp" | "home"
            | "internal" | "intranet" | "onion" | "arpa"
    )
}

/// Rooted form of a hostname: `mx.example.com` → `.mx.example.com`.
pub fn rooted(host: &str) -> String {
    let host = host.trim_end_matches('.').to_lowercase();
    if host.starts_with('.') {
        host
    } else {
        format!(".{host}")
    }
}

/// Expands a token set with the registered domain of every hostname
/// shape it contains, so a complaint against `.mx.spam.example.com` also
/// lands on `.example.com`.
pub fn expand(tokens: &TokenSet) -> TokenSet {
    let mut expanded = TokenSet::new();
    for token in tokens {
        expanded.insert(token.clone());
        let host = if let Some(host) = token.strip_prefix('@') {
            host
        } else if let Some(host) = token.strip_prefix('.') {
            host
        } else if is_hostname(token) {
            token.as_str()
        } else {
            continue;
        };
        if is_hostname(host) {
            if let Some(domain) = registered_domain(host) {
                expanded.insert(format!(".{domain}"));
            }
        }
    }
    expanded
}

/// Accountable subset of an expanded token set.
pub fn accountable(tokens: &TokenSet) -> impl Iterator<Item = &str> {
    tokens
        .iter()
        .map(String::as_str)
        .filter(|token| is_accountable(token))
}

/// Identifier class used by flood thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Ip,
    Sender,
    Helo,
}

pub fn classify(token: &str) -> TokenClass {
    if is_ip_token(token) {
        TokenClass::Ip
    } else if token.starts_with('@') || is_email(token) {
        TokenClass::Sender
    } else {
        TokenClass::Helo
    }
}

pub fn canonical_ip_token(ip: IpAddr) -> String {
    common::ip::canonical(ip).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accountable_shapes() {
        assert!(is_accountable("192.0.2.5"));
        assert!(is_accountable("2001:db8::1"));
        assert!(is_accountable(".mx.example.com"));
        assert!(is_accountable("@example.com"));
        assert!(is_accountable("alice@example.com"));
        assert!(!is_accountable(">bob@test.tld"));
        assert!(!is_accountable("client@tenant.tld:"));
        assert!(!is_accountable(""));
    }

    #[test]
    fn hostname_validation() {
        assert!(is_hostname("mx.example.com"));
        assert!(is_hostname("a-b.example.co.uk"));
        assert!(!is_hostname("example"));
        assert!(!is_hostname("-bad.example.com"));
        assert!(!is_hostname("exa mple.com"));
        assert!(!is_hostname("example.123"));
    }

    #[test]
    fn email_validation() {
        assert!(is_email("alice@example.com"));
        assert!(is_email("a.b+c@sub.example.net"));
        assert!(!is_email("alice"));
        assert!(!is_email("@example.com"));
        assert!(!is_email("alice@nodot"));
    }

    #[test]
    fn registered_domains() {
        assert_eq!(
            registered_domain("mx.spam.example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            registered_domain(".www.example.co.uk").as_deref(),
            Some("example.co.uk")
        );
    }

    #[test]
    fn reserved_domains() {
        assert!(is_reserved_domain("host.invalid"));
        assert!(is_reserved_domain("printer.local"));
        assert!(is_reserved_domain("@example.test"));
        assert!(!is_reserved_domain("example.com"));
    }

    #[test]
    fn expansion_adds_registered_domain() {
        let mut tokens = TokenSet::new();
        tokens.insert("192.0.2.5".to_string());
        tokens.insert(".mx.spam.example.com".to_string());
        tokens.insert("@mail.example.org".to_string());
        tokens.insert(">bob@test.tld".to_string());

        let expanded = expand(&tokens);
        assert!(expanded.contains(".example.com"));
        assert!(expanded.contains(".example.org"));
        assert!(expanded.contains("192.0.2.5"));
        assert!(expanded.contains(">bob@test.tld"));
        // Full mailboxes do not expand.
        assert_eq!(expanded.len(), 6);
    }

    #[test]
    fn token_classes() {
        assert_eq!(classify("192.0.2.5"), TokenClass::Ip);
        assert_eq!(classify("@example.com"), TokenClass::Sender);
        assert_eq!(classify("alice@example.com"), TokenClass::Sender);
        assert_eq!(classify(".mx.example.com"), TokenClass::Helo);
    }
}
