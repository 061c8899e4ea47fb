/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Decision pipeline. One call per SMTP transaction: the ordered rules
//! below combine the sender policy result, the configured lists, token
//! reputation, greylisting and flood control into a single action, and
//! every action that enters reputation accounting carries a ticket.

use std::future::Future;
use std::net::IpAddr;

use common::ip::{is_local, normalize_ip};
use spf::eval::SpfVerifier;
use spf::SpfResult;

use crate::lists::matcher::TransactionQuery;
use crate::token::{
    self, canonical_ip_token, domain_of, is_email, is_reserved_domain, registered_domain,
    rooted, TokenSet,
};
use crate::Engine;

/// PTR answers examined when the HELO name does not confirm.
const MAX_PTR_CANDIDATES: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct SpfRequest<'x> {
    pub ip: &'x str,
    pub sender: Option<&'x str>,
    pub helo: Option<&'x str>,
    pub recipient: Option<&'x str>,
    /// Tenant mailbox of the querying client, if any.
    pub client: Option<&'x str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Lan,
    Invalid,
    Nxdomain,
    Blocked,
    Listed,
    Greylist,
    SpamTrap,
    Result(SpfResult),
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Lan => "LAN",
            Verdict::Invalid => "INVALID",
            Verdict::Nxdomain => "NXDOMAIN",
            Verdict::Blocked => "BLOCKED",
            Verdict::Listed => "LISTED",
            Verdict::Greylist => "GREYLIST",
            Verdict::SpamTrap => "SPAMTRAP",
            Verdict::Result(result) => match result {
                SpfResult::Pass => "PASS",
                SpfResult::Fail => "FAIL",
                SpfResult::SoftFail => "SOFTFAIL",
                SpfResult::Neutral => "NEUTRAL",
                SpfResult::None => "NONE",
                SpfResult::PermError => "PERMERROR",
                SpfResult::TempError => "TEMPERROR",
            },
        }
    }
}

#[derive(Debug)]
pub struct Decision {
    pub verdict: Verdict,
    pub ticket: Option<String>,
    pub url: Option<String>,
    pub message: String,
}

impl Decision {
    fn plain(verdict: Verdict, message: impl Into<String>) -> Self {
        Decision {
            verdict,
            ticket: None,
            url: None,
            message: message.into(),
        }
    }
}

pub trait DecideTransaction: Sync + Send {
    fn decide(&self, request: &SpfRequest<'_>) -> impl Future<Output = Decision> + Send;
    fn check(&self, request: &SpfRequest<'_>) -> impl Future<Output = String> + Send;
}

struct Transaction {
    ip: IpAddr,
    ip_token: String,
    sender: Option<String>,
    sender_valid: bool,
    sender_reserved: bool,
    helo_match: bool,
    hostname: Option<String>,
    recipient: Option<String>,
    tokens: TokenSet,
    result: SpfResult,
    inexistent: bool,
    definitely_inexistent: bool,
    provider_helo: bool,
    origin: String,
    flow: String,
}

impl DecideTransaction for Engine {
    async fn decide(&self, request: &SpfRequest<'_>) -> Decision {
        let txn = match self.assemble(request).await {
            Ok(txn) => txn,
            Err(decision) => return decision,
        };
        let config = &self.core.config;
        let result_name = Verdict::Result(txn.result).as_str();
        let rooted_hostname = txn.hostname.as_deref().map(rooted);
        let query = TransactionQuery {
            client: request.client,
            ip: &txn.ip_token,
            sender: txn.sender.as_deref().filter(|_| txn.sender_valid),
            hostname: rooted_hostname.as_deref(),
            result: result_name,
            recipient: txn.recipient.as_deref(),
        };

        // Whitelisted transactions accept unconditionally and clear the
        // block entry that would have fired, as a false positive.
        if self.lists.is_white_transaction(&query) {
            let unscoped = TransactionQuery {
                recipient: None,
                ..query
            };
            if self.lists.is_white_transaction(&unscoped) {
                for entry in self.lists.block.clear_transaction(&unscoped) {
                    tracing::info!(
                        context = "pipeline",
                        event = "unblock",
                        entry = entry.as_str(),
                        "Cleared false-positive block entry"
                    );
                }
            }
            return self.accept(&txn, result_name);
        }

        if self.lists.is_block_transaction(&query)
            || self
                .lists
                .block
                .matches_dnsbl(&self.core.resolver, txn.ip)
                .await
        {
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Blocked,
                ticket: Some(ticket),
                url: config.policy.unblock_url.clone(),
                message: "you are permanently blocked in this server".to_string(),
            };
        }

        if txn.definitely_inexistent {
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Nxdomain,
                ticket: Some(ticket),
                url: None,
                message: "sender has non-existent internet domain".to_string(),
            };
        }
        if txn.inexistent {
            return Decision::plain(
                Verdict::Nxdomain,
                "sender has non-existent internet domain",
            );
        }

        if txn.result == SpfResult::Fail {
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Result(SpfResult::Fail),
                ticket: Some(ticket),
                url: None,
                message: format!(
                    "{} is not allowed to send mail from {}",
                    txn.sender.as_deref().unwrap_or_default(),
                    txn.ip_token
                ),
            };
        }

        if let Some(sender) = &txn.sender {
            if !txn.sender_valid {
                let ticket = self.ticket_with_complaint(&txn.tokens);
                return Decision {
                    verdict: Verdict::Invalid,
                    ticket: Some(ticket),
                    url: None,
                    message: format!("{sender} is not a valid e-mail address"),
                };
            }
            if txn.sender_reserved {
                let ticket = self.ticket_with_complaint(&txn.tokens);
                return Decision {
                    verdict: Verdict::Invalid,
                    ticket: Some(ticket),
                    url: None,
                    message: format!("{sender} has a reserved domain"),
                };
            }
        }

        if txn.sender.is_none() && !txn.helo_match {
            // Dynamic-looking rDNS with no sender and no confirmed HELO
            // is auto-blocked on the spot.
            if txn
                .hostname
                .as_deref()
                .is_some_and(|hostname| self.lists.is_generic_dynamic(hostname))
                && self.lists.block.add(&txn.ip_token).unwrap_or(false)
            {
                tracing::info!(
                    context = "pipeline",
                    event = "block",
                    ip = txn.ip_token.as_str(),
                    "Auto-blocked generic dynamic source"
                );
            }
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Invalid,
                ticket: Some(ticket),
                url: None,
                message: "invalid hostname".to_string(),
            };
        }

        if txn.hostname.is_none() && config.policy.reverse_required {
            if self.lists.block.add(&txn.ip_token).unwrap_or(false) {
                tracing::info!(
                    context = "pipeline",
                    event = "block",
                    ip = txn.ip_token.as_str(),
                    "Auto-blocked source without reverse DNS"
                );
            }
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Invalid,
                ticket: Some(ticket),
                url: None,
                message: format!("{} has no reverse", txn.ip_token),
            };
        }

        if let Some(recipient) = &txn.recipient {
            if self.lists.is_trap_recipient(recipient) {
                let ticket = self.ticket_with_complaint(&txn.tokens);
                return Decision {
                    verdict: Verdict::SpamTrap,
                    ticket: Some(ticket),
                    url: None,
                    message: "discarded by spamtrap".to_string(),
                };
            }
        }

        if self.defers.count(&txn.flow) > config.defer.flood_max_retry {
            self.defers.end(&txn.flow);
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Blocked,
                ticket: Some(ticket),
                url: None,
                message: "you are temporarily blocked in this server".to_string(),
            };
        }

        let expanded = token::expand(&txn.tokens);
        let accountable: Vec<&str> = token::accountable(&expanded).collect();

        if accountable
            .iter()
            .any(|key| self.reputation.is_blocked_status(key))
        {
            let ticket = self.ticket_with_complaint(&txn.tokens);
            return Decision {
                verdict: Verdict::Blocked,
                ticket: Some(ticket),
                url: None,
                message: "you are temporarily blocked in this server".to_string(),
            };
        }

        if accountable
            .iter()
            .any(|key| self.reputation.is_blacklisted(key))
            && self.defers.defer(&txn.flow, config.defer.black)
        {
            let url = config
                .policy
                .release_url
                .clone()
                .filter(|_| self.defers.count(&txn.flow) <= 1)
                .filter(|_| {
                    txn.recipient
                        .as_deref()
                        .map_or(true, |rcpt| !self.lists.noreply.matches_recipient(rcpt))
                });
            return Decision {
                verdict: Verdict::Listed,
                ticket: None,
                url,
                message: "you are temporarily blocked on this server".to_string(),
            };
        }

        if accountable
            .iter()
            .any(|key| self.reputation.is_greylisted(key))
            && self.defers.defer(&txn.flow, config.defer.gray)
        {
            return Decision::plain(Verdict::Greylist, "you are greylisted on this server");
        }

        if accountable
            .iter()
            .any(|key| !self.lists.ignore.matches_token(key) && self.reputation.is_flood(key))
            && !txn.provider_helo
            && self.defers.defer(&txn.origin, config.defer.flood)
        {
            return Decision::plain(Verdict::Greylist, "you are greylisted on this server");
        }

        if txn.result == SpfResult::SoftFail
            && !txn.provider_helo
            && self.defers.defer(&txn.flow, config.defer.softfail)
        {
            return Decision::plain(Verdict::Greylist, "you are greylisted on this server");
        }

        self.accept(&txn, result_name)
    }

    /// Multi-line diagnostic for the CHECK verb: the SPF result plus
    /// every expanded identifier with its reputation figures.
    async fn check(&self, request: &SpfRequest<'_>) -> String {
        let txn = match self.assemble(request).await {
            Ok(txn) => txn,
            Err(decision) => return format!("{}\n", decision.verdict.as_str()),
        };
        let mut out = format!("SPF: {}\n", Verdict::Result(txn.result).as_str());
        if let Some(hostname) = &txn.hostname {
            out.push_str(&format!(
                "HELO: {hostname} {}\n",
                if txn.helo_match { "MATCH" } else { "REVERSE" }
            ));
        }
        out.push_str(&format!("FLOW: {}\n", txn.flow));
        out.push_str("TOKENS:\n");
        for key in token::expand(&txn.tokens) {
            if !token::is_accountable(&key) {
                continue;
            }
            let status = self.reputation.status(&key);
            let probability = self.reputation.probability(&key).unwrap_or(0.0);
            let frequency = self
                .reputation
                .get(&key)
                .and_then(|d| d.minimum_interarrival())
                .map(|min| format!("{min:.1}s"))
                .unwrap_or_else(|| "NEW".to_string());
            out.push_str(&format!(
                "  {key} {} {probability:.3} {frequency}\n",
                status.as_str()
            ));
        }
        out
    }
}

impl Engine {
    async fn assemble(&self, request: &SpfRequest<'_>) -> Result<Transaction, Decision> {
        let Some(ip) = normalize_ip(request.ip) else {
            return Err(Decision::plain(Verdict::Invalid, "invalid IP"));
        };
        if is_local(ip) {
            return Err(Decision::plain(Verdict::Lan, "message from LAN"));
        }
        let resolver = &self.core.resolver;
        let ip_token = canonical_ip_token(ip);

        let mut tokens = TokenSet::new();
        tokens.insert(ip_token.clone());

        if let Some(client) = request.client.filter(|client| is_email(client)) {
            tokens.insert(format!("{}:", client.to_lowercase()));
        }

        let recipient = request
            .recipient
            .map(str::to_lowercase)
            .filter(|rcpt| is_email(rcpt));
        if let Some(recipient) = &recipient {
            tokens.insert(format!(">{recipient}"));
        }

        // Confirmed hostname: the HELO name when it forward-confirms,
        // otherwise the first rDNS name that does.
        let helo = request.helo.map(str::trim).filter(|helo| !helo.is_empty());
        let mut helo_match = false;
        let mut hostname = None;
        if let Some(helo) = helo {
            if self.helo.matches(resolver, ip, helo).await {
                helo_match = true;
                hostname = Some(helo.trim_end_matches('.').to_lowercase());
            }
        }
        if hostname.is_none() {
            if let Ok(names) = resolver.ptr(ip).await {
                for name in names.iter().take(MAX_PTR_CANDIDATES) {
                    if self.helo.matches(resolver, ip, name).await {
                        hostname = Some(name.clone());
                        break;
                    }
                }
            }
        }
        if let Some(hostname) = &hostname {
            tokens.insert(rooted(hostname));
            let (unique_v4, unique_v6) = self.helo.unique_addresses(resolver, hostname).await;
            for unique in [unique_v4, unique_v6].into_iter().flatten() {
                tokens.insert(canonical_ip_token(unique));
            }
        }

        // Sender policy.
        let sender = request
            .sender
            .map(str::trim)
            .filter(|sender| !sender.is_empty() && *sender != "<>")
            .map(str::to_lowercase);
        let sender_valid = sender.as_deref().is_some_and(is_email);
        let sender_reserved = sender
            .as_deref()
            .and_then(domain_of)
            .is_some_and(is_reserved_domain);

        let mut result = SpfResult::None;
        let mut inexistent = false;
        let mut definitely_inexistent = false;
        if let (Some(sender), true, false) = (&sender, sender_valid, sender_reserved) {
            if let Some(domain) = domain_of(sender) {
                let verifier = SpfVerifier::new(
                    &self.spf,
                    resolver,
                    self.core.config.spf.strict_errors,
                );
                result = verifier
                    .verify(domain, ip, sender, hostname.as_deref().unwrap_or(""))
                    .await;
                if let Some(entry) = self.spf.get(domain) {
                    inexistent = entry.is_inexistent();
                    definitely_inexistent = entry.is_definitely_inexistent();
                }
            }
        }

        let provider_helo = self.lists.is_provider_helo(hostname.as_deref());

        // Accountability and flow fingerprint.
        let origin;
        if result == SpfResult::Pass || (sender_valid && provider_helo) {
            let sender_ref = sender.as_deref().unwrap_or_default();
            let domain = domain_of(sender_ref).unwrap_or_default().to_string();
            let mx = format!("@{domain}");
            if self.lists.is_provider_domain(&domain) {
                tokens.insert(sender_ref.to_string());
                origin = sender_ref.to_string();
            } else {
                tokens.insert(mx.clone());
                origin = mx;
            }
        } else {
            let prefix = sender
                .as_deref()
                .map(|sender| format!("{sender}>"))
                .unwrap_or_default();
            origin = match &hostname {
                Some(hostname) => {
                    let domain =
                        registered_domain(hostname).unwrap_or_else(|| hostname.clone());
                    format!("{prefix}{domain}")
                }
                None => format!("{prefix}{ip_token}"),
            };
        }
        let flow = format!("{origin}>{}", recipient.as_deref().unwrap_or_default());

        Ok(Transaction {
            ip,
            ip_token,
            sender,
            sender_valid,
            sender_reserved,
            helo_match,
            hostname,
            recipient,
            tokens,
            result,
            inexistent,
            definitely_inexistent,
            provider_helo,
            origin,
            flow,
        })
    }

    fn accept(&self, txn: &Transaction, result_name: &str) -> Decision {
        let ticket = self.register_query(&txn.tokens);
        let url = self
            .core
            .config
            .policy
            .spam_url
            .as_ref()
            .map(|base| format!("{base}{ticket}"));
        Decision {
            verdict: Verdict::Result(txn.result),
            ticket: Some(ticket),
            url,
            message: result_name.to_string(),
        }
    }

    /// Terminal rejections still account the message: the ticket is
    /// issued and immediately complained about.
    fn ticket_with_complaint(&self, tokens: &TokenSet) -> String {
        let ticket = self.register_query(tokens);
        if let Err(err) = self.add_complaint(&ticket) {
            tracing::debug!(
                context = "pipeline",
                event = "self-complaint-failed",
                "Complaint on own ticket failed: {err}"
            );
        }
        ticket
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use common::resolver::MockDns;
    use spf::SpfResult;

    use super::{DecideTransaction, SpfRequest, Verdict};
    use crate::tests::test_engine;
    use crate::Engine;

    fn zone() -> MockDns {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 a:mx.example.com -all".to_string()],
        );
        mock.a.insert(
            "mx.example.com".to_string(),
            vec![Ipv4Addr::new(192, 0, 2, 5)],
        );
        mock
    }

    fn request<'x>() -> SpfRequest<'x> {
        SpfRequest {
            ip: "192.0.2.5",
            sender: Some("alice@example.com"),
            helo: Some("mx.example.com"),
            recipient: Some("bob@test.tld"),
            client: None,
        }
    }

    async fn decide(engine: &Arc<Engine>, request: &SpfRequest<'_>) -> super::Decision {
        engine.decide(request).await
    }

    #[tokio::test]
    async fn authorised_sender_passes_with_ticket() {
        let engine = test_engine(zone());
        let decision = decide(&engine, &request()).await;
        assert_eq!(decision.verdict, Verdict::Result(SpfResult::Pass));
        let ticket = decision.ticket.expect("accept path issues a ticket");

        let (_, tokens) = engine.ticket.decode(&ticket).unwrap();
        assert!(tokens.contains(&"192.0.2.5".to_string()));
        assert!(tokens.contains(&".mx.example.com".to_string()));
        assert!(tokens.contains(&"@example.com".to_string()));
        assert!(tokens.contains(&">bob@test.tld".to_string()));
    }

    #[tokio::test]
    async fn spf_fail_rejects_and_complains() {
        let mut mock = zone();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all".to_string()],
        );
        let engine = test_engine(mock);
        let decision = decide(&engine, &request()).await;
        assert_eq!(decision.verdict, Verdict::Result(SpfResult::Fail));
        assert!(decision.ticket.is_some());

        // The rejection already complained: the confirmed hostname and
        // its registered domain carry the count.
        assert_eq!(
            engine
                .reputation
                .get(".mx.example.com")
                .unwrap()
                .complaints(),
            1
        );
        assert_eq!(
            engine.reputation.get(".example.com").unwrap().complaints(),
            1
        );
    }

    #[tokio::test]
    async fn lan_and_invalid_short_circuit() {
        let engine = test_engine(zone());
        let lan = decide(
            &engine,
            &SpfRequest {
                ip: "10.1.2.3",
                ..request()
            },
        )
        .await;
        assert_eq!(lan.verdict, Verdict::Lan);
        assert!(lan.ticket.is_none());

        let invalid = decide(
            &engine,
            &SpfRequest {
                ip: "not-an-ip",
                ..request()
            },
        )
        .await;
        assert_eq!(invalid.verdict, Verdict::Invalid);
        assert!(invalid.ticket.is_none());
    }

    #[tokio::test]
    async fn white_list_wins_over_block_list() {
        let engine = test_engine(zone());
        engine.lists.block.add("@example.com").unwrap();
        engine.lists.white.add("alice@example.com").unwrap();

        let decision = decide(&engine, &request()).await;
        assert_eq!(decision.verdict, Verdict::Result(SpfResult::Pass));
        // The block entry was a false positive and is gone now.
        assert!(!engine.lists.block.matches_token("@example.com"));
    }

    #[tokio::test]
    async fn blocked_transaction_rejects() {
        let engine = test_engine(zone());
        engine.lists.block.add("@example.com").unwrap();
        let decision = decide(&engine, &request()).await;
        assert_eq!(decision.verdict, Verdict::Blocked);
        assert!(decision.ticket.is_some());
    }

    #[tokio::test]
    async fn no_sender_without_confirmation_is_invalid() {
        let mut mock = zone();
        mock.ptr.insert(
            "203.0.113.7".to_string(),
            vec!["client.dyn.isp.tld".to_string()],
        );
        mock.a.insert(
            "client.dyn.isp.tld".to_string(),
            vec![Ipv4Addr::new(203, 0, 113, 7)],
        );
        let engine = test_engine(mock);
        engine.lists.generic.add(".dyn.isp.tld").unwrap();

        let decision = decide(
            &engine,
            &SpfRequest {
                ip: "203.0.113.7",
                sender: None,
                helo: None,
                recipient: Some("bob@test.tld"),
                client: None,
            },
        )
        .await;
        assert_eq!(decision.verdict, Verdict::Invalid);
        assert!(decision.ticket.is_some());
        // The generic dynamic source was auto-blocked.
        assert!(engine.lists.block.contains_exact("203.0.113.7"));
    }

    #[tokio::test]
    async fn spamtrap_recipient_discards() {
        let engine = test_engine(zone());
        engine.lists.trap.add("honeypot@test.tld").unwrap();
        let decision = decide(
            &engine,
            &SpfRequest {
                recipient: Some("honeypot@test.tld"),
                ..request()
            },
        )
        .await;
        assert_eq!(decision.verdict, Verdict::SpamTrap);
        assert!(decision.ticket.is_some());
    }

    #[tokio::test]
    async fn softfail_greylists_then_flood_caps() {
        let mut mock = zone();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ~all".to_string()],
        );
        let engine = test_engine(mock);

        let decision = decide(&engine, &request()).await;
        assert_eq!(decision.verdict, Verdict::Greylist);
        assert!(decision.ticket.is_none());

        // Retries within the window keep being greylisted, until the
        // flood cap converts the flow into a temporary block.
        let max_retry = engine.core.config.defer.flood_max_retry;
        let mut verdicts = Vec::new();
        for _ in 0..max_retry + 2 {
            let verdict = decide(&engine, &request()).await.verdict;
            verdicts.push(verdict);
            if verdict == Verdict::Blocked {
                break;
            }
        }
        assert_eq!(verdicts.last(), Some(&Verdict::Blocked));
        assert!(verdicts[..verdicts.len() - 1]
            .iter()
            .all(|verdict| *verdict == Verdict::Greylist));
    }

    #[tokio::test]
    async fn blacklisted_token_is_listed() {
        let engine = test_engine(zone());
        // Restore a distribution for the sender domain key: a hundred
        // queries a week, sixty of them complained about.
        let interval = 7.0 * 86400.0 / 100.0;
        let record = serde_json::from_value(serde_json::json!({
            "token": "@example.com",
            "complaints": 60,
            "last_query": utils::unix_millis(),
            "last_complaint": utils::unix_millis(),
            "status": "White",
            "frequency": {
                "count": 16,
                "sum": interval * 16.0,
                "sum_squares": interval * interval * 16.0,
            },
        }))
        .unwrap();
        engine.reputation.restore(vec![record]);
        assert!(engine.reputation.is_blacklisted("@example.com"));

        let decision = decide(&engine, &request()).await;
        assert_eq!(decision.verdict, Verdict::Listed);
        assert!(decision.ticket.is_none());
    }

    #[tokio::test]
    async fn check_reports_tokens() {
        let engine = test_engine(zone());
        let report = engine.check(&request()).await;
        assert!(report.starts_with("SPF: PASS"));
        assert!(report.contains("192.0.2.5"));
        assert!(report.contains("@example.com"));
    }
}
