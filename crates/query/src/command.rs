/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Line-oriented command protocol. A relay asks `SPF '<ip>' '<sender>'
//! '<helo>' '<recipient>'` and gets one line back; complaints come in as
//! `SPAM <ticket>` / `HAM <ticket>`; the remaining verbs administer the
//! lists, the guess cache and the stores.

use std::net::SocketAddr;

use filter::pipeline::{DecideTransaction, SpfRequest};
use filter::{ComplaintError, Engine};
use spf::registry::RefreshOutcome;
use tokio::sync::watch;

pub async fn process(
    engine: &Engine,
    line: &str,
    peer: SocketAddr,
    shutdown: &watch::Sender<bool>,
) -> String {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let response = match verb {
        "SPF" => spf_query(engine, rest, peer).await,
        "CHECK" => check_query(engine, rest, peer).await,
        "SPAM" => complaint(engine.add_complaint(rest.trim())),
        "HAM" => complaint(engine.remove_complaint(rest.trim())),
        "REFRESH" => refresh(engine, rest).await,
        "STATUS" => status(engine, rest),
        "CLEAR" => clear(engine, rest),
        "DROP" => drop_token(engine, rest),
        "GUESS" => guess(engine, rest),
        "ABUSE" => abuse(engine, rest),
        "BLOCK" | "WHITE" | "IGNORE" | "PROVIDER" | "GENERIC" | "TRAP" | "NOREPLY" => {
            list_admin(engine, verb, rest)
        }
        "STORE" => {
            filter::persist::store_dirty(engine);
            "OK\n".to_string()
        }
        "SHUTDOWN" => {
            let _ = shutdown.send(true);
            "OK\n".to_string()
        }
        _ => format!("ERROR: UNKNOWN COMMAND {verb:?}\n"),
    };
    tracing::debug!(
        context = "command",
        event = "processed",
        peer = %peer.ip(),
        verb = verb,
        "Command processed"
    );
    response
}

/// `SPF '<ip>' '<sender>' '<helo>' '<recipient>'`.
async fn spf_query(engine: &Engine, rest: &str, peer: SocketAddr) -> String {
    let args = quoted_args(rest);
    if args.len() < 4 {
        return "ERROR: QUERY\n".to_string();
    }
    let request = SpfRequest {
        ip: &args[0],
        sender: optional(&args[1]),
        helo: optional(&args[2]),
        recipient: optional(&args[3]),
        client: None,
    };
    let decision = engine.decide(&request).await;
    tracing::info!(
        context = "command",
        event = "query",
        peer = %peer.ip(),
        ip = args[0].as_str(),
        result = decision.verdict.as_str(),
        "SPF query decided"
    );
    match (&decision.url, &decision.ticket) {
        (Some(url), _) => format!("{} {url}\n", decision.verdict.as_str()),
        (None, Some(ticket)) => format!("{} {ticket}\n", decision.verdict.as_str()),
        (None, None) => format!("{}\n", decision.verdict.as_str()),
    }
}

async fn check_query(engine: &Engine, rest: &str, _peer: SocketAddr) -> String {
    let args: Vec<String> = if rest.contains('\'') {
        quoted_args(rest)
    } else {
        rest.split_whitespace().map(str::to_string).collect()
    };
    if args.len() < 3 {
        return "ERROR: QUERY\n".to_string();
    }
    let request = SpfRequest {
        ip: &args[0],
        sender: optional(&args[1]),
        helo: optional(&args[2]),
        recipient: args.get(3).map(String::as_str).and_then(|r| optional(r)),
        client: None,
    };
    engine.check(&request).await
}

fn complaint(
    result: Result<filter::ComplaintOutcome, ComplaintError>,
) -> String {
    match result {
        Ok(outcome) => {
            let mut line = String::from("OK");
            for key in &outcome.keys {
                line.push(' ');
                line.push_str(key);
            }
            if let Some(recipient) = &outcome.recipient {
                line.push_str(" >");
                line.push_str(recipient);
            }
            line.push('\n');
            line
        }
        Err(ComplaintError::Duplicate) => "DUPLICATE COMPLAIN\n".to_string(),
        Err(ComplaintError::AlreadyRemoved) => "ALREADY REMOVED\n".to_string(),
        Err(err @ (ComplaintError::Expired | ComplaintError::Invalid)) => {
            format!("ERROR: {err}\n")
        }
    }
}

async fn refresh(engine: &Engine, rest: &str) -> String {
    let domain = rest.trim();
    if domain.is_empty() {
        return "ERROR: QUERY\n".to_string();
    }
    match engine.spf.refresh(&engine.core.resolver, domain).await {
        RefreshOutcome::Updated => "UPDATED\n".to_string(),
        RefreshOutcome::NotLoaded => "NOT LOADED\n".to_string(),
    }
}

fn status(engine: &Engine, rest: &str) -> String {
    let token = rest.trim();
    if token.is_empty() {
        return "ERROR: QUERY\n".to_string();
    }
    let status = engine.reputation.status(token);
    let probability = engine.reputation.probability(token).unwrap_or(0.0);
    let frequency = engine
        .reputation
        .get(token)
        .and_then(|d| d.minimum_interarrival())
        .map(|min| format!("{min:.1}s"))
        .unwrap_or_else(|| "NEW".to_string());
    format!("{} {probability:.3} {frequency}\n", status.as_str())
}

fn clear(engine: &Engine, rest: &str) -> String {
    let token = rest.trim();
    if token.is_empty() {
        return "ERROR: QUERY\n".to_string();
    }
    let cleared = engine.clear_token(token);
    if cleared.is_empty() {
        "NOT FOUND\n".to_string()
    } else {
        format!("OK {}\n", cleared.join(" "))
    }
}

fn drop_token(engine: &Engine, rest: &str) -> String {
    let token = rest.trim();
    if token.is_empty() {
        return "ERROR: QUERY\n".to_string();
    }
    if engine.drop_token(token) {
        "DROPPED\n".to_string()
    } else {
        "NOT FOUND\n".to_string()
    }
}

/// `GUESS ADD <host> <spf…>` / `GUESS DROP <host>` / `GUESS SHOW`.
fn guess(engine: &Engine, rest: &str) -> String {
    let (action, rest) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
    match action {
        "ADD" => {
            let Some((host, registry)) = rest.split_once(' ') else {
                return "ERROR: QUERY\n".to_string();
            };
            let registry = registry.trim().trim_matches('"');
            if !registry.starts_with("v=spf1") {
                return "ERROR: INVALID SPF\n".to_string();
            }
            if engine.spf.add_guess(host, registry) {
                "ADDED\n".to_string()
            } else {
                "REPLACED\n".to_string()
            }
        }
        "DROP" => {
            if engine.spf.drop_guess(rest.trim()) {
                "DROPPED\n".to_string()
            } else {
                "NOT FOUND\n".to_string()
            }
        }
        "SHOW" => {
            let mut out = String::new();
            for (host, registry) in engine.spf.guesses() {
                out.push_str(&format!("{host} \"{registry}\"\n"));
            }
            if out.is_empty() {
                out.push_str("EMPTY\n");
            }
            out
        }
        _ => "ERROR: QUERY\n".to_string(),
    }
}

/// `ABUSE ADD <cidr|.domain> <email>` / `ABUSE DROP <key>` / `ABUSE SHOW`.
fn abuse(engine: &Engine, rest: &str) -> String {
    let (action, rest) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
    match action {
        "ADD" => {
            let Some((key, email)) = rest.split_once(' ') else {
                return "ERROR: QUERY\n".to_string();
            };
            if !filter::token::is_email(email.trim()) {
                return "ERROR: INVALID EMAIL\n".to_string();
            }
            if engine.abuse_contacts.add(key.trim(), email.trim()) {
                "ADDED\n".to_string()
            } else {
                "REPLACED\n".to_string()
            }
        }
        "DROP" => {
            if engine.abuse_contacts.drop_contact(rest.trim()) {
                "DROPPED\n".to_string()
            } else {
                "NOT FOUND\n".to_string()
            }
        }
        "SHOW" => {
            let mut out = String::new();
            for record in engine.abuse_contacts.entries() {
                out.push_str(&format!("{} {}\n", record.key, record.email));
            }
            if out.is_empty() {
                out.push_str("EMPTY\n");
            }
            out
        }
        _ => "ERROR: QUERY\n".to_string(),
    }
}

fn list_admin(engine: &Engine, list_name: &str, rest: &str) -> String {
    let Some(list) = engine.lists.by_name(list_name) else {
        return format!("ERROR: UNKNOWN LIST {list_name:?}\n");
    };
    let (action, rest) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
    match action {
        "ADD" => match list.add(rest.trim()) {
            Ok(true) => "ADDED\n".to_string(),
            Ok(false) => "ALREADY EXISTS\n".to_string(),
            Err(err) => format!("ERROR: {err}\n"),
        },
        "DROP" => {
            if list.drop_entry(rest.trim()) {
                "DROPPED\n".to_string()
            } else {
                "NOT FOUND\n".to_string()
            }
        }
        "SHOW" => {
            let entries = list.entries();
            if entries.is_empty() {
                "EMPTY\n".to_string()
            } else {
                let mut out = entries.join("\n");
                out.push('\n');
                out
            }
        }
        _ => "ERROR: QUERY\n".to_string(),
    }
}

/// Splits `'a' 'b' 'c'` arguments, tolerating unquoted forms.
fn quoted_args(rest: &str) -> Vec<String> {
    let rest = rest.trim();
    if rest.contains('\'') {
        rest.split('\'')
            .enumerate()
            .filter_map(|(pos, part)| (pos % 2 == 1).then(|| part.to_string()))
            .collect()
    } else {
        rest.split_whitespace().map(str::to_string).collect()
    }
}

fn optional(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use common::config::CoreConfig;
    use common::resolver::{MockDns, Resolver};
    use common::Core;
    use filter::Engine;
    use tokio::sync::watch;
    use utils::config::Config;

    use super::{process, quoted_args};

    fn engine() -> Arc<Engine> {
        let mut mock = MockDns::default();
        mock.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 a:mx.example.com -all".to_string()],
        );
        mock.a.insert(
            "mx.example.com".to_string(),
            vec![Ipv4Addr::new(192, 0, 2, 5)],
        );
        let mut config = Config::new("").unwrap();
        let core_config = CoreConfig::parse(&mut config);
        let core = Core::new(core_config, Resolver::mock(mock));
        Engine::new(core, &[42u8; 32])
    }

    fn peer() -> SocketAddr {
        "198.51.100.1:55555".parse().unwrap()
    }

    async fn run(engine: &Engine, line: &str) -> String {
        let (shutdown, _) = watch::channel(false);
        process(engine, line, peer(), &shutdown).await
    }

    #[test]
    fn quoted_argument_splitting() {
        assert_eq!(
            quoted_args("'192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'"),
            [
                "192.0.2.5",
                "alice@example.com",
                "mx.example.com",
                "bob@test.tld"
            ]
        );
        assert_eq!(
            quoted_args("'192.0.2.5' '' 'mx.example.com' ''"),
            ["192.0.2.5", "", "mx.example.com", ""]
        );
        assert_eq!(quoted_args("a b"), ["a", "b"]);
    }

    #[tokio::test]
    async fn spf_query_pass_with_ticket() {
        let engine = engine();
        let response = run(
            &engine,
            "SPF '192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'",
        )
        .await;
        let mut parts = response.trim().split(' ');
        assert_eq!(parts.next(), Some("PASS"));
        let ticket = parts.next().expect("ticket present");
        assert!(engine.ticket.decode(ticket).is_ok());
    }

    #[tokio::test]
    async fn spam_then_ham_round_trip() {
        let engine = engine();
        let response = run(
            &engine,
            "SPF '192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'",
        )
        .await;
        let ticket = response.trim().split(' ').nth(1).unwrap().to_string();

        let spam = run(&engine, &format!("SPAM {ticket}")).await;
        assert!(spam.starts_with("OK "), "{spam}");
        assert!(spam.contains("@example.com"));
        assert!(spam.trim().ends_with(">bob@test.tld"));

        let duplicate = run(&engine, &format!("SPAM {ticket}")).await;
        assert_eq!(duplicate, "DUPLICATE COMPLAIN\n");

        let ham = run(&engine, &format!("HAM {ticket}")).await;
        assert!(ham.starts_with("OK "), "{ham}");

        let removed = run(&engine, &format!("HAM {ticket}")).await;
        assert_eq!(removed, "ALREADY REMOVED\n");
    }

    #[tokio::test]
    async fn expired_ticket_reports_error() {
        let engine = engine();
        let mut tokens = filter::token::TokenSet::new();
        tokens.insert("192.0.2.5".to_string());
        let expired = engine
            .ticket
            .encode_at(utils::unix_secs() - 6 * 86400, &tokens);
        let response = run(&engine, &format!("SPAM {expired}")).await;
        assert_eq!(response, "ERROR: TICKET EXPIRED\n");
        // Expired complaints leave no trace.
        assert!(engine.reputation.get("192.0.2.5").is_none());
    }

    #[tokio::test]
    async fn refresh_verb() {
        let engine = engine();
        assert_eq!(run(&engine, "REFRESH example.com").await, "NOT LOADED\n");
        run(
            &engine,
            "SPF '192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'",
        )
        .await;
        assert_eq!(run(&engine, "REFRESH example.com").await, "UPDATED\n");
    }

    #[tokio::test]
    async fn list_admin_verbs() {
        let engine = engine();
        assert_eq!(run(&engine, "BLOCK ADD .spam.example").await, "ADDED\n");
        assert_eq!(
            run(&engine, "BLOCK ADD .spam.example").await,
            "ALREADY EXISTS\n"
        );
        let show = run(&engine, "BLOCK SHOW").await;
        assert!(show.contains(".spam.example"));
        assert_eq!(run(&engine, "BLOCK DROP .spam.example").await, "DROPPED\n");
        assert_eq!(run(&engine, "BLOCK DROP .spam.example").await, "NOT FOUND\n");
        assert!(run(&engine, "BLOCK ADD !!!").await.starts_with("ERROR:"));
    }

    #[tokio::test]
    async fn guess_verbs() {
        let engine = engine();
        assert_eq!(
            run(&engine, "GUESS ADD nospf.example \"v=spf1 a mx -all\"").await,
            "ADDED\n"
        );
        let show = run(&engine, "GUESS SHOW").await;
        assert!(show.contains("nospf.example"));
        assert_eq!(run(&engine, "GUESS DROP nospf.example").await, "DROPPED\n");
    }

    #[tokio::test]
    async fn check_verb_is_multiline() {
        let engine = engine();
        let response = run(
            &engine,
            "CHECK '192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'",
        )
        .await;
        assert!(response.starts_with("SPF: PASS"));
        assert!(response.lines().count() > 3);
    }

    #[tokio::test]
    async fn unknown_verbs_are_rejected() {
        let engine = engine();
        assert!(run(&engine, "FROBNICATE now").await.starts_with("ERROR:"));
    }
}
