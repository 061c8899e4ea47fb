/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Postfix policy delegation. The MTA sends a block of `key=value`
//! attribute lines; the reply is a single `action=…` directive. Accepted
//! messages get the decision ticket prepended as a `Received-SPFBL`
//! header so the ticket travels with the message.

use std::net::SocketAddr;

use filter::pipeline::{DecideTransaction, SpfRequest, Verdict};
use filter::Engine;
use spf::SpfResult;

pub async fn process(engine: &Engine, request: &str, peer: SocketAddr) -> String {
    let mut ip = "";
    let mut sender = "";
    let mut helo = "";
    let mut recipient = "";
    for line in request.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "client_address" => ip = value.trim(),
            "sender" => sender = value.trim(),
            "helo_name" => helo = value.trim(),
            "recipient" => recipient = value.trim(),
            _ => {}
        }
    }
    if ip.is_empty() {
        return "action=DUNNO\n\n".to_string();
    }

    let decision = engine
        .decide(&SpfRequest {
            ip,
            sender: non_empty(sender),
            helo: non_empty(helo),
            recipient: non_empty(recipient),
            client: None,
        })
        .await;

    tracing::info!(
        context = "policy",
        event = "decision",
        peer = %peer.ip(),
        ip = ip,
        result = decision.verdict.as_str(),
        "Policy decision"
    );

    let action = match decision.verdict {
        Verdict::Lan => "action=DUNNO".to_string(),
        Verdict::Invalid => match decision.ticket {
            Some(_) => format!("action=554 5.7.1 SPFBL {}.", decision.message),
            // Unparseable peer address: stay out of the way.
            None => "action=DUNNO".to_string(),
        },
        Verdict::Nxdomain => {
            format!("action=554 5.7.1 SPFBL {}.", decision.message)
        }
        Verdict::Blocked => match decision.url {
            Some(url) => format!("action=554 5.7.1 SPFBL BLOCKED {url}"),
            None => format!("action=554 5.7.1 SPFBL {}.", decision.message),
        },
        Verdict::Listed => match decision.url {
            Some(url) => format!("action=451 4.7.2 SPFBL LISTED {url}"),
            None => format!("action=451 4.7.2 SPFBL {}.", decision.message),
        },
        Verdict::Greylist => {
            format!("action=451 4.7.1 SPFBL {}.", decision.message)
        }
        Verdict::SpamTrap => "action=DISCARD SPFBL discarded by spamtrap.".to_string(),
        Verdict::Result(SpfResult::Fail) => {
            format!("action=554 5.7.1 SPFBL {}.", decision.message)
        }
        Verdict::Result(SpfResult::TempError) => {
            "action=DEFER [SPF] A transient error occurred when checking SPF record, \
             preventing a result from being reached. Try again later."
                .to_string()
        }
        Verdict::Result(SpfResult::PermError) => {
            "action=REJECT [SPF] One or more SPF records could not be interpreted."
                .to_string()
        }
        Verdict::Result(result) => {
            let reference = decision
                .url
                .or(decision.ticket)
                .unwrap_or_default();
            format!(
                "action=PREPEND Received-SPFBL: {} {reference}",
                Verdict::Result(result).as_str()
            )
        }
    };
    format!("{action}\n\n")
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty() && value != "<>").then_some(value)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use common::config::CoreConfig;
    use common::resolver::{MockDns, Resolver};
    use common::Core;
    use filter::Engine;
    use utils::config::Config;

    use super::process;

    fn engine(spf: &str) -> Arc<Engine> {
        let mut mock = MockDns::default();
        mock.txt
            .insert("example.com".to_string(), vec![spf.to_string()]);
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

    fn request(ip: &str) -> String {
        format!(
            "request=smtpd_access_policy\nprotocol_state=RCPT\nclient_address={ip}\n\
             sender=alice@example.com\nhelo_name=mx.example.com\nrecipient=bob@test.tld\n\n"
        )
    }

    #[tokio::test]
    async fn accepted_message_gets_prepend() {
        let engine = engine("v=spf1 a:mx.example.com -all");
        let response = process(&engine, &request("192.0.2.5"), peer()).await;
        assert!(
            response.starts_with("action=PREPEND Received-SPFBL: PASS "),
            "{response}"
        );
        assert!(response.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn spf_fail_rejects() {
        let engine = engine("v=spf1 -all");
        let response = process(&engine, &request("192.0.2.5"), peer()).await;
        assert!(response.starts_with("action=554 5.7.1 SPFBL"), "{response}");
    }

    #[tokio::test]
    async fn lan_peer_is_dunno() {
        let engine = engine("v=spf1 -all");
        let response = process(&engine, &request("192.168.1.10"), peer()).await;
        assert_eq!(response, "action=DUNNO\n\n");
    }

    #[tokio::test]
    async fn missing_client_address_is_dunno() {
        let engine = engine("v=spf1 -all");
        let response = process(&engine, "request=smtpd_access_policy\n\n", peer()).await;
        assert_eq!(response, "action=DUNNO\n\n");
    }

    #[tokio::test]
    async fn softfail_defers_with_greylist() {
        let engine = engine("v=spf1 ~all");
        let response = process(&engine, &request("192.0.2.5"), peer()).await;
        assert!(response.starts_with("action=451 4.7.1 SPFBL"), "{response}");
    }
}
