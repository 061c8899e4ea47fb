/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DNS-list frontend. One UDP listener serves every configured zone
//! (DNSBL, DNSWL, URIBL, SCORE, DNSAL); answers are computed per query
//! from the reputation store and the policy lists. Unknown zones and
//! malformed packets count as abuse events against the source network.

pub mod zone;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use filter::Engine;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use zone::{evaluate, ZoneAnswer};

pub async fn spawn_dns(engine: Arc<Engine>) -> std::io::Result<()> {
    let Some(bind) = engine.core.config.server.dns_bind else {
        return Ok(());
    };
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    let limiter = Arc::new(Semaphore::new(
        engine.core.config.server.max_connections as usize,
    ));
    tracing::info!(
        context = "dnsd",
        event = "listen",
        bind = %bind,
        zones = engine.core.config.zones.len(),
        "DNS list frontend listening"
    );

    tokio::spawn(async move {
        let mut buffer = [0u8; 512];
        loop {
            let (len, peer) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    tracing::debug!(
                        context = "dnsd",
                        event = "receive-error",
                        "Receive failed: {err}"
                    );
                    continue;
                }
            };
            let Ok(permit) = limiter.clone().try_acquire_owned() else {
                tracing::warn!(
                    context = "dnsd",
                    event = "too-many-connections",
                    peer = %peer.ip(),
                    "TOO MANY CONNECTIONS"
                );
                continue;
            };
            let packet = buffer[..len].to_vec();
            let engine = engine.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Some(response) = handle_packet(&engine, &packet, peer) {
                    if let Err(err) = socket.send_to(&response, peer).await {
                        tracing::debug!(
                            context = "dnsd",
                            event = "send-error",
                            peer = %peer.ip(),
                            "Response dropped: {err}"
                        );
                    }
                }
            });
        }
    });
    Ok(())
}

/// Parses one request and renders the response wire format. `None` means
/// the packet was not worth answering at all.
pub fn handle_packet(engine: &Engine, packet: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
    let request = match Message::from_vec(packet) {
        Ok(request) => request,
        Err(_) => {
            register_abuse(engine, peer.ip(), "FORMERR");
            // A parseable header is needed for a FORMERR reply.
            return form_error(packet);
        }
    };
    let query = request.queries().first()?.clone();

    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_authoritative(true)
        .add_query(query.clone());

    if engine.abuse.is_banned(peer.ip()) {
        response.set_response_code(ResponseCode::Refused);
        return response.to_vec().ok();
    }

    let name = query.name().to_utf8().to_lowercase();
    let answer = match evaluate(engine, name.trim_end_matches('.')) {
        Some(answer) => answer,
        None => {
            register_abuse(engine, peer.ip(), "NOTAUTH");
            response.set_response_code(ResponseCode::NotAuth);
            return response.to_vec().ok();
        }
    };

    match answer {
        ZoneAnswer::NxDomain => {
            response.set_response_code(ResponseCode::NXDomain);
        }
        ZoneAnswer::Listed { address, ttl, reason } => {
            response.set_response_code(ResponseCode::NoError);
            let name = query.name().clone();
            match query.query_type() {
                RecordType::TXT => {
                    response.add_answer(Record::from_rdata(
                        name,
                        ttl,
                        RData::TXT(TXT::new(vec![reason])),
                    ));
                }
                RecordType::ANY => {
                    response.add_answer(Record::from_rdata(
                        name.clone(),
                        ttl,
                        RData::A(A(address)),
                    ));
                    response.add_answer(Record::from_rdata(
                        name,
                        ttl,
                        RData::TXT(TXT::new(vec![reason])),
                    ));
                }
                _ => {
                    response.add_answer(Record::from_rdata(name, ttl, RData::A(A(address))));
                }
            }
        }
    }
    response.to_vec().ok()
}

fn register_abuse(engine: &Engine, source: IpAddr, kind: &str) {
    if engine
        .abuse
        .register_event(source, &engine.core.config.abuse)
    {
        tracing::warn!(
            context = "dnsd",
            event = "abuse-ban",
            source = %source,
            kind = kind,
            "Source network banned for abuse"
        );
    }
}

/// Builds a minimal FORMERR reply echoing the query id when at least the
/// header survived.
fn form_error(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let mut response = Message::new();
    response
        .set_id(id)
        .set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::FormErr);
    response.to_vec().ok()
}

/// Convenience used by tests and the CHECK diagnostics: evaluates a
/// query name without the wire layer.
pub fn lookup_name(engine: &Engine, name: &str) -> Option<ZoneAnswer> {
    evaluate(engine, name.trim_end_matches('.'))
}
