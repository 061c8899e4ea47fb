/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Peer gossip. Every reputation mutation is pushed to the configured
//! peers as a one-line UDP datagram; receivers fold the delta into their
//! own store weighted by the sender's observed agreement rate. Loss is
//! tolerated, convergence comes from the next mutation.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::reputation::Distribution;
use crate::Engine;

#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    Reputation {
        token: String,
        complaints: u32,
        minimum_interarrival: f64,
    },
    Drop {
        token: String,
    },
}

/// Send half handed to the engine; the dispatch task owns the socket.
pub struct Gossiper {
    tx: Mutex<Option<mpsc::UnboundedSender<GossipEvent>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<GossipEvent>>>,
}

impl Default for Gossiper {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Gossiper {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl Gossiper {
    pub fn send_distribution(&self, token: &str, distribution: &Distribution) {
        self.send(GossipEvent::Reputation {
            token: token.to_string(),
            complaints: distribution.complaints(),
            minimum_interarrival: distribution.minimum_interarrival().unwrap_or(0.0),
        });
    }

    pub fn send_drop(&self, token: &str) {
        self.send(GossipEvent::Drop {
            token: token.to_string(),
        });
    }

    fn send(&self, event: GossipEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // A closed channel means gossip is disabled; nothing to do.
            let _ = tx.send(event);
        }
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<GossipEvent>> {
        self.rx.lock().take()
    }
}

impl GossipEvent {
    fn to_line(&self) -> String {
        match self {
            GossipEvent::Reputation {
                token,
                complaints,
                minimum_interarrival,
            } => {
                format!("REPUTATION {token} {complaints} {minimum_interarrival:.3}")
            }
            GossipEvent::Drop { token } => format!("DROP {token}"),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(' ');
        match parts.next()? {
            "REPUTATION" => Some(GossipEvent::Reputation {
                token: parts.next()?.to_string(),
                complaints: parts.next()?.parse().ok()?,
                minimum_interarrival: parts.next()?.parse().ok()?,
            }),
            "DROP" => Some(GossipEvent::Drop {
                token: parts.next()?.to_string(),
            }),
            _ => None,
        }
    }
}

/// Spawns the dispatch and receive tasks. Without a bind address the
/// engine neither sends nor receives and the channel drains nowhere.
pub async fn spawn_gossip(engine: Arc<Engine>) {
    let config = &engine.core.config.gossip;
    let peers = config.peers.clone();
    let Some(bind) = config.bind else {
        return;
    };
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            tracing::error!(
                context = "gossip",
                event = "bind-error",
                bind = %bind,
                "Failed to bind gossip socket: {err}"
            );
            return;
        }
    };

    // Dispatch: engine mutations out to every peer.
    if let Some(mut rx) = engine.gossip.take_receiver() {
        let socket = socket.clone();
        let peers_out = peers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let line = event.to_line();
                for peer in &peers_out {
                    if let Err(err) = socket.send_to(line.as_bytes(), peer).await {
                        tracing::debug!(
                            context = "gossip",
                            event = "send-error",
                            peer = %peer,
                            "Dropping reputation push: {err}"
                        );
                    }
                }
            }
        });
    }

    // Receive: peer deltas into the local store.
    let engine_in = engine.clone();
    tokio::spawn(async move {
        let mut buffer = [0u8; 1024];
        loop {
            let (len, from) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    tracing::debug!(
                        context = "gossip",
                        event = "receive-error",
                        "Receive failed: {err}"
                    );
                    continue;
                }
            };
            // Only configured peers may mutate reputation.
            if !peers.iter().any(|peer| peer.ip() == from.ip()) {
                continue;
            }
            let Ok(line) = std::str::from_utf8(&buffer[..len]) else {
                continue;
            };
            if let Some(event) = GossipEvent::parse(line) {
                apply_peer_event(&engine_in, normalize_peer(from, &peers), event);
            }
        }
    });
}

fn normalize_peer(from: SocketAddr, peers: &[SocketAddr]) -> SocketAddr {
    peers
        .iter()
        .find(|peer| peer.ip() == from.ip())
        .copied()
        .unwrap_or(from)
}

pub(crate) fn apply_peer_event(engine: &Engine, peer: SocketAddr, event: GossipEvent) {
    match event {
        GossipEvent::Reputation {
            token,
            complaints,
            minimum_interarrival,
        } => {
            if crate::token::is_accountable(&token) {
                engine
                    .reputation
                    .apply_peer(peer, &token, complaints, minimum_interarrival);
            }
        }
        GossipEvent::Drop { token } => {
            engine.reputation.drop_peer_token(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use common::resolver::MockDns;

    use super::{apply_peer_event, GossipEvent};
    use crate::tests::test_engine;

    #[test]
    fn wire_format_round_trip() {
        for event in [
            GossipEvent::Reputation {
                token: "@spam.example".to_string(),
                complaints: 12,
                minimum_interarrival: 1.5,
            },
            GossipEvent::Drop {
                token: "192.0.2.5".to_string(),
            },
        ] {
            assert_eq!(GossipEvent::parse(&event.to_line()), Some(event));
        }
        assert_eq!(GossipEvent::parse("NOISE whatever"), None);
        assert_eq!(GossipEvent::parse("REPUTATION incomplete"), None);
    }

    #[test]
    fn peer_deltas_shift_probability() {
        let engine = test_engine(MockDns::default());
        let peer: SocketAddr = "198.51.100.1:9878".parse().unwrap();

        apply_peer_event(
            &engine,
            peer,
            GossipEvent::Reputation {
                token: "@spam.example".to_string(),
                complaints: 50,
                minimum_interarrival: 6048.0, // 100 queries a week
            },
        );
        // Local store had nothing; the peer's view alone drives status.
        assert!(engine.reputation.probability("@spam.example").is_none());
        engine.reputation.add_query("@spam.example");
        assert!(engine.reputation.probability("@spam.example").unwrap() > 0.25);

        apply_peer_event(
            &engine,
            peer,
            GossipEvent::Drop {
                token: "@spam.example".to_string(),
            },
        );
        let probability = engine.reputation.probability("@spam.example").unwrap();
        assert!(probability < 0.01, "{probability}");
    }

    #[test]
    fn tag_tokens_are_not_applied() {
        let engine = test_engine(MockDns::default());
        let peer: SocketAddr = "198.51.100.1:9878".parse().unwrap();
        apply_peer_event(
            &engine,
            peer,
            GossipEvent::Reputation {
                token: ">victim@test.tld".to_string(),
                complaints: 10,
                minimum_interarrival: 1.0,
            },
        );
        engine.reputation.add_query(">victim@test.tld");
        // The tag accumulates queries but no peer spam.
        assert_eq!(
            engine.reputation.probability(">victim@test.tld").unwrap(),
            0.0
        );
    }
}
