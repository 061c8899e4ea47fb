/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Ticket codec. A ticket binds a decision to its token set:
//! `<base32 seconds> <token>…` sealed with CHACHA20-POLY1305 under the
//! process-wide key and emitted URL-safe. The ticket is the only way a
//! later complaint can be attributed, so decoding rejects anything older
//! than five days.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use common::config::ttl;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use utils::codec::base32;
use utils::unix_secs;

use crate::token::TokenSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("TICKET EXPIRED")]
    Expired,
    #[error("INVALID TICKET")]
    Invalid,
}

pub struct TicketCodec {
    key: LessSafeKey,
    last_secs: AtomicU64,
}

impl TicketCodec {
    pub fn new(key_bytes: &[u8; 32]) -> Self {
        let key = UnboundKey::new(&CHACHA20_POLY1305, key_bytes)
            .map(LessSafeKey::new)
            .unwrap_or_else(|_| unreachable!("fixed-length key"));
        TicketCodec {
            key,
            last_secs: AtomicU64::new(0),
        }
    }

    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Timestamps are strictly monotonic to the second so that every
    /// ticket owns a unique ledger slot.
    fn next_timestamp(&self) -> u64 {
        let now = unix_secs();
        self.last_secs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }

    pub fn encode(&self, tokens: &TokenSet) -> String {
        self.encode_at(self.next_timestamp(), tokens)
    }

    pub fn encode_at(&self, timestamp: u64, tokens: &TokenSet) -> String {
        let mut payload = base32::encode_u64(timestamp);
        for token in tokens {
            payload.push(' ');
            payload.push_str(token);
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = payload.into_bytes();
        if self
            .key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .is_err()
        {
            // Sealing only fails on absurd payload sizes.
            return String::new();
        }

        let mut sealed = Vec::with_capacity(NONCE_LEN + buffer.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&buffer);
        URL_SAFE_NO_PAD.encode(sealed)
    }

    /// Decodes a ticket into its timestamp and token list. The age check
    /// comes after authentication, so EXPIRED is only reported for
    /// tickets this engine really issued.
    pub fn decode(&self, ticket: &str) -> Result<(u64, Vec<String>), TicketError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(ticket.trim())
            .map_err(|_| TicketError::Invalid)?;
        if sealed.len() <= NONCE_LEN {
            return Err(TicketError::Invalid);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| TicketError::Invalid)?;

        let mut buffer = ciphertext.to_vec();
        let payload = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| TicketError::Invalid)?;
        let payload = std::str::from_utf8(payload).map_err(|_| TicketError::Invalid)?;

        let mut parts = payload.split(' ');
        let timestamp = parts
            .next()
            .and_then(base32::decode_u64)
            .ok_or(TicketError::Invalid)?;
        if unix_secs().saturating_sub(timestamp) > ttl::TICKET_TTL.as_secs() {
            return Err(TicketError::Expired);
        }
        Ok((
            timestamp,
            parts.filter(|t| !t.is_empty()).map(str::to_string).collect(),
        ))
    }
}
