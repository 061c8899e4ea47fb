/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod abuse;
pub mod analysis;
pub mod defer;
pub mod gossip;
pub mod helo;
pub mod ledger;
pub mod lists;
pub mod persist;
pub mod pipeline;
pub mod reputation;
pub mod ticket;
pub mod token;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::Core;

use abuse::{AbuseContacts, AbuseRegistry};
use analysis::AnalysisQueue;
use defer::DeferList;
use gossip::Gossiper;
use helo::HeloCache;
use ledger::ComplaintLedger;
use lists::PolicyLists;
use reputation::ReputationStore;
use spf::registry::SpfRegistry;
use ticket::{TicketCodec, TicketError};
use token::TokenSet;

/// The engine value: every cache and store of the decision subsystem,
/// constructed once at startup and shared by all frontends. Nothing in
/// the process is a global.
pub struct Engine {
    pub core: Arc<Core>,
    pub spf: SpfRegistry,
    pub helo: HeloCache,
    pub lists: PolicyLists,
    pub reputation: ReputationStore,
    pub ledger: ComplaintLedger,
    pub defers: DeferList,
    pub ticket: TicketCodec,
    pub gossip: Gossiper,
    pub analysis: AnalysisQueue,
    pub abuse: AbuseRegistry,
    pub abuse_contacts: AbuseContacts,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComplaintError {
    #[error("TICKET EXPIRED")]
    Expired,
    #[error("INVALID TICKET")]
    Invalid,
    #[error("DUPLICATE COMPLAIN")]
    Duplicate,
    #[error("ALREADY REMOVED")]
    AlreadyRemoved,
}

impl From<TicketError> for ComplaintError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::Expired => ComplaintError::Expired,
            TicketError::Invalid => ComplaintError::Invalid,
        }
    }
}

/// Outcome of a complaint: the affected reputation keys plus the
/// recipient tag carried by the ticket, if any.
#[derive(Debug, PartialEq, Eq)]
pub struct ComplaintOutcome {
    pub keys: BTreeSet<String>,
    pub recipient: Option<String>,
}

impl Engine {
    pub fn new(core: Arc<Core>, ticket_key: &[u8; 32]) -> Arc<Self> {
        let flood = core.config.flood.clone();
        let best_guess = core.config.spf.best_guess.clone();
        Arc::new(Engine {
            core,
            spf: SpfRegistry::new(best_guess),
            helo: HeloCache::default(),
            lists: PolicyLists::default(),
            reputation: ReputationStore::new(flood),
            ledger: ComplaintLedger::default(),
            defers: DeferList::default(),
            ticket: TicketCodec::new(ticket_key),
            gossip: Gossiper::default(),
            analysis: AnalysisQueue::default(),
            abuse: AbuseRegistry::default(),
            abuse_contacts: AbuseContacts::default(),
        })
    }

    /// Counts a query against every accountable identifier and issues the
    /// ticket that binds the decision to them.
    pub fn register_query(&self, tokens: &TokenSet) -> String {
        for key in token::expand(tokens) {
            if token::is_accountable(&key) && !self.lists.ignore.matches_token(&key) {
                self.reputation.add_query(&key);
            }
        }
        self.ticket.encode(tokens)
    }

    /// Registers a spam complaint for a ticket. Idempotent: the second
    /// complaint for the same ticket reports `Duplicate`.
    pub fn add_complaint(&self, ticket: &str) -> Result<ComplaintOutcome, ComplaintError> {
        let (timestamp, tokens) = self.ticket.decode(ticket)?;
        let (accountable, recipient) = split_ticket_tokens(&tokens);
        if !self.ledger.insert(timestamp * 1_000_000, &accountable.join(" ")) {
            return Err(ComplaintError::Duplicate);
        }

        let mut keys = BTreeSet::new();
        let token_set: TokenSet = accountable.iter().cloned().collect();
        for key in token::expand(&token_set) {
            if !token::is_accountable(&key) || self.lists.ignore.matches_token(&key) {
                continue;
            }
            if let Some(distribution) = self.reputation.add_spam(&key) {
                self.gossip.send_distribution(&key, &distribution);
            }
            keys.insert(key);
        }
        Ok(ComplaintOutcome { keys, recipient })
    }

    /// Withdraws a complaint, restoring every affected counter. Reports
    /// `AlreadyRemoved` when the ticket was never (or no longer)
    /// complained about.
    pub fn remove_complaint(&self, ticket: &str) -> Result<ComplaintOutcome, ComplaintError> {
        let (timestamp, tokens) = self.ticket.decode(ticket)?;
        let (accountable, recipient) = split_ticket_tokens(&tokens);
        if self
            .ledger
            .remove(timestamp * 1_000_000, &accountable.join(" "))
            .is_none()
        {
            return Err(ComplaintError::AlreadyRemoved);
        }

        let mut keys = BTreeSet::new();
        let token_set: TokenSet = accountable.iter().cloned().collect();
        for key in token::expand(&token_set) {
            if !token::is_accountable(&key) {
                continue;
            }
            if let Some(distribution) = self.reputation.remove_spam(&key) {
                self.gossip.send_distribution(&key, &distribution);
            }
            keys.insert(key);
        }
        Ok(ComplaintOutcome { keys, recipient })
    }

    /// Forgets a token entirely: reputation, block entry, and peers are
    /// told to do the same.
    pub fn drop_token(&self, key: &str) -> bool {
        let dropped = self.reputation.drop_token(key);
        let unblocked = self.lists.block.drop_entry(key);
        if dropped || unblocked {
            self.gossip.send_drop(key);
        }
        dropped || unblocked
    }

    /// Clears complaint counters and block entries matching a key.
    pub fn clear_token(&self, key: &str) -> Vec<String> {
        let mut cleared = self.reputation.clear(key);
        for token in &cleared {
            if let Some(distribution) = self.reputation.get(token) {
                self.gossip.send_distribution(token, &distribution);
            }
        }
        if self.lists.block.drop_entry(key) {
            cleared.push(key.to_string());
        }
        cleared
    }
}

fn split_ticket_tokens(tokens: &[String]) -> (Vec<String>, Option<String>) {
    let mut accountable = Vec::new();
    let mut recipient = None;
    for token in tokens {
        if let Some(rcpt) = token.strip_prefix('>') {
            if token::is_email(rcpt) {
                recipient = Some(rcpt.to_string());
            }
        } else if token::is_accountable(token) {
            accountable.push(token.clone());
        }
    }
    (accountable, recipient)
}
