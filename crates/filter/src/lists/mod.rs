/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Policy lists. Entries are split into matcher families at insert time
//! (exact tokens, CIDR blocks, regular expressions, WHOIS attributes and
//! external DNSBL references), so the hot path dispatches on the family
//! instead of re-deriving the pattern kind per query.

pub mod matcher;

use matcher::{PolicyList, TransactionQuery};

use crate::token::rooted;

pub struct PolicyLists {
    pub white: PolicyList,
    pub block: PolicyList,
    pub ignore: PolicyList,
    pub provider: PolicyList,
    pub generic: PolicyList,
    pub trap: PolicyList,
    pub noreply: PolicyList,
}

impl Default for PolicyLists {
    fn default() -> Self {
        PolicyLists {
            white: PolicyList::new("white", matcher::Capabilities::full()),
            block: PolicyList::new("block", matcher::Capabilities::full()),
            ignore: PolicyList::new("ignore", matcher::Capabilities::tokens_only()),
            provider: PolicyList::new("provider", matcher::Capabilities::tokens_only()),
            generic: PolicyList::new("generic", matcher::Capabilities::patterns()),
            trap: PolicyList::new("trap", matcher::Capabilities::recipients()),
            noreply: PolicyList::new("noreply", matcher::Capabilities::recipients()),
        }
    }
}

impl PolicyLists {
    pub fn by_name(&self, name: &str) -> Option<&PolicyList> {
        Some(match name.to_ascii_lowercase().as_str() {
            "white" => &self.white,
            "block" => &self.block,
            "ignore" => &self.ignore,
            "provider" => &self.provider,
            "generic" => &self.generic,
            "trap" => &self.trap,
            "noreply" => &self.noreply,
            _ => return None,
        })
    }

    pub fn all(&self) -> [&PolicyList; 7] {
        [
            &self.white,
            &self.block,
            &self.ignore,
            &self.provider,
            &self.generic,
            &self.trap,
            &self.noreply,
        ]
    }

    /// Freemail/bulk providers list the mailbox itself; everyone else is
    /// accountable at the hosting domain.
    pub fn is_provider_domain(&self, sender_domain: &str) -> bool {
        let domain = sender_domain.trim_start_matches('@').to_lowercase();
        self.provider.contains_exact(&format!("@{domain}"))
            || self.provider.matches_token(&format!(".{domain}"))
    }

    /// True when the connecting host belongs to a known provider, by its
    /// confirmed hostname.
    pub fn is_provider_helo(&self, hostname: Option<&str>) -> bool {
        match hostname {
            Some(hostname) => self.provider.matches_token(&rooted(hostname)),
            None => false,
        }
    }

    /// Generic/dynamic rDNS detection, the shape `client.dyn.isp.tld`
    /// names take.
    pub fn is_generic_dynamic(&self, hostname: &str) -> bool {
        self.generic.matches_token(&rooted(hostname))
    }

    pub fn is_trap_recipient(&self, recipient: &str) -> bool {
        self.trap.matches_recipient(recipient)
    }

    pub fn is_white_transaction(&self, query: &TransactionQuery<'_>) -> bool {
        self.white.matches_transaction(query)
    }

    pub fn is_block_transaction(&self, query: &TransactionQuery<'_>) -> bool {
        self.block.matches_transaction(query)
    }
}
