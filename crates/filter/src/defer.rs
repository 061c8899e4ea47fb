/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Greylist and flood-control deferrals keyed by flow fingerprint
//! (`origin>recipient`). A flow stays deferred until its class window has
//! elapsed since first sight; each retry bumps the attempt counter that
//! the flood cap reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::RwLock;
use utils::unix_secs;

/// Abandoned flows linger at most this long before expiry.
const DEFER_EXPIRY: Duration = Duration::from_secs(5 * 86400);

#[derive(Debug, Clone)]
struct DeferEntry {
    start: u64,
    count: u32,
}

#[derive(Default)]
pub struct DeferList {
    map: RwLock<AHashMap<String, DeferEntry>>,
    dirty: AtomicBool,
}

impl DeferList {
    /// Returns `true` while the flow must keep waiting. Once the window
    /// has elapsed the flow is released and forgotten, so a later retry
    /// starts a fresh greylisting cycle.
    pub fn defer(&self, flow: &str, window: Duration) -> bool {
        let now = unix_secs();
        let mut map = self.map.write();
        let entry = map.entry(flow.to_string()).or_insert(DeferEntry {
            start: now,
            count: 0,
        });
        entry.count = entry.count.saturating_add(1);
        let waiting = now.saturating_sub(entry.start) < window.as_secs();
        if !waiting {
            map.remove(flow);
        }
        drop(map);
        self.dirty.store(true, Ordering::Relaxed);
        waiting
    }

    /// Attempts seen for a flow so far.
    pub fn count(&self, flow: &str) -> u32 {
        self.map.read().get(flow).map_or(0, |entry| entry.count)
    }

    /// Forgets a flow, ending its deferral cycle.
    pub fn end(&self, flow: &str) {
        if self.map.write().remove(flow).is_some() {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn expire(&self) {
        let horizon = unix_secs().saturating_sub(DEFER_EXPIRY.as_secs());
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, entry| entry.start >= horizon);
        if map.len() != before {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}
