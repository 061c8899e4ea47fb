/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Expiration windows shared across the engine. Every store compares
//! against these constants rather than scattering literals through the
//! pipeline.

use std::time::Duration;

/// Tickets older than this can no longer be complained about.
pub const TICKET_TTL: Duration = Duration::from_secs(5 * 86400);

/// Complaint ledger entries drop after one week.
pub const LEDGER_TTL: Duration = Duration::from_secs(7 * 86400);

/// SPF records refresh when older than one week and under query pressure.
pub const SPF_REFRESH: Duration = Duration::from_secs(7 * 86400);

/// SPF records unused for two weeks are evicted.
pub const SPF_EVICT: Duration = Duration::from_secs(14 * 86400);

/// Reputation distributions unused for two weeks are droppable.
pub const DISTRIBUTION_EVICT: Duration = Duration::from_secs(14 * 86400);

/// DNS frontend abuse bans last one week.
pub const ABUSE_BAN: Duration = Duration::from_secs(7 * 86400);

/// HELO forward-confirmation entries refresh weekly.
pub const HELO_REFRESH: Duration = Duration::from_secs(7 * 86400);

/// HELO entries unused for two weeks are evicted.
pub const HELO_EVICT: Duration = Duration::from_secs(14 * 86400);

/// Estimated-ham window: one week of traffic at the minimum observed
/// inter-arrival time.
pub const HAM_WINDOW_SECS: f64 = 7.0 * 86400.0;
