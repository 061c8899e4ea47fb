/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod eval;
pub mod record;
pub mod registry;

use std::fmt::{self, Display};

/// Qualifier attached to a matching mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

/// Outcome of evaluating a sender policy for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    PermError,
    TempError,
}

impl From<Qualifier> for SpfResult {
    fn from(qualifier: Qualifier) -> Self {
        match qualifier {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

impl Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpfResult::Pass => "PASS",
            SpfResult::Fail => "FAIL",
            SpfResult::SoftFail => "SOFTFAIL",
            SpfResult::Neutral => "NEUTRAL",
            SpfResult::None => "NONE",
            SpfResult::PermError => "PERMERROR",
            SpfResult::TempError => "TEMPERROR",
        })
    }
}

impl SpfResult {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "PASS" => SpfResult::Pass,
            "FAIL" => SpfResult::Fail,
            "SOFTFAIL" => SpfResult::SoftFail,
            "NEUTRAL" => SpfResult::Neutral,
            "NONE" => SpfResult::None,
            "PERMERROR" => SpfResult::PermError,
            "TEMPERROR" => SpfResult::TempError,
            _ => return None,
        })
    }
}
