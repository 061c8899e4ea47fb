/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod config;
pub mod ip;
pub mod resolver;

use std::sync::Arc;

use config::CoreConfig;
use resolver::Resolver;

/// Shared core handed to every frontend: the parsed configuration plus the
/// DNS resolver. Higher layers attach their stores to this through the
/// engine value; nothing in the process is a global.
pub struct Core {
    pub config: CoreConfig,
    pub resolver: Resolver,
}

impl Core {
    pub fn new(config: CoreConfig, resolver: Resolver) -> Arc<Self> {
        Arc::new(Core { config, resolver })
    }

    pub fn hostname(&self) -> &str {
        &self.config.server.hostname
    }
}
