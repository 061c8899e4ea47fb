/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod parser;
pub mod utils;

use std::collections::BTreeMap;
use std::time::Duration;

use ahash::AHashMap;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    pub keys: BTreeMap<String, String>,
    pub missing: AHashMap<String, Option<String>>,
    pub errors: AHashMap<String, ConfigError>,
    pub warnings: AHashMap<String, ConfigError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Build(String),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigKey {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Rate {
    pub requests: u64,
    pub period: Duration,
}

impl Config {
    pub fn log_errors(&self) {
        for (key, err) in &self.errors {
            match err {
                ConfigError::Parse(details) => {
                    tracing::error!(
                        context = "config",
                        event = "parse-error",
                        key = key.as_str(),
                        "Invalid configuration value: {details}"
                    );
                }
                ConfigError::Build(details) => {
                    tracing::error!(
                        context = "config",
                        event = "build-error",
                        key = key.as_str(),
                        "Configuration build failed: {details}"
                    );
                }
            }
        }
    }

    pub fn log_warnings(&self) {
        for (key, err) in &self.warnings {
            let (ConfigError::Parse(details) | ConfigError::Build(details)) = err;
            tracing::warn!(
                context = "config",
                event = "warning",
                key = key.as_str(),
                "{details}"
            );
        }
    }
}

impl From<(String, String)> for ConfigKey {
    fn from((key, value): (String, String)) -> Self {
        ConfigKey { key, value }
    }
}

impl From<(&str, &str)> for ConfigKey {
    fn from((key, value): (&str, &str)) -> Self {
        ConfigKey {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}
