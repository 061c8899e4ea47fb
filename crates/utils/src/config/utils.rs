/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use super::{Config, ConfigError, Rate};

impl Config {
    pub fn value(&self, key: impl AsKey) -> Option<&str> {
        self.keys.get(&key.as_key()).map(String::as_str)
    }

    pub fn contains_key(&self, key: impl AsKey) -> bool {
        self.keys.contains_key(&key.as_key())
    }

    pub fn value_require(&mut self, key: impl AsKey) -> Option<&str> {
        let key = key.as_key();
        if self.keys.contains_key(&key) {
            self.keys.get(&key).map(String::as_str)
        } else {
            self.missing.insert(key, None);
            None
        }
    }

    pub fn value_or_else(&self, key: impl AsKey, or_else: impl AsKey) -> Option<&str> {
        self.value(key).or_else(|| self.value(or_else))
    }

    pub fn property<T: ParseValue>(&mut self, key: impl AsKey) -> Option<T> {
        let key = key.as_key();
        if let Some(value) = self.keys.get(&key) {
            match T::parse_value(value) {
                Ok(value) => Some(value),
                Err(err) => {
                    self.new_parse_error(key, err);
                    None
                }
            }
        } else {
            None
        }
    }

    pub fn property_or_default<T: ParseValue>(&mut self, key: impl AsKey, default: &str) -> T {
        let key = key.as_key();
        let value = self.keys.get(&key).map(String::as_str).unwrap_or(default);
        match T::parse_value(value) {
            Ok(value) => value,
            Err(err) => {
                self.new_parse_error(key.clone(), err);
                T::parse_value(default)
                    .unwrap_or_else(|_| panic!("invalid default for key {key:?}"))
            }
        }
    }

    pub fn property_require<T: ParseValue>(&mut self, key: impl AsKey) -> Option<T> {
        let key = key.as_key();
        if self.keys.contains_key(&key) {
            self.property(key)
        } else {
            self.missing.insert(key, None);
            None
        }
    }

    /// Iterates `prefix.0000`, `prefix.0001`, … array values as well as a
    /// plain `prefix` scalar.
    pub fn values(&self, prefix: impl AsKey) -> impl Iterator<Item = (&str, &str)> {
        let full_prefix = prefix.as_key();
        let prefix = format!("{full_prefix}.");
        self.keys.range(full_prefix.clone()..).take_while(
            move |(key, _)| {
                key.as_str() == full_prefix || key.starts_with(&prefix)
            },
        )
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .filter(|(_, value)| !value.is_empty())
    }

    /// Distinct child key names one level below the prefix.
    pub fn sub_keys(&self, prefix: impl AsKey) -> Vec<String> {
        let prefix = format!("{}.", prefix.as_key());
        let mut last = String::new();
        let mut result = Vec::new();
        for (key, _) in self.keys.range(prefix.clone()..) {
            if let Some(sub) = key.strip_prefix(&prefix) {
                let sub = sub.split('.').next().unwrap_or(sub);
                if sub != last {
                    last = sub.to_string();
                    result.push(last.clone());
                }
            } else {
                break;
            }
        }
        result
    }

    pub fn new_parse_error(&mut self, key: impl AsKey, details: impl Into<String>) {
        self.errors
            .insert(key.as_key(), ConfigError::Parse(details.into()));
    }

    pub fn new_build_error(&mut self, key: impl AsKey, details: impl Into<String>) {
        self.errors
            .insert(key.as_key(), ConfigError::Build(details.into()));
    }

    pub fn new_build_warning(&mut self, key: impl AsKey, details: impl Into<String>) {
        self.warnings
            .insert(key.as_key(), ConfigError::Build(details.into()));
    }
}

pub trait AsKey: Clone {
    fn as_key(&self) -> String;
}

impl AsKey for &str {
    fn as_key(&self) -> String {
        self.to_string()
    }
}

impl AsKey for String {
    fn as_key(&self) -> String {
        self.clone()
    }
}

impl AsKey for (&str, &str) {
    fn as_key(&self) -> String {
        format!("{}.{}", self.0, self.1)
    }
}

impl AsKey for (&str, &str, &str) {
    fn as_key(&self) -> String {
        format!("{}.{}.{}", self.0, self.1, self.2)
    }
}

pub trait ParseValue: Sized {
    fn parse_value(value: &str) -> Result<Self, String>;
}

impl ParseValue for String {
    fn parse_value(value: &str) -> Result<Self, String> {
        Ok(value.to_string())
    }
}

impl ParseValue for PathBuf {
    fn parse_value(value: &str) -> Result<Self, String> {
        Ok(PathBuf::from(value))
    }
}

impl ParseValue for bool {
    fn parse_value(value: &str) -> Result<Self, String> {
        value
            .parse()
            .map_err(|_| format!("invalid boolean {value:?}"))
    }
}

impl ParseValue for IpAddr {
    fn parse_value(value: &str) -> Result<Self, String> {
        value
            .parse()
            .map_err(|_| format!("invalid IP address {value:?}"))
    }
}

impl ParseValue for Ipv4Addr {
    fn parse_value(value: &str) -> Result<Self, String> {
        value
            .parse()
            .map_err(|_| format!("invalid IPv4 address {value:?}"))
    }
}

impl ParseValue for Ipv6Addr {
    fn parse_value(value: &str) -> Result<Self, String> {
        value
            .parse()
            .map_err(|_| format!("invalid IPv6 address {value:?}"))
    }
}

impl ParseValue for SocketAddr {
    fn parse_value(value: &str) -> Result<Self, String> {
        value
            .parse()
            .map_err(|_| format!("invalid socket address {value:?}"))
    }
}

macro_rules! parse_integer {
    ($($t:ty),*) => {
        $(impl ParseValue for $t {
            fn parse_value(value: &str) -> Result<Self, String> {
                value
                    .parse()
                    .map_err(|_| format!("invalid integer {value:?}"))
            }
        })*
    };
}

parse_integer!(u16, i16, u32, i32, u64, i64, usize);

impl ParseValue for f64 {
    fn parse_value(value: &str) -> Result<Self, String> {
        value
            .parse()
            .map_err(|_| format!("invalid number {value:?}"))
    }
}

impl ParseValue for Duration {
    fn parse_value(value: &str) -> Result<Self, String> {
        let value = value.trim();
        let split = value
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, unit) = value.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        match unit.trim() {
            "ms" => Ok(Duration::from_millis(amount)),
            "s" | "" => Ok(Duration::from_secs(amount)),
            "m" => Ok(Duration::from_secs(amount * 60)),
            "h" => Ok(Duration::from_secs(amount * 3600)),
            "d" => Ok(Duration::from_secs(amount * 86400)),
            _ => Err(format!("invalid duration unit {unit:?}")),
        }
    }
}

impl ParseValue for Rate {
    fn parse_value(value: &str) -> Result<Self, String> {
        let (requests, period) = value
            .split_once('/')
            .ok_or_else(|| format!("invalid rate {value:?}, expected <requests>/<period>"))?;
        Ok(Rate {
            requests: requests
                .trim()
                .parse()
                .map_err(|_| format!("invalid rate {value:?}"))?,
            period: Duration::parse_value(period)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ParseValue;
    use crate::config::{Config, Rate};

    #[test]
    fn typed_accessors() {
        let mut config = Config::new(
            "[session]\ntimeout = \"20s\"\nlimit = 100\nrate = \"16384/7d\"\n",
        )
        .unwrap();
        assert_eq!(
            config.property::<Duration>("session.timeout"),
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.property::<u64>("session.limit"), Some(100));
        assert_eq!(
            config.property::<Rate>("session.rate"),
            Some(Rate {
                requests: 16384,
                period: Duration::from_secs(7 * 86400),
            })
        );
        assert_eq!(
            config.property_or_default::<u64>("session.missing", "42"),
            42
        );
        assert!(config.errors.is_empty());
    }

    #[test]
    fn durations() {
        for (value, expect) in [
            ("500ms", Duration::from_millis(500)),
            ("30", Duration::from_secs(30)),
            ("10m", Duration::from_secs(600)),
            ("2h", Duration::from_secs(7200)),
            ("5d", Duration::from_secs(432000)),
        ] {
            assert_eq!(Duration::parse_value(value).unwrap(), expect, "{value}");
        }
        assert!(Duration::parse_value("7w").is_err());
    }

    #[test]
    fn sub_keys() {
        let config = Config::new(
            "[zone.dnsbl]\nhost = \"a\"\n[zone.dnswl]\nhost = \"b\"\n[zone.score]\nhost = \"c\"\n",
        )
        .unwrap();
        assert_eq!(config.sub_keys("zone"), ["dnsbl", "dnswl", "score"]);
    }
}
