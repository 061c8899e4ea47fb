/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::collections::BTreeMap;

use super::Config;

pub type Result<T> = std::result::Result<T, String>;

impl Config {
    pub fn new(toml: impl AsRef<str>) -> Result<Self> {
        let mut config = Config::default();
        config.parse(toml.as_ref())?;
        Ok(config)
    }

    /// Parses a TOML-style document into flat dotted keys. Tables nest by
    /// prefixing, arrays become `key.0`, `key.1`, … so that list values can
    /// be iterated with `values()`.
    pub fn parse(&mut self, toml: &str) -> Result<()> {
        let mut table = String::new();

        for (line_num, raw_line) in toml.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let header = header
                    .strip_suffix(']')
                    .ok_or_else(|| format!("line {}: unterminated table header", line_num + 1))?
                    .trim();
                if header.is_empty() {
                    return Err(format!("line {}: empty table header", line_num + 1));
                }
                table = header.to_string();
            } else if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    return Err(format!("line {}: empty key", line_num + 1));
                }
                let key = if table.is_empty() {
                    unquote_key(key)
                } else {
                    format!("{table}.{}", unquote_key(key))
                };
                parse_value(&mut self.keys, key, value.trim(), line_num + 1)?;
            } else {
                return Err(format!(
                    "line {}: expected 'key = value' or '[table]', found {line:?}",
                    line_num + 1
                ));
            }
        }

        Ok(())
    }
}

fn unquote_key(key: &str) -> String {
    key.split('.')
        .map(|part| part.trim_matches('"').trim())
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_value(
    keys: &mut BTreeMap<String, String>,
    key: String,
    value: &str,
    line_num: usize,
) -> Result<()> {
    if let Some(list) = value.strip_prefix('[') {
        let list = list
            .strip_suffix(']')
            .ok_or_else(|| format!("line {line_num}: unterminated array for key {key:?}"))?;
        let mut pos = 0;
        for item in split_array(list, line_num)? {
            keys.insert(format!("{key}.{pos:04}"), item);
            pos += 1;
        }
        if pos == 0 {
            keys.insert(key, String::new());
        }
    } else {
        keys.insert(key, parse_scalar(value, line_num)?);
    }
    Ok(())
}

fn split_array(list: &str, line_num: usize) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for item in split_top_level(list) {
        let item = item.trim();
        if !item.is_empty() {
            items.push(parse_scalar(item, line_num)?);
        }
    }
    Ok(items)
}

// Splits on commas outside quoted strings.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (pos, ch) in list.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(&list[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    items.push(&list[start..]);
    items
}

fn parse_scalar(value: &str, line_num: usize) -> Result<String> {
    if let Some(quoted) = value.strip_prefix('"') {
        let end = quoted
            .find('"')
            .ok_or_else(|| format!("line {line_num}: unterminated string"))?;
        Ok(quoted[..end].to_string())
    } else if let Some(quoted) = value.strip_prefix('\'') {
        let end = quoted
            .find('\'')
            .ok_or_else(|| format!("line {line_num}: unterminated string"))?;
        Ok(quoted[..end].to_string())
    } else {
        // Bare scalar, strip a trailing comment.
        let value = value.split('#').next().unwrap_or_default().trim();
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Config;

    #[test]
    fn toml_parse() {
        let config = Config::new(
            r#"
# engine settings
[server]
hostname = "mx.example.net"
run-as.user = "mail"

[server.listener.command]
bind = "127.0.0.1:9877"
max-connections = 50

[spf]
strict-errors = false
voids = 3

[dns]
zones = ["dnsbl.example.net", "dnswl.example.net"]
"#,
        )
        .unwrap();

        assert_eq!(
            config.keys.get("server.hostname").map(String::as_str),
            Some("mx.example.net")
        );
        assert_eq!(
            config.keys.get("server.run-as.user").map(String::as_str),
            Some("mail")
        );
        assert_eq!(
            config
                .keys
                .get("server.listener.command.bind")
                .map(String::as_str),
            Some("127.0.0.1:9877")
        );
        assert_eq!(
            config.keys.get("spf.strict-errors").map(String::as_str),
            Some("false")
        );
        assert_eq!(
            config.keys.get("dns.zones.0000").map(String::as_str),
            Some("dnsbl.example.net")
        );
        assert_eq!(
            config.keys.get("dns.zones.0001").map(String::as_str),
            Some("dnswl.example.net")
        );
    }

    #[test]
    fn toml_parse_errors() {
        assert!(Config::new("[unterminated").is_err());
        assert!(Config::new("no equals sign").is_err());
        assert!(Config::new("key = \"unterminated").is_err());
    }
}
