/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Versioned snapshot files for the in-memory stores. Each file begins
//! with a magic line naming the store and its schema version, followed by
//! one JSON record per line. Writes go to a temporary file in the same
//! directory and are renamed into place, so readers never observe a
//! partial snapshot.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

const MAGIC: &str = "#postshield";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a snapshot file")]
    BadMagic,
    #[error("snapshot is for store {found:?}, expected {expected:?}")]
    WrongStore { expected: String, found: String },
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt record at line {line}: {details}")]
    Corrupt { line: usize, details: String },
}

pub fn write_snapshot<T: Serialize>(
    path: &Path,
    store: &str,
    version: u32,
    records: impl Iterator<Item = T>,
) -> Result<(), SnapshotError> {
    let tmp_path = tmp_path(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writeln!(writer, "{MAGIC} {store} v{version}")?;
        for record in records {
            let line = serde_json::to_string(&record).map_err(|err| SnapshotError::Corrupt {
                line: 0,
                details: err.to_string(),
            })?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Loads a snapshot, skipping records that no longer deserialize rather
/// than failing the whole load. A reputation store that survives a restart
/// minus a few records beats one that resets to empty.
pub fn read_snapshot<T: DeserializeOwned>(
    path: &Path,
    store: &str,
    version: u32,
) -> Result<Vec<T>, SnapshotError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = String::new();
    reader.read_line(&mut header)?;
    let mut parts = header.trim().split(' ');
    if parts.next() != Some(MAGIC) {
        return Err(SnapshotError::BadMagic);
    }
    let found = parts.next().unwrap_or_default();
    if found != store {
        return Err(SnapshotError::WrongStore {
            expected: store.to_string(),
            found: found.to_string(),
        });
    }
    let found_version: u32 = parts
        .next()
        .and_then(|v| v.strip_prefix('v'))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if found_version == 0 || found_version > version {
        return Err(SnapshotError::UnsupportedVersion(found_version));
    }

    let mut records = Vec::new();
    for (pos, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(
                    context = "snapshot",
                    event = "skip-record",
                    store = store,
                    line = pos + 2,
                    "Skipping corrupt snapshot record: {err}"
                );
            }
        }
    }
    Ok(records)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{read_snapshot, write_snapshot, SnapshotError};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        key: String,
        count: u32,
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = std::env::temp_dir().join("snapshot-round-trip");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("distribution.map");

        let records = vec![
            Record {
                key: "192.0.2.5".to_string(),
                count: 3,
            },
            Record {
                key: ".mx.example.com".to_string(),
                count: 0,
            },
        ];
        write_snapshot(&path, "distribution", 1, records.iter()).unwrap();

        let loaded: Vec<Record> = read_snapshot(&path, "distribution", 1).unwrap();
        assert_eq!(loaded, records);

        // A different store name must be rejected.
        assert!(matches!(
            read_snapshot::<Record>(&path, "complain", 1),
            Err(SnapshotError::WrongStore { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn skips_corrupt_records() {
        let dir = std::env::temp_dir().join("snapshot-corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("complain.map");
        std::fs::write(
            &path,
            "#postshield complain v1\n{\"key\":\"a\",\"count\":1}\nnot json\n",
        )
        .unwrap();

        let loaded: Vec<Record> = read_snapshot(&path, "complain", 1).unwrap();
        assert_eq!(loaded.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
