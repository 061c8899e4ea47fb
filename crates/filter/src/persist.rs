/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Persistence fiber. Stores carry a dirty flag; every tick the fiber
//! snapshots whatever changed and writes it atomically. A failed write
//! re-marks the store so the next tick retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use utils::snapshot::{read_snapshot, write_snapshot};

use crate::Engine;

const SNAPSHOT_VERSION: u32 = 1;

const SPF_MAP: &str = "spf.map";
const GUESS_MAP: &str = "guess.map";
const HELO_MAP: &str = "helo.map";
const DISTRIBUTION_MAP: &str = "distribution.map";
const COMPLAIN_MAP: &str = "complain.map";
const LIST_MAP: &str = "list.map";
const ABUSE_CONTACT_MAP: &str = "abuse.map";
const ABUSE_FILE: &str = "dns.abuse.txt";

/// Reloads every store from its snapshot file. Missing files are a
/// normal first start.
pub fn load(engine: &Engine) {
    let dir = &engine.core.config.server.data_dir;

    if let Some(records) = load_file(dir, SPF_MAP, "spf") {
        engine.spf.restore(records);
    }
    if let Some(records) = load_file(dir, GUESS_MAP, "guess") {
        engine.spf.restore_guesses(records);
    }
    if let Some(records) = load_file(dir, HELO_MAP, "helo") {
        engine.helo.restore(records);
    }
    if let Some(records) = load_file(dir, DISTRIBUTION_MAP, "distribution") {
        engine.reputation.restore(records);
    }
    if let Some(records) = load_file(dir, COMPLAIN_MAP, "complain") {
        engine.ledger.restore(records);
    }
    if let Some(records) = load_file::<ListSnapshotRecord>(dir, LIST_MAP, "list") {
        for record in records {
            if let Some(list) = engine.lists.by_name(&record.list) {
                list.restore(vec![record.entry]);
            }
        }
    }
    if let Some(records) = load_file(dir, ABUSE_CONTACT_MAP, "abuse") {
        engine.abuse_contacts.restore(records);
    }
    match std::fs::read_to_string(dir.join(ABUSE_FILE)) {
        Ok(content) => {
            engine
                .abuse
                .restore_lines(content.lines().map(str::to_string));
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                context = "persist",
                event = "load-error",
                file = ABUSE_FILE,
                "Failed to load abuse periods: {err}"
            );
        }
    }
}

fn load_file<T: DeserializeOwned>(dir: &Path, file: &str, store: &str) -> Option<Vec<T>> {
    let path = dir.join(file);
    match read_snapshot(&path, store, SNAPSHOT_VERSION) {
        Ok(records) => {
            tracing::info!(
                context = "persist",
                event = "loaded",
                file = file,
                records = records.len(),
                "Snapshot loaded"
            );
            Some(records)
        }
        Err(utils::snapshot::SnapshotError::Io(err))
            if err.kind() == std::io::ErrorKind::NotFound =>
        {
            None
        }
        Err(err) => {
            tracing::error!(
                context = "persist",
                event = "load-error",
                file = file,
                "Failed to load snapshot: {err}"
            );
            None
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ListSnapshotRecord {
    list: String,
    entry: String,
}

/// Writes every dirty store. Called from the persistence tick and once
/// more at shutdown.
pub fn store_dirty(engine: &Engine) {
    let dir = engine.core.config.server.data_dir.clone();
    if let Err(err) = std::fs::create_dir_all(&dir) {
        tracing::error!(
            context = "persist",
            event = "store-error",
            "Cannot create data directory: {err}"
        );
        return;
    }

    if engine.spf.take_dirty()
        && !write_file(&dir, SPF_MAP, "spf", engine.spf.snapshot())
    {
        engine.spf.mark_dirty();
    }
    if engine.spf.take_guess_dirty()
        && !write_file(&dir, GUESS_MAP, "guess", engine.spf.guess_snapshot())
    {
        engine.spf.mark_guess_dirty();
    }
    if engine.helo.take_dirty()
        && !write_file(&dir, HELO_MAP, "helo", engine.helo.snapshot())
    {
        engine.helo.mark_dirty();
    }
    if engine.reputation.take_dirty()
        && !write_file(&dir, DISTRIBUTION_MAP, "distribution", engine.reputation.snapshot())
    {
        engine.reputation.mark_dirty();
    }
    if engine.ledger.take_dirty()
        && !write_file(&dir, COMPLAIN_MAP, "complain", engine.ledger.snapshot())
    {
        engine.ledger.mark_dirty();
    }
    let lists_dirty = engine
        .lists
        .all()
        .iter()
        .fold(false, |dirty, list| list.take_dirty() || dirty);
    if lists_dirty {
        let records: Vec<ListSnapshotRecord> = engine
            .lists
            .all()
            .iter()
            .flat_map(|list| {
                list.entries()
                    .into_iter()
                    .map(|entry| ListSnapshotRecord {
                        list: list.name().to_string(),
                        entry,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        if !write_file(&dir, LIST_MAP, "list", records) {
            engine.lists.white.mark_dirty();
        }
    }
    if engine.abuse_contacts.take_dirty()
        && !write_file(&dir, ABUSE_CONTACT_MAP, "abuse", engine.abuse_contacts.entries())
    {
        engine.abuse_contacts.mark_dirty();
    }
    if engine.abuse.take_dirty() {
        let path = dir.join(ABUSE_FILE);
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        let mut content = engine.abuse.snapshot_lines().join("\n");
        content.push('\n');
        if std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .is_err()
        {
            tracing::error!(
                context = "persist",
                event = "store-error",
                file = ABUSE_FILE,
                "Abuse period write failed"
            );
            engine.abuse.mark_dirty();
        }
    }
}

fn write_file<T: Serialize>(dir: &Path, file: &str, store: &str, records: Vec<T>) -> bool {
    match write_snapshot(&dir.join(file), store, SNAPSHOT_VERSION, records.iter()) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(
                context = "persist",
                event = "store-error",
                file = file,
                "Snapshot write failed, retrying next tick: {err}"
            );
            false
        }
    }
}

/// Persistence plus expiry housekeeping, spawned once at startup.
pub fn spawn_maintenance(engine: Arc<Engine>, interval: Duration) {
    // Persistence tick.
    let persist_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let engine = persist_engine.clone();
            let result = tokio::task::spawn_blocking(move || store_dirty(&engine)).await;
            if result.is_err() {
                tracing::error!(
                    context = "persist",
                    event = "panic",
                    "Persistence task panicked"
                );
            }
        }
    });

    // Expiry sweep.
    let expire_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            expire_engine.spf.expire();
            expire_engine.helo.expire();
            expire_engine.reputation.expire();
            expire_engine.ledger.expire();
            expire_engine.defers.expire();
            expire_engine
                .abuse
                .expire(&expire_engine.core.config.abuse);
        }
    });

    // SPF refresh: re-resolve the record with the highest query pressure.
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(domain) = engine.spf.refresh_candidate() {
                engine.spf.refresh(&engine.core.resolver, &domain).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use common::config::CoreConfig;
    use common::resolver::{MockDns, Resolver};
    use common::Core;
    use utils::config::Config;

    use crate::token::TokenSet;
    use crate::Engine;

    fn engine_at(dir: &Path) -> Arc<Engine> {
        let mut config = Config::new(format!(
            "[server]\ndata-dir = \"{}\"\n",
            dir.display()
        ))
        .unwrap();
        let core_config = CoreConfig::parse(&mut config);
        let core = Core::new(core_config, Resolver::mock(MockDns::default()));
        Engine::new(core, &[42u8; 32])
    }

    #[test]
    fn store_and_load_round_trip() {
        let dir = std::env::temp_dir().join("persist-round-trip");
        let _ = std::fs::remove_dir_all(&dir);

        let engine = engine_at(&dir);
        let mut tokens = TokenSet::new();
        tokens.insert("192.0.2.5".to_string());
        let ticket = engine.register_query(&tokens);
        engine.add_complaint(&ticket).unwrap();
        engine.lists.block.add(".spam.example").unwrap();
        engine
            .abuse
            .register_event("198.51.100.1".parse().unwrap(), &engine.core.config.abuse);

        super::store_dirty(&engine);

        let restored = engine_at(&dir);
        super::load(&restored);

        assert_eq!(
            restored.reputation.get("192.0.2.5").unwrap().complaints(),
            1
        );
        assert!(restored.lists.block.matches_token(".mx.spam.example"));
        assert!(!restored.ledger.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
