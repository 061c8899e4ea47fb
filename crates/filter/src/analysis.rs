/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Daily analysis log. The DNS-list frontend queues every token it is
//! asked about; a background task resolves each to its current verdict
//! and appends `<token> <verdict>` to `./data/<date>.csv`, one pass per
//! token per day.

use std::path::PathBuf;
use std::sync::Arc;

use ahash::AHashSet;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::Engine;

pub struct AnalysisQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    seen: Mutex<(String, AHashSet<String>)>,
}

impl Default for AnalysisQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        AnalysisQueue {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            seen: Mutex::new((String::new(), AHashSet::new())),
        }
    }
}

impl AnalysisQueue {
    /// Queues a token for today's analysis pass; repeats within the same
    /// day are dropped here.
    pub fn enqueue(&self, token: &str) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let mut seen = self.seen.lock();
            if seen.0 != today {
                *seen = (today, AHashSet::new());
            }
            if !seen.1.insert(token.to_string()) {
                return;
            }
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(token.to_string());
        }
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.rx.lock().take()
    }
}

pub async fn spawn_analysis(engine: Arc<Engine>) {
    let Some(mut rx) = engine.analysis.take_receiver() else {
        return;
    };
    let data_dir = engine.core.config.server.data_dir.clone();
    tokio::spawn(async move {
        while let Some(token) = rx.recv().await {
            let verdict = verdict_for(&engine, &token);
            let path = day_file(&data_dir);
            if let Err(err) = append_line(&path, &format!("{token} {verdict}\n")).await {
                tracing::warn!(
                    context = "analysis",
                    event = "write-error",
                    path = %path.display(),
                    "Failed to append analysis result: {err}"
                );
            }
        }
    });
}

fn verdict_for(engine: &Engine, token: &str) -> &'static str {
    if engine.lists.block.matches_token(token) {
        "BLOCK"
    } else {
        engine.reputation.status(token).as_str()
    }
}

fn day_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(format!("{}.csv", Utc::now().format("%Y-%m-%d")))
}

async fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}
