/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::Path;
use std::time::Duration;

use common::config::CoreConfig;
use common::resolver::Resolver;
use common::Core;
use filter::ticket::TicketCodec;
use filter::Engine;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use utils::config::Config;
use utils::UnwrapFailure;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("POSTSHIELD_CONFIG").ok())
        .unwrap_or_else(|| "./config.toml".to_string());
    let toml = match std::fs::read_to_string(&config_path) {
        Ok(toml) => toml,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                context = "main",
                event = "no-config",
                path = config_path.as_str(),
                "Configuration file not found, using defaults"
            );
            String::new()
        }
        Err(err) => {
            utils::failed(&format!("Failed to read {config_path}: {err}"));
        }
    };
    let mut config = Config::new(&toml)
        .failed(&format!("Failed to parse {config_path}"));

    let persist_interval =
        config.property_or_default::<Duration>("persist.interval", "1m");
    let resolver = Resolver::parse(&mut config);
    let core_config = CoreConfig::parse(&mut config);
    config.log_errors();
    config.log_warnings();

    // Build the engine and reload the stores.
    let ticket_key = load_ticket_key(&core_config.server.data_dir);
    let core = Core::new(core_config, resolver);
    let engine = Engine::new(core, &ticket_key);
    filter::persist::load(&engine);

    // Background fibers: persistence, expiry, SPF refresh, gossip,
    // analysis.
    filter::persist::spawn_maintenance(engine.clone(), persist_interval);
    filter::gossip::spawn_gossip(engine.clone()).await;
    filter::analysis::spawn_analysis(engine.clone()).await;

    // Frontends.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    query::spawn_command(engine.clone(), shutdown_tx.clone())
        .await
        .failed("Failed to start command frontend");
    query::spawn_policy(engine.clone())
        .await
        .failed("Failed to start policy frontend");
    dnsd::spawn_dns(engine.clone())
        .await
        .failed("Failed to start DNS list frontend");

    tracing::info!(
        context = "main",
        event = "started",
        hostname = engine.core.hostname(),
        "postshield running"
    );

    // Wait for a shutdown signal from the system or the SHUTDOWN verb.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown_rx.changed() => {}
    }

    tracing::info!(context = "main", event = "shutdown", "Shutting down");
    filter::persist::store_dirty(&engine);
    Ok(())
}

/// The ticket key outlives restarts: complaints must keep decoding
/// tickets issued before the process bounced.
fn load_ticket_key(data_dir: &Path) -> [u8; 32] {
    let path = data_dir.join("ticket.key");
    match std::fs::read(&path) {
        Ok(bytes) if bytes.len() == 32 => {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            key
        }
        Ok(_) => {
            utils::failed(&format!(
                "Ticket key {} is corrupt, refusing to start",
                path.display()
            ));
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let key = TicketCodec::generate_key();
            std::fs::create_dir_all(data_dir)
                .and_then(|_| std::fs::write(&path, key))
                .failed(&format!("Failed to write {}", path.display()));
            tracing::info!(
                context = "main",
                event = "key-created",
                path = %path.display(),
                "Generated new ticket key"
            );
            key
        }
        Err(err) => {
            utils::failed(&format!("Failed to read {}: {err}", path.display()));
        }
    }
}
