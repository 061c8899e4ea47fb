/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! TCP frontends: the line-oriented command protocol used by relays and
//! administrators, and the Postfix-compatible policy delegation
//! protocol. Both answer one request per connection and close.

pub mod command;
pub mod policy;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use filter::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// How a frontend frames its requests: a single line, or a block of
/// attribute lines terminated by a blank line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Line,
    Block,
}

pub async fn spawn_command(
    engine: Arc<Engine>,
    shutdown: watch::Sender<bool>,
) -> std::io::Result<()> {
    let Some(bind) = engine.core.config.server.command_bind else {
        return Ok(());
    };
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(
        context = "command",
        event = "listen",
        bind = %bind,
        "Command frontend listening"
    );
    tokio::spawn(serve(
        engine,
        listener,
        Framing::Line,
        move |engine, line, peer| {
            let shutdown = shutdown.clone();
            async move { command::process(&engine, &line, peer, &shutdown).await }
        },
    ));
    Ok(())
}

pub async fn spawn_policy(engine: Arc<Engine>) -> std::io::Result<()> {
    let Some(bind) = engine.core.config.server.policy_bind else {
        return Ok(());
    };
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(
        context = "policy",
        event = "listen",
        bind = %bind,
        "Policy frontend listening"
    );
    tokio::spawn(serve(
        engine,
        listener,
        Framing::Block,
        |engine, request, peer| async move { policy::process(&engine, &request, peer).await },
    ));
    Ok(())
}

/// Accept loop: one request per connection, bounded by the session
/// budget, then close.
async fn serve<F, Fut>(engine: Arc<Engine>, listener: TcpListener, framing: Framing, handler: F)
where
    F: Fn(Arc<Engine>, String, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = String> + Send,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::debug!(
                    context = "listener",
                    event = "accept-error",
                    "Failed to accept connection: {err}"
                );
                continue;
            }
        };
        let engine = engine.clone();
        let handler = handler.clone();
        let budget = engine.core.config.server.session_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(budget, session(engine, stream, peer, framing, handler))
                .await
                .is_err()
            {
                tracing::debug!(
                    context = "listener",
                    event = "timeout",
                    peer = %peer.ip(),
                    "Session exceeded its budget"
                );
            }
        });
    }
}

async fn session<F, Fut>(
    engine: Arc<Engine>,
    mut stream: TcpStream,
    peer: SocketAddr,
    framing: Framing,
    handler: F,
) where
    F: Fn(Arc<Engine>, String, SocketAddr) -> Fut,
    Fut: std::future::Future<Output = String>,
{
    let request = match read_request(&mut stream, framing).await {
        Ok(request) if !request.trim().is_empty() => request,
        Ok(_) => return,
        Err(err) => {
            tracing::debug!(
                context = "listener",
                event = "read-error",
                peer = %peer.ip(),
                "Failed to read request: {err}"
            );
            return;
        }
    };
    let response = handler(engine, request, peer).await;
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(
            context = "listener",
            event = "write-error",
            peer = %peer.ip(),
            "Failed to write response: {err}"
        );
    }
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream, framing: Framing) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let read = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > 65_536 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }
        let done = match framing {
            Framing::Line => buffer.contains(&b'\n'),
            Framing::Block => buffer.ends_with(b"\n\n") || buffer.ends_with(b"\r\n\r\n"),
        };
        if done {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
