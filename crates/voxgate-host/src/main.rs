//! # voxgate
//!
//! Bridges a messaging layer to the audio session coordinator. Requests are
//! read from stdin and responses written to stdout, one JSON object per line.
//! Logs go to stderr.

mod bridge;

use std::sync::Arc;

use anyhow::{Context, Result};
use bridge::Bridge;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxgate_audio::SessionCoordinator;
use voxgate_core::message::Response;
use voxgate_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is reserved for responses
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxgate=info,voxgate_audio=info".into()),
        )
        .init();

    info!("Starting voxgate v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    let coordinator = Arc::new(
        SessionCoordinator::with_devices(config).context("Failed to start session coordinator")?,
    );
    let bridge = Bridge::new(coordinator.clone());

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(out_rx));

    // Recordings finished by the duration cap are announced without a request.
    let events = coordinator.events();
    let notify_tx = out_tx.clone();
    let forwarder = tokio::task::spawn_blocking(move || {
        for event in events {
            if let Some(response) = bridge::notification(event) {
                if notify_tx.send(response).is_err() {
                    break;
                }
            }
        }
        debug!("Event stream closed");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let in_flight = bridge.handle_line(&line);
        let tx = out_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(in_flight.response().await);
        });
    }

    info!("Input closed, shutting down");
    drop(bridge);
    tokio::task::spawn_blocking(move || coordinator.shutdown()).await?;
    forwarder.await?;
    drop(out_tx);
    writer.await??;

    Ok(())
}

async fn write_responses(mut rx: mpsc::UnboundedReceiver<Response>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let mut line = match response.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize response: {e}");
                continue;
            }
        };
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
