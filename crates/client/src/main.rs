//! Backdesk Client - Main entry point
//!
//! Runs the realtime feed from environment configuration and prints every
//! notification until interrupted.

use anyhow::Context;
use backdesk_client::{ClientConfig, FeedCoordinator, FeedNotice, RealtimeHub};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("backdesk_client=debug")),
        )
        .init();

    let config = ClientConfig::from_env();
    if config.access_token.is_none() {
        tracing::warn!("BACKDESK_ACCESS_TOKEN is not set; realtime authentication will fail");
    }
    tracing::info!("Using dashboard API at {}", config.api_url);

    RealtimeHub::install(FeedCoordinator::from_config(&config))
        .map_err(|_| anyhow::anyhow!("realtime hub already installed"))?;
    let feed = backdesk_client::use_feed().context("realtime hub is not installed")?;

    let mut updates = feed.updates();
    let mut notices = feed.notices();
    let mut modes = feed.mode_changes();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            update = updates.recv() => match update {
                Ok(record) => println!(
                    "[{}] {} - {} ({} unread)",
                    record.timestamp.format("%H:%M:%S"),
                    record.title,
                    record.message,
                    feed.unread_count()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} notifications", skipped)
                }
                Err(RecvError::Closed) => break,
            },
            notice = notices.recv() => {
                if let Ok(FeedNotice::RealtimeUnavailable { attempts, reason }) = notice {
                    eprintln!(
                        "Realtime updates unavailable after {} attempts ({}); polling instead",
                        attempts, reason
                    );
                }
            }
            changed = modes.changed() => {
                if changed.is_err() {
                    break;
                }
                let mode = *modes.borrow_and_update();
                let status = feed.status();
                tracing::info!("Feed mode {:?}, connection {}", mode, status.connection);
            }
        }
    }

    drop(feed);
    Ok(())
}
