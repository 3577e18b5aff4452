// ABOUTME: daemon command - runs change capture, batching and reconciliation until stopped
// ABOUTME: Used in the foreground and in the detached child after daemonize

use anyhow::Result;
use std::sync::Arc;

use super::Stores;
use crate::sync::SyncDaemon;
use crate::utils::ShutdownSignal;

pub async fn run(stores: Stores, shutdown: ShutdownSignal) -> Result<()> {
    tracing::info!(
        "Sync daemon starting (PID {}), health file {:?}",
        std::process::id(),
        crate::sync::DaemonHealth::path_for(&stores.config.state_path)
    );

    let daemon = SyncDaemon::new(
        stores.config,
        Arc::clone(&stores.source),
        Arc::clone(&stores.sink),
        Arc::clone(&stores.coordinator),
    );
    let result = daemon.run(shutdown).await;

    if let Err(e) = crate::daemon::cleanup() {
        tracing::warn!("Failed to clean up daemon PID file: {}", e);
    }
    result
}
