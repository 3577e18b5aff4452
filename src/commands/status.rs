// ABOUTME: status and health commands
// ABOUTME: Watermark state, daemon liveness and persisted health, plus store connectivity checks

use anyhow::{bail, Result};

use super::Stores;
use crate::config::SyncConfig;
use crate::daemon;
use crate::sync::{with_timeout, DaemonHealth, WatermarkStore};
use crate::utils::strip_password_from_url;

/// Print the watermark, the in-progress mode and what the daemon last reported.
pub async fn status(config: &SyncConfig) -> Result<()> {
    let store = WatermarkStore::new(&config.state_path);
    let (state, initialized) = store.load_or_default().await?;

    println!("Sync status for table {}", config.table);
    println!("  State file:       {:?}", store.path());
    if initialized {
        println!("  Watermark:        {}", state.last_synced_at);
        println!("  State updated at: {}", state.updated_at);
    } else {
        println!("  Watermark:        not initialized (the next sync runs a full sync)");
    }
    match (state.in_progress_mode, state.owner_pid) {
        (Some(mode), Some(pid)) if daemon::is_process_running(pid as i32) => {
            println!("  In progress:      {} (PID {})", mode.as_str(), pid)
        }
        (Some(mode), _) => println!(
            "  In progress:      {} (interrupted; it is re-run on the next start)",
            mode.as_str()
        ),
        (None, _) => println!("  In progress:      none"),
    }
    if config.track_entity_versions {
        println!("  Tracked versions: {}", state.entity_versions.len());
    }
    if let Some(floor) = state.failure_floor() {
        println!(
            "  Unresolved:       {} entities (watermark held below {})",
            state.unresolved.len(),
            floor
        );
    }

    print_daemon(config).await
}

/// Ping both stores and report daemon status. Fails when a store is unreachable.
pub async fn health(stores: &Stores) -> Result<()> {
    let timeout = stores.config.fetch_timeout;
    let mut unreachable = Vec::new();

    println!("Store connectivity");
    let source_url = strip_password_from_url(&stores.config.postgres_url);
    match with_timeout(timeout, stores.source.ping()).await {
        Ok(()) => println!("  PostgreSQL  {}  ok", source_url),
        Err(e) => {
            println!("  PostgreSQL  {}  UNREACHABLE: {}", source_url, e);
            unreachable.push("PostgreSQL");
        }
    }
    let sink_url = strip_password_from_url(&stores.config.clickhouse.url);
    match with_timeout(timeout, stores.sink.ping()).await {
        Ok(()) => println!("  ClickHouse  {}  ok", sink_url),
        Err(e) => {
            println!("  ClickHouse  {}  UNREACHABLE: {}", sink_url, e);
            unreachable.push("ClickHouse");
        }
    }

    print_daemon(&stores.config).await?;

    if !unreachable.is_empty() {
        bail!("Unreachable: {}", unreachable.join(", "));
    }
    Ok(())
}

async fn print_daemon(config: &SyncConfig) -> Result<()> {
    println!();
    let status = daemon::check_status()?;
    match (status.running, status.pid) {
        (true, Some(pid)) => println!("Daemon: running (PID {})", pid),
        (false, Some(pid)) => println!("Daemon: not running (stale PID file for {})", pid),
        _ => println!("Daemon: not running"),
    }

    let health_path = DaemonHealth::path_for(&config.state_path);
    let Some(health) = DaemonHealth::load(&health_path).await? else {
        println!("  No health report at {:?}", health_path);
        return Ok(());
    };

    println!("  Health:          {}", health.state.as_str());
    println!("  Reported at:     {} (PID {})", health.updated_at, health.pid);
    println!("  Started at:      {}", health.started_at);
    println!(
        "  Listener:        {} ({} consecutive failures, {} events, {} malformed)",
        if health.listener.connected {
            "connected"
        } else {
            "disconnected"
        },
        health.listener.consecutive_failures,
        health.listener.events_received,
        health.listener.malformed_discarded
    );
    if let Some(err) = &health.listener.last_error {
        println!("  Listener error:  {}", err);
    }
    if let Some(watermark) = health.watermark {
        println!("  Watermark:       {}", watermark);
    }
    if let Some(batch) = &health.last_batch {
        println!("  Last batch:      {}", batch);
    }
    if let Some(reconcile) = &health.last_reconcile {
        println!(
            "  Last reconcile:  {} ({} missing, {} stale, {} extra)",
            reconcile.at, reconcile.missing, reconcile.stale, reconcile.extra
        );
    }
    if let Some(err) = &health.last_error {
        println!("  Last error:      {}", err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::source::MemorySource;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_status_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            state_path: dir.path().join("watermark.json"),
            ..SyncConfig::default()
        };
        status(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_fails_when_sink_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            state_path: dir.path().join("watermark.json"),
            ..SyncConfig::default()
        };
        let sink = Arc::new(MemorySink::new());
        let stores = Stores::with_stores(config, Arc::new(MemorySource::new()), sink.clone())
            .await
            .unwrap();

        health(&stores).await.unwrap();
        sink.set_unavailable(true);
        let err = health(&stores).await.unwrap_err();
        assert!(err.to_string().contains("ClickHouse"));
    }
}
