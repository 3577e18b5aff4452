// ABOUTME: SyncDaemon - long-running change capture, batching and periodic reconciliation
// ABOUTME: Bootstraps with a full sync when needed and persists its health for the CLI

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::coordinator::SyncCoordinator;
use super::dispatcher::EventDispatcher;
use super::full::FullSyncEngine;
use super::health::{DaemonHealth, ReconcileSummary};
use super::incremental::IncrementalSyncEngine;
use super::reconciler::{ReconcileMode, ReconciliationEngine};
use super::{EngineSettings, SyncResult};
use crate::config::SyncConfig;
use crate::sink::SinkStore;
use crate::source::{ChangeListener, ListenerSignal, ListenerStatus, SourceStore};
use crate::utils::ShutdownSignal;

/// How often the daemon rewrites its health file.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the listener-to-dispatcher channel.
const SIGNAL_BUFFER: usize = 4096;

/// Runs the listener, the dispatcher and periodic reconciliation until shutdown.
pub struct SyncDaemon {
    config: SyncConfig,
    source: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkStore>,
    coordinator: Arc<SyncCoordinator>,
    health_path: PathBuf,
}

impl SyncDaemon {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkStore>,
        coordinator: Arc<SyncCoordinator>,
    ) -> Self {
        let health_path = DaemonHealth::path_for(&config.state_path);
        Self {
            config,
            source,
            sink,
            coordinator,
            health_path,
        }
    }

    pub fn health_path(&self) -> &PathBuf {
        &self.health_path
    }

    fn settings(&self) -> EngineSettings {
        EngineSettings::from(&self.config)
    }

    /// Bring the sink up to date before listening: a full sync on first run
    /// or after an interrupted one, then a catch-up pull from the watermark.
    pub async fn bootstrap(&self, shutdown: &ShutdownSignal) -> Result<SyncResult> {
        let mut result = SyncResult::default();

        let needs_full = if !self.coordinator.is_initialized() {
            tracing::info!("No watermark yet; bootstrapping with a full sync");
            true
        } else if self.coordinator.interrupted_full_sync().await? {
            tracing::warn!("Previous full sync did not complete; running it again");
            true
        } else {
            false
        };

        if needs_full {
            let full = FullSyncEngine::new(
                Arc::clone(&self.source),
                Arc::clone(&self.sink),
                Arc::clone(&self.coordinator),
                self.settings(),
            )
            .with_shutdown(shutdown.clone());
            result.merge(full.full_sync().await?);
        }

        let incremental = self.incremental(shutdown);
        result.merge(incremental.catch_up().await?);
        Ok(result)
    }

    /// Run against the configured PostgreSQL change channel.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let listener = ChangeListener::new(
            self.config.require_postgres_url()?,
            &self.config.channel,
            self.config.listener_backoff(),
            self.config.listener_retry_ceiling,
            self.config.listener_keepalive,
        )?;
        let status = listener.status();
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);

        let listener_shutdown = shutdown.clone();
        let listener_task =
            tokio::spawn(async move { listener.run(tx, listener_shutdown).await });

        let result = self.run_with_signals(rx, status, shutdown).await;

        match listener_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Change listener stopped with an error: {:#}", e),
            Err(e) => tracing::error!("Change listener task panicked: {}", e),
        }
        result
    }

    /// Run with listener signals supplied by the caller.
    pub async fn run_with_signals(
        &self,
        signals: mpsc::Receiver<ListenerSignal>,
        mut listener_status: watch::Receiver<ListenerStatus>,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        let mut health = DaemonHealth::new();

        tracing::info!(
            "Starting sync daemon: table={}, channel={}, reconcile_interval={:?}",
            self.config.table,
            self.config.channel,
            self.config.reconcile_interval
        );

        self.sink
            .ensure_schema()
            .await
            .context("Failed to ensure analytical schema")?;

        match self.bootstrap(&shutdown).await {
            Ok(result) => {
                tracing::info!("Startup sync complete: {}", result);
                health.last_batch = Some(result);
            }
            Err(e) if shutdown.is_triggered() => {
                tracing::info!("Shutdown during startup sync: {:#}", e);
                return Ok(());
            }
            Err(e) => {
                // The dispatcher retries the catch-up on the listener's first subscription.
                tracing::error!("Startup sync failed: {:#}", e);
                health.last_error = Some(format!("{:#}", e));
            }
        }

        let incremental = Arc::new(self.incremental(&shutdown));
        let reconciler = ReconciliationEngine::new(
            Arc::clone(&self.source),
            Arc::clone(&self.sink),
            Arc::clone(&incremental),
            self.settings(),
        );

        let dispatcher = EventDispatcher::new(
            Arc::clone(&incremental),
            self.config.batch_interval,
            self.config.batch_max_entities,
        );
        let mut batches = dispatcher.results();
        let dispatcher_task = tokio::spawn(dispatcher.run(signals, shutdown.clone()));

        let mut health_tick = interval(HEALTH_INTERVAL);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile_tick = self.config.reconcile_interval.map(|every| {
            let mut tick = interval_at(Instant::now() + every, every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });
        let mut reconcile_cycles = 0u64;
        let mut listener_open = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.triggered() => {
                    tracing::info!("Shutdown signal received, stopping sync daemon");
                    break;
                }
                changed = batches.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Dispatcher stopped; shutting down sync daemon");
                        break;
                    }
                    let last = batches.borrow_and_update().clone();
                    if let Some(result) = last {
                        health.last_error = None;
                        health.last_batch = Some(result);
                    }
                }
                changed = listener_status.changed(), if listener_open => {
                    if changed.is_err() {
                        listener_open = false;
                        continue;
                    }
                    let status = listener_status.borrow_and_update().clone();
                    if status.degraded && !health.listener.degraded {
                        tracing::error!(
                            "Change listener degraded after {} failed attempts; relying on reconciliation",
                            status.consecutive_failures
                        );
                    }
                    health.listener = status;
                }
                _ = async {
                    match reconcile_tick.as_mut() {
                        Some(tick) => tick.tick().await,
                        None => std::future::pending::<Instant>().await,
                    }
                } => {
                    reconcile_cycles += 1;
                    tracing::info!("Starting reconciliation cycle {}", reconcile_cycles);
                    match self.reconcile_and_repair(&reconciler).await {
                        Ok(summary) => health.last_reconcile = Some(summary),
                        Err(e) => {
                            tracing::error!("Reconciliation cycle {} failed: {:#}", reconcile_cycles, e);
                        }
                    }
                }
                _ = health_tick.tick() => {
                    self.write_health(&mut health).await;
                }
            }
        }

        match dispatcher_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Dispatcher stopped with an error: {:#}", e),
            Err(e) => tracing::error!("Dispatcher task panicked: {}", e),
        }
        self.write_health(&mut health).await;
        tracing::info!("Sync daemon stopped");
        Ok(())
    }

    async fn reconcile_and_repair(
        &self,
        reconciler: &ReconciliationEngine,
    ) -> Result<ReconcileSummary> {
        let report = reconciler.reconcile(ReconcileMode::Checksum).await?;
        let repaired = if report.has_drift() {
            Some(reconciler.repair(&report).await?)
        } else {
            None
        };
        Ok(ReconcileSummary::new(&report, repaired))
    }

    async fn write_health(&self, health: &mut DaemonHealth) {
        match self.coordinator.watermark().await {
            Ok(watermark) => health.watermark = Some(watermark),
            Err(e) => tracing::warn!("Failed to read watermark for health: {:#}", e),
        }
        health.evaluate();
        if let Err(e) = health.save(&self.health_path).await {
            tracing::warn!("Failed to write daemon health: {:#}", e);
        }
    }

    fn incremental(&self, shutdown: &ShutdownSignal) -> IncrementalSyncEngine {
        IncrementalSyncEngine::new(
            Arc::clone(&self.source),
            Arc::clone(&self.sink),
            Arc::clone(&self.coordinator),
            self.settings(),
        )
        .with_shutdown(shutdown.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeEvent, ChangeOperation, SourceRow};
    use crate::sink::MemorySink;
    use crate::source::MemorySource;
    use crate::sync::health::HealthState;
    use crate::sync::state::WatermarkStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_daemon_bootstraps_then_follows_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            state_path: dir.path().join("watermark.json"),
            batch_interval: Duration::from_millis(10),
            reconcile_interval: None,
            ..SyncConfig::default()
        };
        let t0 = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let source = Arc::new(MemorySource::with_rows([SourceRow::new("A", t0)]));
        let sink = Arc::new(MemorySink::new());
        let coordinator = Arc::new(
            SyncCoordinator::open(WatermarkStore::new(&config.state_path), true)
                .await
                .unwrap(),
        );
        let daemon = SyncDaemon::new(config, source.clone(), sink.clone(), coordinator);

        let (tx, rx) = mpsc::channel(16);
        let (_status_tx, status_rx) = watch::channel(ListenerStatus::default());
        let (trigger, shutdown) = ShutdownSignal::new();

        let driver = async {
            // Bootstrap loads A.
            while sink.get("A").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let t1 = t0 + chrono::Duration::seconds(1);
            source.put(SourceRow::new("B", t1));
            tx.send(ListenerSignal::Event(ChangeEvent::new(
                ChangeOperation::Insert,
                "B",
                t1,
            )))
            .await
            .unwrap();
            while sink.get("B").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.trigger();
        };

        let (result, ()) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(daemon.run_with_signals(rx, status_rx, shutdown), driver) },
        )
        .await
        .unwrap();
        result.unwrap();

        let health = DaemonHealth::load(daemon.health_path()).await.unwrap().unwrap();
        assert_eq!(health.state, HealthState::Healthy);
        assert!(health.watermark.is_some());
    }
}
