// ABOUTME: EventDispatcher - debounces change events into deduplicated sync batches
// ABOUTME: Flushes on an interval or size threshold, defers while a full sync owns the watermark

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::incremental::{IncrementalSyncEngine, SyncTarget};
use super::SyncResult;
use crate::error::SyncError;
use crate::model::{ChangeEvent, ChangeOperation};
use crate::source::ListenerSignal;
use crate::utils::ShutdownSignal;

/// Pending work is dropped in favour of a catch-up pull beyond this many
/// multiples of the flush threshold.
const PENDING_OVERFLOW_FACTOR: usize = 10;

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    operation: ChangeOperation,
    /// Earliest `occurred_at` seen for the entity in this window
    first_seen: DateTime<Utc>,
}

/// Turns the listener's event stream into batches for the incremental engine.
///
/// One batch runs at a time and ids within a batch are distinct; the engine
/// additionally serializes work per entity against other callers. The merged
/// operation travels with each id, but the engine's fetch decides whether the
/// entity is upserted or tombstoned.
///
/// While a catch-up pull is owed (after a subscription, or after pending
/// events overflowed), every flush first retries it. If it still cannot run,
/// the batch is synced without moving the watermark, so the gap stays covered
/// by the next pull.
pub struct EventDispatcher {
    engine: Arc<IncrementalSyncEngine>,
    interval: Duration,
    max_entities: usize,
    pending: HashMap<String, PendingChange>,
    catch_up_due: bool,
    deferred: bool,
    last_result: watch::Sender<Option<SyncResult>>,
}

impl EventDispatcher {
    pub fn new(engine: Arc<IncrementalSyncEngine>, interval: Duration, max_entities: usize) -> Self {
        let (last_result, _) = watch::channel(None);
        Self {
            engine,
            interval,
            max_entities: max_entities.max(1),
            pending: HashMap::new(),
            catch_up_due: false,
            deferred: false,
            last_result,
        }
    }

    /// Result of the most recent batch or catch-up.
    pub fn results(&self) -> watch::Receiver<Option<SyncResult>> {
        self.last_result.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Add an event to the pending set. The most severe operation wins and
    /// the earliest timestamp is kept.
    pub fn record(&mut self, event: ChangeEvent) {
        self.pending
            .entry(event.entity_id)
            .and_modify(|pending| {
                pending.operation = pending.operation.merge(event.operation);
                pending.first_seen = pending.first_seen.min(event.occurred_at);
            })
            .or_insert(PendingChange {
                operation: event.operation,
                first_seen: event.occurred_at,
            });

        let overflow = self.max_entities.saturating_mul(PENDING_OVERFLOW_FACTOR);
        if self.pending.len() > overflow {
            tracing::warn!(
                "{} entities pending while sync is deferred; dropping them in favour of a catch-up pull",
                self.pending.len()
            );
            self.pending.clear();
            self.catch_up_due = true;
        }
    }

    /// Consume listener signals until shutdown or until the listener goes away.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<ListenerSignal>,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    if !self.pending.is_empty() {
                        tracing::info!(
                            "Stopping dispatcher with {} pending entities; the next catch-up covers them",
                            self.pending.len()
                        );
                    }
                    return Ok(());
                }
                signal = signals.recv() => match signal {
                    Some(ListenerSignal::Event(event)) => {
                        self.record(event);
                        if self.pending.len() >= self.max_entities && !self.deferred {
                            self.flush().await;
                        }
                    }
                    Some(ListenerSignal::Subscribed { reconnect }) => {
                        tracing::info!(
                            "Listener {}; pulling changes since the watermark",
                            if reconnect { "reconnected" } else { "subscribed" }
                        );
                        self.catch_up_due = true;
                        self.catch_up().await;
                    }
                    None => {
                        tracing::info!("Listener stopped; flushing remaining events");
                        self.flush().await;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.deferred = false;
                    if !self.pending.is_empty() {
                        self.flush().await;
                    } else if self.catch_up_due {
                        self.catch_up().await;
                    }
                }
            }
        }
    }

    /// Hand the pending set to the engine as one batch.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if self.catch_up_due {
            self.catch_up().await;
        }

        let batch: Vec<SyncTarget> = self
            .pending
            .iter()
            .map(|(id, pending)| {
                SyncTarget::new(id.clone(), Some(pending.first_seen))
                    .with_operation(pending.operation)
            })
            .collect();
        let deletes = self
            .pending
            .values()
            .filter(|p| p.operation == ChangeOperation::Delete)
            .count();
        tracing::debug!("Flushing {} entities ({} deletes)", batch.len(), deletes);

        let synced = if self.catch_up_due {
            tracing::debug!("Catch-up still owed; syncing without advancing the watermark");
            self.engine.sync_targets_held(batch).await
        } else {
            self.engine.sync_targets(batch).await
        };
        match synced {
            Ok(result) => {
                let pending = std::mem::take(&mut self.pending);
                // Transient failures go around again; unmappable rows wait for reconciliation.
                for failed in result.failed.iter().filter(|f| f.kind == "transient_io") {
                    if let Some(change) = pending.get(&failed.entity_id) {
                        self.pending.insert(failed.entity_id.clone(), *change);
                    }
                }
                self.last_result.send_replace(Some(result));
            }
            Err(e) if is_mode_conflict(&e) => {
                tracing::debug!("Deferring {} entities: {}", self.pending.len(), e);
                self.deferred = true;
            }
            Err(e) => {
                tracing::error!("Sync batch of {} entities failed: {:#}", self.pending.len(), e);
                self.deferred = true;
            }
        }
    }

    async fn catch_up(&mut self) {
        match self.engine.catch_up().await {
            Ok(result) => {
                self.catch_up_due = false;
                self.last_result.send_replace(Some(result));
            }
            Err(e) if is_mode_conflict(&e) => {
                tracing::debug!("Deferring catch-up: {}", e);
            }
            Err(e) => {
                tracing::error!("Catch-up failed: {:#}", e);
            }
        }
    }
}

fn is_mode_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::ModeConflict(_))
    )
}
