// ABOUTME: ChangeListener - LISTEN on the change channel and decode notifications
// ABOUTME: Reconnects with capped exponential backoff and signals every (re)subscription

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls};

use super::postgres::{parse_config, tls_connector};
use crate::model::{decode_notification, ChangeEvent};
use crate::utils::{
    quote_ident, strip_password_from_url, validate_identifier, BackoffPolicy, ShutdownSignal,
};

/// What the listener hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSignal {
    /// A decoded change notification.
    Event(ChangeEvent),
    /// LISTEN succeeded. Notifications sent while unsubscribed are lost, so
    /// the receiver must pull changes since the watermark.
    Subscribed { reconnect: bool },
}

/// Live view of the listener's connection health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub connected: bool,
    pub consecutive_failures: u32,
    /// Set once reconnect attempts reach the retry ceiling. The listener keeps retrying.
    pub degraded: bool,
    pub events_received: u64,
    pub malformed_discarded: u64,
    pub last_error: Option<String>,
}

enum SessionEnd {
    /// The dispatcher went away; stop listening.
    ReceiverClosed,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Subscribes to the transactional store's change channel.
pub struct ChangeListener {
    url: String,
    channel: String,
    backoff: BackoffPolicy,
    retry_ceiling: u32,
    keepalive: Duration,
    status: watch::Sender<ListenerStatus>,
}

impl ChangeListener {
    pub fn new(
        url: &str,
        channel: &str,
        backoff: BackoffPolicy,
        retry_ceiling: u32,
        keepalive: Duration,
    ) -> Result<Self> {
        validate_identifier(channel).context("Invalid notification channel")?;
        parse_config(url)?;
        let (status, _) = watch::channel(ListenerStatus::default());
        Ok(Self {
            url: url.to_string(),
            channel: channel.to_string(),
            backoff,
            retry_ceiling,
            keepalive,
            status,
        })
    }

    pub fn status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    /// Listen until shutdown or until the receiving side is dropped.
    ///
    /// Connection failures never end this loop; they are retried with the
    /// configured backoff.
    pub async fn run(
        &self,
        tx: mpsc::Sender<ListenerSignal>,
        mut shutdown: ShutdownSignal,
    ) -> Result<()> {
        let mut failures = 0u32;
        let mut ever_subscribed = false;

        tracing::info!(
            "Starting change listener on channel '{}' ({})",
            self.channel,
            strip_password_from_url(&self.url)
        );

        loop {
            let mut subscribed = false;
            let outcome = tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    tracing::info!("Shutdown signal received, stopping change listener");
                    return Ok(());
                }
                outcome = self.session(&tx, ever_subscribed, &mut subscribed) => outcome,
            };

            if subscribed {
                ever_subscribed = true;
                failures = 0;
            }

            let error = match outcome {
                Ok(SessionEnd::ReceiverClosed) => {
                    tracing::info!("Change receiver closed, stopping listener");
                    return Ok(());
                }
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            let degraded = failures >= self.retry_ceiling;
            self.status.send_modify(|status| {
                status.connected = false;
                status.consecutive_failures = failures;
                status.degraded = degraded;
                status.last_error = Some(format!("{:#}", error));
            });

            let delay = self.backoff.delay(failures - 1);
            if degraded {
                tracing::error!(
                    "Change listener still disconnected after {} attempts: {:#}. Retrying in {:?}",
                    failures,
                    error,
                    delay
                );
            } else {
                tracing::warn!(
                    "Change listener disconnected (attempt {}): {:#}. Retrying in {:?}",
                    failures,
                    error,
                    delay
                );
            }

            tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    tracing::info!("Shutdown signal received, stopping change listener");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<ListenerSignal>,
        reconnect: bool,
        subscribed: &mut bool,
    ) -> Result<SessionEnd> {
        let config = parse_config(&self.url)?;
        match config.get_ssl_mode() {
            SslMode::Disable => {
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .context("Failed to connect listener")?;
                self.listen(client, connection, tx, reconnect, subscribed).await
            }
            _ => {
                let (client, connection) = config
                    .connect(tls_connector()?)
                    .await
                    .context("Failed to connect listener")?;
                self.listen(client, connection, tx, reconnect, subscribed).await
            }
        }
    }

    async fn listen<S, T>(
        &self,
        client: Client,
        mut connection: Connection<S, T>,
        tx: &mpsc::Sender<ListenerSignal>,
        reconnect: bool,
        subscribed: &mut bool,
    ) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // The connection must be polled for notifications to surface; the
        // driver task forwards their payloads and also services our queries.
        let (payload_tx, mut payload_rx) = mpsc::unbounded_channel::<String>();
        let _driver = AbortOnDrop(tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if payload_tx.send(notification.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!("Listener notice: {}", notice);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Listener connection error: {}", e);
                        break;
                    }
                }
            }
        }));

        client
            .batch_execute(&format!("LISTEN {}", quote_ident(&self.channel)))
            .await
            .with_context(|| format!("Failed to LISTEN on '{}'", self.channel))?;

        *subscribed = true;
        self.status.send_modify(|status| {
            status.connected = true;
            status.consecutive_failures = 0;
            status.degraded = false;
            status.last_error = None;
        });
        if reconnect {
            tracing::info!("Change listener resubscribed to '{}'", self.channel);
        } else {
            tracing::info!("Change listener subscribed to '{}'", self.channel);
        }

        if tx.send(ListenerSignal::Subscribed { reconnect }).await.is_err() {
            return Ok(SessionEnd::ReceiverClosed);
        }

        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                payload = payload_rx.recv() => {
                    let Some(payload) = payload else {
                        bail!("notification stream ended");
                    };
                    match decode_notification(&payload) {
                        Ok(event) => {
                            self.status.send_modify(|status| status.events_received += 1);
                            tracing::debug!(
                                "Change event {} {} at {}",
                                event.operation.as_str(),
                                event.entity_id,
                                event.occurred_at
                            );
                            if tx.send(ListenerSignal::Event(event)).await.is_err() {
                                return Ok(SessionEnd::ReceiverClosed);
                            }
                        }
                        Err(e) => {
                            self.status.send_modify(|status| status.malformed_discarded += 1);
                            tracing::warn!("Discarding change notification: {}", e);
                        }
                    }
                }
                _ = keepalive.tick() => {
                    client
                        .simple_query("SELECT 1")
                        .await
                        .context("Listener keepalive failed")?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_channel() {
        let backoff = BackoffPolicy::default();
        let url = "postgresql://app@localhost/projects";
        assert!(ChangeListener::new(url, "project_changes", backoff, 3, Duration::from_secs(30)).is_ok());
        assert!(ChangeListener::new(url, "bad channel", backoff, 3, Duration::from_secs(30)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_but_keeps_retrying() {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(10),
        };
        // Port 1 on loopback refuses connections immediately.
        let listener = ChangeListener::new(
            "postgresql://app@127.0.0.1:1/projects?connect_timeout=1",
            "project_changes",
            backoff,
            2,
            Duration::from_secs(30),
        )
        .unwrap();
        let mut status = listener.status();
        let (tx, _rx) = mpsc::channel(8);
        let (trigger, shutdown) = ShutdownSignal::new();

        let run = listener.run(tx, shutdown);
        let watch = async {
            loop {
                status.changed().await.unwrap();
                if status.borrow().consecutive_failures >= 3 {
                    break;
                }
            }
            let current = status.borrow().clone();
            trigger.trigger();
            current
        };

        let (result, current) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(run, watch)
        })
        .await
        .unwrap();
        assert!(result.is_ok());
        assert!(current.degraded);
        assert!(!current.connected);
        assert!(current.last_error.is_some());
    }
}
