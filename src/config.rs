// ABOUTME: SyncConfig - settings for stores, batching, timeouts and scheduling
// ABOUTME: Loaded from an optional TOML file, then overridden by CLI flags and env vars

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{validate_identifier, BackoffPolicy};

/// Connection settings for the ClickHouse HTTP interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://localhost:8123`
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            user: "default".to_string(),
            password: String::new(),
            database: "default".to_string(),
        }
    }
}

/// Configuration shared by the CLI commands and the daemon.
///
/// Durations are written in the TOML file as (fractional) seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// PostgreSQL connection URL. `sslmode=require` enables TLS.
    pub postgres_url: String,
    pub clickhouse: ClickHouseConfig,
    /// Source table, also the analytical table name
    pub table: String,
    /// LISTEN/NOTIFY channel carrying change notifications
    pub channel: String,
    /// Rows per page for full sync, catch-up and reconciliation scans
    pub page_size: usize,
    /// Maximum entities synced concurrently
    pub worker_count: usize,
    /// Dispatcher debounce window
    #[serde(with = "secs")]
    pub batch_interval: Duration,
    /// Pending-set size that forces an early flush
    pub batch_max_entities: usize,
    #[serde(with = "secs")]
    pub fetch_timeout: Duration,
    #[serde(with = "secs")]
    pub write_timeout: Duration,
    /// Interval between reconciliation passes in the daemon. None disables them.
    #[serde(with = "opt_secs")]
    pub reconcile_interval: Option<Duration>,
    /// Rows changed within this lag of "now" are left out of reconciliation
    #[serde(with = "secs")]
    pub snapshot_lag: Duration,
    #[serde(with = "secs")]
    pub listener_backoff_initial: Duration,
    #[serde(with = "secs")]
    pub listener_backoff_max: Duration,
    /// Consecutive reconnect failures after which health reports Degraded
    pub listener_retry_ceiling: u32,
    /// Idle interval after which the listener checks its connection
    #[serde(with = "secs")]
    pub listener_keepalive: Duration,
    /// Watermark state file
    pub state_path: PathBuf,
    /// Keep the per-entity version cache used by quick reconciliation
    pub track_entity_versions: bool,
    /// Run `OPTIMIZE TABLE ... FINAL` after every successful batch
    pub optimize_after_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            postgres_url: String::new(),
            clickhouse: ClickHouseConfig::default(),
            table: "project_investasi".to_string(),
            channel: "project_changes".to_string(),
            page_size: 1000,
            worker_count: 8,
            batch_interval: Duration::from_secs(1),
            batch_max_entities: 500,
            fetch_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            reconcile_interval: Some(Duration::from_secs(3600)),
            snapshot_lag: Duration::from_secs(5),
            listener_backoff_initial: Duration::from_secs(1),
            listener_backoff_max: Duration::from_secs(30),
            listener_retry_ceiling: 30,
            listener_keepalive: Duration::from_secs(30),
            state_path: PathBuf::from(".project-sync/watermark.json"),
            track_entity_versions: true,
            optimize_after_sync: false,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// Synchronous: the CLI reads it before the runtime starts.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Reject settings the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table).context("Invalid table name")?;
        validate_identifier(&self.channel).context("Invalid notification channel name")?;
        validate_identifier(&self.clickhouse.database).context("Invalid ClickHouse database name")?;

        if self.page_size == 0 {
            bail!("page_size must be greater than zero");
        }
        if self.worker_count == 0 {
            bail!("worker_count must be greater than zero");
        }
        if self.batch_max_entities == 0 {
            bail!("batch_max_entities must be greater than zero");
        }
        for (name, value) in [
            ("batch_interval", self.batch_interval),
            ("fetch_timeout", self.fetch_timeout),
            ("write_timeout", self.write_timeout),
            ("listener_backoff_initial", self.listener_backoff_initial),
            ("listener_keepalive", self.listener_keepalive),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.listener_backoff_max < self.listener_backoff_initial {
            bail!("listener_backoff_max must not be smaller than listener_backoff_initial");
        }
        if matches!(self.reconcile_interval, Some(d) if d.is_zero()) {
            bail!("reconcile_interval must be greater than zero (omit it to disable reconciliation)");
        }
        Ok(())
    }

    pub fn listener_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.listener_backoff_initial,
            max: self.listener_backoff_max,
        }
    }

    pub fn require_postgres_url(&self) -> Result<&str> {
        if self.postgres_url.trim().is_empty() {
            bail!("No PostgreSQL URL configured. Set POSTGRES_URL, --postgres-url or postgres_url in the config file");
        }
        Ok(&self.postgres_url)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.table, "project_investasi");
        assert_eq!(config.channel, "project_changes");
        assert_eq!(config.reconcile_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.listener_backoff().delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml(
            r#"
            postgres_url = "postgresql://app@db/projects"
            worker_count = 4
            batch_interval = 0.25

            [clickhouse]
            url = "http://ch:8123"
            database = "analytics"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.batch_interval, Duration::from_millis(250));
        assert_eq!(config.clickhouse.database, "analytics");
        assert_eq!(config.clickhouse.user, "default");
        assert_eq!(config.page_size, 1000);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(SyncConfig::from_toml("workers = 3").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = SyncConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.worker_count = 2;
        config.table = "projects; DROP TABLE x".into();
        assert!(config.validate().is_err());

        config.table = "project_investasi".into();
        config.listener_backoff_max = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_require_postgres_url() {
        let config = SyncConfig::default();
        assert!(config.require_postgres_url().is_err());
    }

    #[test]
    fn test_load_reads_file_and_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "page_size = 50\nreconcile_interval = 600\n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.reconcile_interval, Some(Duration::from_secs(600)));

        let err = SyncConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.toml"));
    }
}
