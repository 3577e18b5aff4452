// ABOUTME: PostgreSQL implementation of the transactional store contract
// ABOUTME: Connection helpers (TLS by sslmode) and typed reads of the project table

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Config, NoTls, Row};

use super::{ChangeCursor, SourceStore};
use crate::error::{StoreResult, SyncError};
use crate::model::{col, SeriesKind, SourceRow, Version, MONTHS};
use crate::utils::{quote_ident, retry_with_backoff, strip_password_from_url, validate_identifier};

/// Build the TLS connector used when the URL asks for `sslmode=prefer|require`.
pub fn tls_connector() -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Parse a connection URL, keeping the password out of error messages.
pub fn parse_config(url: &str) -> Result<Config> {
    url.parse::<Config>()
        .with_context(|| format!("Invalid PostgreSQL URL: {}", strip_password_from_url(url)))
}

/// Open a client connection and drive it on a background task.
///
/// The session time zone is pinned to UTC so `timestamp` columns compare
/// consistently against the watermark.
pub async fn connect(url: &str) -> Result<Client> {
    let config = parse_config(url)?;
    let display = strip_password_from_url(url);

    let client = match config.get_ssl_mode() {
        SslMode::Disable => {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .with_context(|| format!("Failed to connect to {}", display))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        }
        _ => {
            let (client, connection) = config
                .connect(tls_connector()?)
                .await
                .with_context(|| format!("Failed to connect to {}", display))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        }
    };

    client
        .batch_execute("SET TIME ZONE 'UTC'")
        .await
        .context("Failed to set session time zone")?;
    Ok(client)
}

/// Connect with up to three retries (1s, 2s, 4s).
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

/// Reads project rows from PostgreSQL.
///
/// The client is opened lazily and replaced when the connection closes, so a
/// long-running daemon survives database restarts.
pub struct PgSource {
    url: String,
    table: String,
    select_list: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PgSource {
    pub fn new(url: &str, table: &str) -> Result<Self> {
        validate_identifier(table).context("Invalid source table name")?;
        parse_config(url)?;
        Ok(Self {
            url: url.to_string(),
            table: quote_ident(table),
            select_list: select_list(),
            client: Mutex::new(None),
        })
    }

    async fn client(&self) -> StoreResult<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::warn!("Source connection closed, reconnecting");
        }
        let client = connect(&self.url)
            .await
            .map_err(|e| SyncError::TransientIo(format!("{:#}", e)))?;
        let client = Arc::new(client);
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> StoreResult<Vec<Row>> {
        let client = self.client().await?;
        Ok(client.query(sql, params).await?)
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn fetch(&self, entity_id: &str) -> StoreResult<SourceRow> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = $1",
            self.select_list,
            self.table,
            quote_ident(col::ID)
        );
        let rows = self.query(&sql, &[&entity_id]).await?;
        match rows.first() {
            Some(row) => decode_row(row),
            None => Err(SyncError::NotFound(entity_id.to_string())),
        }
    }

    async fn scan_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<SourceRow>> {
        let id = quote_ident(col::ID);
        let sql = format!(
            "SELECT {} FROM {} WHERE ($1::text IS NULL OR {id} > $1) ORDER BY {id} LIMIT $2",
            self.select_list,
            self.table,
            id = id
        );
        let rows = self.query(&sql, &[&after, &(limit as i64)]).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn changed_since(
        &self,
        cursor: &ChangeCursor,
        limit: usize,
    ) -> StoreResult<Vec<SourceRow>> {
        let sql = format!(
            "SELECT {} FROM {} \
             WHERE {ts} > $1 OR ({ts} = $1 AND $2::text IS NOT NULL AND {id} > $2) \
             ORDER BY {ts}, {id} \
             LIMIT $3",
            self.select_list,
            self.table,
            ts = quote_ident(col::UPDATED_AT),
            id = quote_ident(col::ID)
        );
        let rows = self
            .query(
                &sql,
                &[&cursor.updated_at, &cursor.entity_id, &(limit as i64)],
            )
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn versions(&self) -> StoreResult<BTreeMap<String, Version>> {
        let sql = format!(
            "SELECT {}::text, {}::timestamptz FROM {}",
            quote_ident(col::ID),
            quote_ident(col::UPDATED_AT),
            self.table
        );
        let rows = self.query(&sql, &[]).await?;
        let mut versions = BTreeMap::new();
        for row in &rows {
            let id: String = get(row, 0usize)?;
            let updated_at: DateTime<Utc> = get(row, 1usize)?;
            versions.insert(id, Version::from_timestamp(updated_at));
        }
        Ok(versions)
    }

    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        let rows = self.query("SELECT now()", &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| SyncError::Storage("SELECT now() returned no row".into()))?;
        get(row, 0usize)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.query("SELECT 1", &[]).await?;
        Ok(())
    }
}

/// Source columns with the PostgreSQL type each is cast to when selected,
/// so decoding never depends on the exact declared type (varchar vs text,
/// numeric precision, timestamp flavor).
pub fn column_types() -> Vec<(String, &'static str)> {
    let mut columns: Vec<(String, &'static str)> = vec![
        (col::ID.into(), "text"),
        (col::REGION.into(), "text"),
        (col::TERMINAL.into(), "text"),
        (col::INVESTMENT_ID.into(), "text"),
        (col::PROJECT_DEFINITION.into(), "text"),
        (col::ASSET_CATEGORY.into(), "text"),
        (col::INVESTMENT_TYPE.into(), "text"),
        (col::PROPOSAL_YEAR.into(), "int4"),
        (col::BUDGET_YEAR.into(), "int4"),
        (col::INVESTMENT_STATUS.into(), "text"),
        (col::PROGRESS_DESCRIPTION.into(), "text"),
        (col::ISSUE_CATEGORY.into(), "text"),
        (col::ISSUE_DESCRIPTION.into(), "text"),
        (col::ACTION_TARGET.into(), "text"),
        (col::HEAD_OFFICE_SUPPORT.into(), "text"),
        (col::PIC.into(), "text"),
        (col::ISSUE_STATUS.into(), "text"),
        (col::FUNDING_NEED.into(), "numeric"),
        (col::PLANNED_TOTAL.into(), "numeric"),
    ];
    for kind in SeriesKind::ALL {
        columns.extend(kind.columns().into_iter().map(|c| (c, "numeric")));
    }
    columns.extend([
        (col::CONTRACT_TITLE.into(), "text"),
        (col::CONTRACT_VALUE.into(), "numeric"),
        (col::ABSORBED_PRIOR_YEARS.into(), "numeric"),
        (col::VENDOR.into(), "text"),
        (col::CONTRACT_NUMBER.into(), "text"),
        (col::SIGNED_ON.into(), "date"),
        (col::STARTS_ON.into(), "date"),
        (col::DURATION.into(), "int4"),
        (col::DURATION_UNIT.into(), "text"),
        (col::ENDS_ON.into(), "date"),
        (col::LATITUDE.into(), "float8"),
        (col::LONGITUDE.into(), "float8"),
        (col::METADATA.into(), "jsonb"),
        (col::CREATED_AT.into(), "timestamptz"),
        (col::UPDATED_AT.into(), "timestamptz"),
    ]);
    columns
}

fn select_list() -> String {
    column_types()
        .iter()
        .map(|(column, cast)| {
            let quoted = quote_ident(column);
            format!("{}::{} AS {}", quoted, cast, quoted)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn get<'a, T: FromSql<'a>, I>(row: &'a Row, index: I) -> StoreResult<T>
where
    I: tokio_postgres::row::RowIndex + std::fmt::Display,
{
    let label = index.to_string();
    row.try_get(index)
        .map_err(|e| SyncError::Storage(format!("failed to decode column {}: {}", label, e)))
}

fn decode_row(row: &Row) -> StoreResult<SourceRow> {
    let updated_at: Option<DateTime<Utc>> = get(row, col::UPDATED_AT)?;
    let entity_id: String = get(row, col::ID)?;
    let updated_at = updated_at
        .ok_or_else(|| SyncError::unmappable(col::UPDATED_AT, format!("NULL for {}", entity_id)))?;

    let mut source = SourceRow {
        entity_id,
        region: get(row, col::REGION)?,
        terminal: get(row, col::TERMINAL)?,
        investment_id: get(row, col::INVESTMENT_ID)?,
        project_definition: get(row, col::PROJECT_DEFINITION)?,
        asset_category: get(row, col::ASSET_CATEGORY)?,
        investment_type: get(row, col::INVESTMENT_TYPE)?,
        proposal_year: get(row, col::PROPOSAL_YEAR)?,
        budget_year: get(row, col::BUDGET_YEAR)?,
        investment_status: get(row, col::INVESTMENT_STATUS)?,
        progress_description: get(row, col::PROGRESS_DESCRIPTION)?,
        issue_category: get(row, col::ISSUE_CATEGORY)?,
        issue_description: get(row, col::ISSUE_DESCRIPTION)?,
        action_target: get(row, col::ACTION_TARGET)?,
        head_office_support: get(row, col::HEAD_OFFICE_SUPPORT)?,
        pic: get(row, col::PIC)?,
        issue_status: get(row, col::ISSUE_STATUS)?,
        funding_need: get(row, col::FUNDING_NEED)?,
        planned_total: get(row, col::PLANNED_TOTAL)?,
        contract_title: get(row, col::CONTRACT_TITLE)?,
        contract_value: get(row, col::CONTRACT_VALUE)?,
        absorbed_prior_years: get(row, col::ABSORBED_PRIOR_YEARS)?,
        vendor: get(row, col::VENDOR)?,
        contract_number: get(row, col::CONTRACT_NUMBER)?,
        signed_on: get(row, col::SIGNED_ON)?,
        starts_on: get(row, col::STARTS_ON)?,
        duration: get(row, col::DURATION)?,
        duration_unit: get(row, col::DURATION_UNIT)?,
        ends_on: get(row, col::ENDS_ON)?,
        latitude: get(row, col::LATITUDE)?,
        longitude: get(row, col::LONGITUDE)?,
        metadata: get(row, col::METADATA)?,
        created_at: get(row, col::CREATED_AT)?,
        updated_at,
        ..Default::default()
    };

    for kind in SeriesKind::ALL {
        for month in 0..MONTHS {
            let column = kind.column(month);
            source.series_mut(kind)[month] = get(row, column.as_str())?;
        }
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_list_casts_every_column() {
        let list = select_list();
        assert!(list.starts_with("\"id_root\"::text AS \"id_root\""));
        assert!(list.contains("\"rkap_januari\"::numeric AS \"rkap_januari\""));
        assert!(list.contains("\"prognosa_sd_desember\"::numeric"));
        assert!(list.contains("\"metadata\"::jsonb"));
        assert!(list.ends_with("\"updated_at\"::timestamptz AS \"updated_at\""));
        // identity + classification + money + 36 monthly + contract + geo + audit
        assert_eq!(column_types().len(), 19 + 3 * MONTHS + 15);
    }

    #[test]
    fn test_new_rejects_bad_table_name() {
        assert!(PgSource::new("postgresql://u@localhost/db", "bad-name").is_err());
        assert!(PgSource::new("postgresql://u@localhost/db", "project_investasi").is_ok());
    }
}
