// ABOUTME: ClickHouse implementation of the analytical store over its HTTP interface
// ABOUTME: JSONEachRow row codec, query parameters, and version-checked writes

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::schema;
use super::{RollupDimension, RollupRow, SinkRecord, SinkStore, SinkVersion, UpsertOutcome};
use crate::config::ClickHouseConfig;
use crate::error::{StoreResult, SyncError};
use crate::model::{
    col, Contract, EntityRecord, InvestmentType, IssueStatus, MonthlySeries, SeriesKind, Version,
    MONTHS,
};
use crate::utils::{quote_ch_ident, strip_password_from_url, validate_identifier};

/// Ids per `IN {ids:Array(String)}` parameter, keeping request URLs short.
const ID_CHUNK: usize = 500;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Writes project records into a ReplacingMergeTree table.
///
/// The engine keeps the highest `_version` per `id_root` when parts merge and
/// every read uses `FINAL`, so ordering of concurrent inserts never matters.
/// Writes still check stored versions first to report skipped records and to
/// avoid shipping rows that would lose anyway.
pub struct ClickHouseSink {
    client: Client,
    config: ClickHouseConfig,
    table: String,
    qualified: String,
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig, table: &str, timeout: Duration) -> Result<Self> {
        validate_identifier(table).context("Invalid analytical table name")?;
        validate_identifier(&config.database).context("Invalid ClickHouse database name")?;
        url::Url::parse(&config.url).with_context(|| {
            format!(
                "Invalid ClickHouse URL: {}",
                strip_password_from_url(&config.url)
            )
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            config: config.clone(),
            table: table.to_string(),
            qualified: schema::qualified(&config.database, table),
        })
    }

    fn request(&self, params: &[(&str, String)]) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("X-ClickHouse-User", &self.config.user)
            .query(&[
                ("output_format_json_quote_decimals", "1"),
                ("output_format_json_quote_64bit_integers", "1"),
                ("wait_end_of_query", "1"),
            ]);
        if !self.config.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.config.password);
        }
        for (name, value) in params {
            request = request.query(&[(format!("param_{}", name), value)]);
        }
        request
    }

    async fn check(response: Response) -> StoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("ClickHouse returned {}: {}", status, body.trim());
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            Err(SyncError::TransientIo(message))
        } else {
            Err(SyncError::Storage(message))
        }
    }

    async fn execute(&self, sql: &str, params: &[(&str, String)]) -> StoreResult<()> {
        let response = self.request(params).body(sql.to_string()).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn select(&self, sql: &str, params: &[(&str, String)]) -> StoreResult<Vec<Map<String, Value>>> {
        let body = format!("{} FORMAT JSONEachRow", sql);
        let response = self.request(params).body(body).send().await?;
        let text = Self::check(response).await?.text().await?;
        parse_json_each_row(&text)
    }

    async fn insert(&self, rows: &[Value]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let names = schema::columns()
            .iter()
            .map(|(name, _)| quote_ch_ident(name))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("INSERT INTO {} ({}) FORMAT JSONEachRow", self.qualified, names);
        let mut body = String::new();
        for row in rows {
            body.push_str(&row.to_string());
            body.push('\n');
        }
        let response = self
            .request(&[])
            .query(&[("query", query)])
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn version_query(&self) -> String {
        format!(
            "SELECT {}, {}, {} FROM {} FINAL",
            quote_ch_ident(col::ID),
            quote_ch_ident(col::VERSION),
            quote_ch_ident(col::DELETED),
            self.qualified
        )
    }
}

#[async_trait]
impl SinkStore for ClickHouseSink {
    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in schema::statements(&self.config.database, &self.table) {
            tracing::debug!("ClickHouse DDL: {}", statement);
            self.execute(&statement, &[]).await?;
        }
        tracing::info!("Analytical schema ready: {}", self.qualified);
        Ok(())
    }

    async fn upsert(&self, records: &[EntityRecord]) -> StoreResult<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        // Within one call only the newest record per id can win.
        let mut newest: BTreeMap<&str, &EntityRecord> = BTreeMap::new();
        for record in records {
            match newest.get(record.entity_id.as_str()).copied() {
                Some(kept) if kept.version() >= record.version() => {
                    outcome.skipped.push(record.entity_id.clone());
                }
                Some(kept) => {
                    outcome.skipped.push(kept.entity_id.clone());
                    newest.insert(record.entity_id.as_str(), record);
                }
                None => {
                    newest.insert(record.entity_id.as_str(), record);
                }
            }
        }

        let ids: Vec<String> = newest.keys().map(|id| id.to_string()).collect();
        let stored = self.current_versions(&ids).await?;

        let mut rows = Vec::with_capacity(newest.len());
        for (id, record) in newest {
            match stored.get(id) {
                Some(current) if current.version >= record.version() => {
                    outcome.skipped.push(id.to_string());
                }
                _ => {
                    rows.push(encode_record(record, record.version(), false));
                    outcome.applied.push(id.to_string());
                }
            }
        }

        self.insert(&rows).await?;
        Ok(outcome)
    }

    async fn tombstone(&self, entity_id: &str, version: Version) -> StoreResult<bool> {
        let stored = self.current_versions(&[entity_id.to_string()]).await?;
        match stored.get(entity_id) {
            Some(current) if current.version >= version => Ok(false),
            Some(_) => {
                // Copy the stored body so the tombstone stays auditable.
                let sql = format!(
                    "INSERT INTO {q} SELECT * REPLACE ({{version:Int64}} AS {v}, 1 AS {d}) \
                     FROM {q} FINAL WHERE {id} = {{id:String}}",
                    q = self.qualified,
                    v = quote_ch_ident(col::VERSION),
                    d = quote_ch_ident(col::DELETED),
                    id = quote_ch_ident(col::ID)
                );
                self.execute(
                    &sql,
                    &[
                        ("version", version.0.to_string()),
                        ("id", escape_param(entity_id)),
                    ],
                )
                .await?;
                Ok(true)
            }
            None => {
                let bare = EntityRecord::bare(entity_id, version.to_timestamp());
                self.insert(&[encode_record(&bare, version, true)]).await?;
                Ok(true)
            }
        }
    }

    async fn current_versions(&self, ids: &[String]) -> StoreResult<HashMap<String, SinkVersion>> {
        let mut versions = HashMap::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "{} WHERE {} IN {{ids:Array(String)}}",
                self.version_query(),
                quote_ch_ident(col::ID)
            );
            for row in self.select(&sql, &[("ids", array_param(chunk))]).await? {
                let (id, version) = decode_version(&row)?;
                versions.insert(id, version);
            }
        }
        Ok(versions)
    }

    async fn versions(&self) -> StoreResult<BTreeMap<String, SinkVersion>> {
        let rows = self.select(&self.version_query(), &[]).await?;
        rows.iter().map(decode_version).collect()
    }

    async fn scan_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<SinkRecord>> {
        let sql = format!(
            "SELECT * FROM {q} FINAL WHERE {id} > {{after:String}} ORDER BY {id} LIMIT {{limit:UInt64}}",
            q = self.qualified,
            id = quote_ch_ident(col::ID)
        );
        let rows = self
            .select(
                &sql,
                &[
                    ("after", escape_param(after.unwrap_or(""))),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.iter().map(decode_record).collect()
    }

    async fn fetch(&self, ids: &[String]) -> StoreResult<Vec<SinkRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT * FROM {q} FINAL WHERE {id} IN {{ids:Array(String)}} ORDER BY {id}",
                q = self.qualified,
                id = quote_ch_ident(col::ID)
            );
            for row in self.select(&sql, &[("ids", array_param(chunk))]).await? {
                records.push(decode_record(&row)?);
            }
        }
        Ok(records)
    }

    async fn rollup(&self, dimension: RollupDimension) -> StoreResult<Vec<RollupRow>> {
        let sql = schema::rollup_select(&self.config.database, &self.table, dimension);
        let rows = self.select(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                Ok(RollupRow {
                    key: text(row, "key")?,
                    entities: integer(row, "entities")? as u64,
                    planned: decimal(row, "planned")?,
                    actual: decimal(row, "actual")?,
                    forecast: decimal(row, "forecast")?,
                })
            })
            .collect()
    }

    async fn optimize(&self) -> StoreResult<()> {
        self.execute(&format!("OPTIMIZE TABLE {} FINAL", self.qualified), &[])
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.execute("SELECT 1", &[]).await
    }
}

/// Escape a value for a ClickHouse HTTP query parameter (escaped format).
fn escape_param(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Render ids as an `Array(String)` parameter literal.
fn array_param(ids: &[String]) -> String {
    let items: Vec<String> = ids
        .iter()
        .map(|id| {
            let quoted = id.replace('\\', "\\\\").replace('\'', "\\'");
            escape_param(&format!("'{}'", quoted))
        })
        .collect();
    format!("[{}]", items.join(","))
}

fn parse_json_each_row(text: &str) -> StoreResult<Vec<Map<String, Value>>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(SyncError::Storage(format!(
                "unexpected ClickHouse row: {}",
                other
            ))),
            Err(e) => Err(SyncError::Storage(format!("invalid ClickHouse row: {}", e))),
        })
        .collect()
}

fn money_value(value: Decimal) -> Value {
    Value::String(value.to_string())
}

fn date_value(value: Option<NaiveDate>) -> Value {
    value.map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string()))
}

fn datetime_value(value: DateTime<Utc>) -> Value {
    Value::String(value.format(DATETIME_FORMAT).to_string())
}

/// Encode a record as one JSONEachRow object in the analytical column layout.
pub fn encode_record(record: &EntityRecord, version: Version, deleted: bool) -> Value {
    let mut row = Map::new();
    let mut put = |name: &str, value: Value| {
        row.insert(name.to_string(), value);
    };
    put(col::ID, json!(record.entity_id));
    put(col::REGION, json!(record.region));
    put(col::TERMINAL, json!(record.terminal));
    put(col::INVESTMENT_ID, json!(record.investment_id));
    put(col::PROJECT_DEFINITION, json!(record.project_definition));
    put(col::ASSET_CATEGORY, json!(record.asset_category));
    put(
        col::INVESTMENT_TYPE,
        json!(record.investment_type.map(|t| t.label())),
    );
    put(col::PROPOSAL_YEAR, json!(record.proposal_year));
    put(col::BUDGET_YEAR, json!(record.budget_year));
    put(col::INVESTMENT_STATUS, json!(record.investment_status));
    put(col::PROGRESS_DESCRIPTION, json!(record.progress_description));
    put(col::ISSUE_CATEGORY, json!(record.issue_category));
    put(col::ISSUE_DESCRIPTION, json!(record.issue_description));
    put(col::ACTION_TARGET, json!(record.action_target));
    put(col::HEAD_OFFICE_SUPPORT, json!(record.head_office_support));
    put(col::PIC, json!(record.pic));
    put(col::ISSUE_STATUS, json!(record.issue_status.map(|s| s.label())));
    put(col::FUNDING_NEED, money_value(record.funding_need));
    put(col::PLANNED_TOTAL, money_value(record.planned_total));
    for kind in SeriesKind::ALL {
        for (month, value) in record.series(kind).values().iter().enumerate() {
            put(&kind.column(month), money_value(*value));
        }
    }
    let contract = &record.contract;
    put(col::CONTRACT_TITLE, json!(contract.title));
    put(col::CONTRACT_VALUE, money_value(contract.value));
    put(
        col::ABSORBED_PRIOR_YEARS,
        money_value(contract.absorbed_prior_years),
    );
    put(col::VENDOR, json!(contract.vendor));
    put(col::CONTRACT_NUMBER, json!(contract.number));
    put(col::SIGNED_ON, date_value(contract.signed_on));
    put(col::STARTS_ON, date_value(contract.starts_on));
    put(col::DURATION, json!(contract.duration));
    put(col::DURATION_UNIT, json!(contract.duration_unit));
    put(col::ENDS_ON, date_value(contract.ends_on));
    put(col::LATITUDE, json!(record.latitude));
    put(col::LONGITUDE, json!(record.longitude));
    put(col::METADATA, Value::String(record.metadata.to_string()));
    put(
        col::CREATED_AT,
        record.created_at.map_or(Value::Null, datetime_value),
    );
    put(col::UPDATED_AT, datetime_value(record.updated_at));
    put(col::VERSION, json!(version.0));
    put(col::DELETED, json!(u8::from(deleted)));
    Value::Object(row)
}

fn decode_error(column: &str, value: &Value) -> SyncError {
    SyncError::Storage(format!(
        "unexpected value for column {}: {}",
        column, value
    ))
}

fn field<'a>(row: &'a Map<String, Value>, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&Value::Null)
}

fn text(row: &Map<String, Value>, column: &str) -> StoreResult<Option<String>> {
    match field(row, column) {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(decode_error(column, other)),
    }
}

fn required_text(row: &Map<String, Value>, column: &str) -> StoreResult<String> {
    text(row, column)?.ok_or_else(|| decode_error(column, &Value::Null))
}

fn integer(row: &Map<String, Value>, column: &str) -> StoreResult<i64> {
    let value = field(row, column);
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| decode_error(column, value))
}

fn optional_i32(row: &Map<String, Value>, column: &str) -> StoreResult<Option<i32>> {
    match field(row, column) {
        Value::Null => Ok(None),
        value => i32::try_from(integer(row, column)?)
            .map(Some)
            .map_err(|_| decode_error(column, value)),
    }
}

fn decimal(row: &Map<String, Value>, column: &str) -> StoreResult<Decimal> {
    let value = field(row, column);
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| decode_error(column, value))
}

fn float(row: &Map<String, Value>, column: &str) -> StoreResult<Option<f64>> {
    match field(row, column) {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(decode_error(column, other)),
    }
}

fn date(row: &Map<String, Value>, column: &str) -> StoreResult<Option<NaiveDate>> {
    text(row, column)?
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|_| decode_error(column, &Value::String(s.clone())))
        })
        .transpose()
}

fn datetime(row: &Map<String, Value>, column: &str) -> StoreResult<Option<DateTime<Utc>>> {
    text(row, column)?
        .map(|s| {
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|_| decode_error(column, &Value::String(s.clone())))
        })
        .transpose()
}

fn decode_version(row: &Map<String, Value>) -> StoreResult<(String, SinkVersion)> {
    Ok((
        required_text(row, col::ID)?,
        SinkVersion {
            version: Version(integer(row, col::VERSION)?),
            deleted: integer(row, col::DELETED)? != 0,
        },
    ))
}

/// Decode one JSONEachRow object produced by `SELECT *`.
pub fn decode_record(row: &Map<String, Value>) -> StoreResult<SinkRecord> {
    let investment_type = text(row, col::INVESTMENT_TYPE)?
        .map(|label| InvestmentType::from_label(&label))
        .transpose()?;
    let issue_status = text(row, col::ISSUE_STATUS)?
        .map(|label| IssueStatus::from_label(&label))
        .transpose()?;
    let updated_at = datetime(row, col::UPDATED_AT)?
        .ok_or_else(|| decode_error(col::UPDATED_AT, &Value::Null))?;
    let metadata = match text(row, col::METADATA)? {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)
            .map_err(|_| decode_error(col::METADATA, &Value::String(raw.clone())))?,
        _ => Value::Null,
    };

    let mut series = [MonthlySeries::default(); 3];
    for (slot, kind) in series.iter_mut().zip(SeriesKind::ALL) {
        for month in 0..MONTHS {
            slot.set(month, decimal(row, &kind.column(month))?);
        }
    }
    let [planned, actual, forecast] = series;

    let record = EntityRecord {
        entity_id: required_text(row, col::ID)?,
        region: text(row, col::REGION)?,
        terminal: text(row, col::TERMINAL)?,
        investment_id: text(row, col::INVESTMENT_ID)?,
        project_definition: text(row, col::PROJECT_DEFINITION)?,
        asset_category: text(row, col::ASSET_CATEGORY)?,
        investment_type,
        proposal_year: optional_i32(row, col::PROPOSAL_YEAR)?,
        budget_year: optional_i32(row, col::BUDGET_YEAR)?,
        investment_status: text(row, col::INVESTMENT_STATUS)?,
        progress_description: text(row, col::PROGRESS_DESCRIPTION)?,
        issue_category: text(row, col::ISSUE_CATEGORY)?,
        issue_description: text(row, col::ISSUE_DESCRIPTION)?,
        action_target: text(row, col::ACTION_TARGET)?,
        head_office_support: text(row, col::HEAD_OFFICE_SUPPORT)?,
        pic: text(row, col::PIC)?,
        issue_status,
        funding_need: decimal(row, col::FUNDING_NEED)?,
        planned_total: decimal(row, col::PLANNED_TOTAL)?,
        planned,
        actual,
        forecast,
        contract: Contract {
            title: text(row, col::CONTRACT_TITLE)?,
            value: decimal(row, col::CONTRACT_VALUE)?,
            absorbed_prior_years: decimal(row, col::ABSORBED_PRIOR_YEARS)?,
            vendor: text(row, col::VENDOR)?,
            number: text(row, col::CONTRACT_NUMBER)?,
            signed_on: date(row, col::SIGNED_ON)?,
            starts_on: date(row, col::STARTS_ON)?,
            duration: optional_i32(row, col::DURATION)?,
            duration_unit: text(row, col::DURATION_UNIT)?,
            ends_on: date(row, col::ENDS_ON)?,
        },
        latitude: float(row, col::LATITUDE)?,
        longitude: float(row, col::LONGITUDE)?,
        metadata,
        created_at: datetime(row, col::CREATED_AT)?,
        updated_at,
    };

    Ok(SinkRecord {
        record,
        version: Version(integer(row, col::VERSION)?),
        deleted: integer(row, col::DELETED)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::checksum;
    use chrono::TimeZone;

    fn sample() -> EntityRecord {
        let mut record = EntityRecord::bare(
            "PRJ-9",
            Utc.with_ymd_and_hms(2025, 4, 2, 3, 4, 5).unwrap() + chrono::Duration::microseconds(123),
        );
        record.region = Some("Regional 3".into());
        record.investment_type = Some(InvestmentType::CarryForward);
        record.issue_status = Some(IssueStatus::Open);
        record.budget_year = Some(2025);
        record.planned.set(0, "12.50".parse().unwrap());
        record.forecast.set(11, "99999999999999.99".parse().unwrap());
        record.contract.signed_on = NaiveDate::from_ymd_opt(2025, 1, 31);
        record.latitude = Some(-6.2088);
        record.metadata = json!({"source": "import"});
        record
    }

    #[test]
    fn test_encode_uses_analytical_layout() {
        let record = sample();
        let row = encode_record(&record, record.version(), false);
        let map = row.as_object().unwrap();
        assert_eq!(map.len(), schema::columns().len());
        assert_eq!(map["rkap_januari"], json!("12.50"));
        assert_eq!(map["type_investasi"], json!("Carry Forward"));
        assert_eq!(map["tanggal_kontrak"], json!("2025-01-31"));
        assert_eq!(map["updated_at"], json!("2025-04-02 03:04:05.000123"));
        assert_eq!(map["longitude"], Value::Null);
        assert_eq!(map["_deleted"], json!(0));
    }

    #[test]
    fn test_decode_reads_clickhouse_output() {
        let record = sample();
        let mut row = encode_record(&record, record.version(), true);
        // ClickHouse quotes 64-bit integers and renders trailing decimal zeros.
        let map = row.as_object_mut().unwrap();
        map.insert("_version".into(), json!(record.version().0.to_string()));
        map.insert("kebutuhan_dana".into(), json!("0.00"));
        map.insert("total_rkap_bulanan".into(), json!("12.50"));

        let decoded = decode_record(map).unwrap();
        assert!(decoded.deleted);
        assert_eq!(decoded.version, record.version());
        assert_eq!(decoded.record.updated_at, record.updated_at);
        assert_eq!(decoded.record.metadata, record.metadata);
        assert_eq!(checksum(&decoded.record), checksum(&record));
    }

    #[test]
    fn test_decode_rejects_unknown_enum_label() {
        let record = sample();
        let mut row = encode_record(&record, record.version(), false);
        row.as_object_mut()
            .unwrap()
            .insert("status_issue".into(), json!("Pending"));
        assert!(decode_record(row.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_array_param_escapes_quotes() {
        let ids = vec!["A".to_string(), "O'Brien".to_string()];
        assert_eq!(array_param(&ids), "['A','O\\\\'Brien']");
        assert_eq!(escape_param("a\tb"), "a\\tb");
    }

    #[test]
    fn test_parse_json_each_row() {
        let rows = parse_json_each_row("{\"id_root\":\"A\"}\n\n{\"id_root\":\"B\"}\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(parse_json_each_row("[1,2]").is_err());
    }

    #[test]
    fn test_new_validates_names() {
        let config = ClickHouseConfig::default();
        let timeout = Duration::from_secs(5);
        assert!(ClickHouseSink::new(&config, "project_investasi", timeout).is_ok());
        assert!(ClickHouseSink::new(&config, "bad name", timeout).is_err());
    }
}
