// ABOUTME: End-to-end tests against real PostgreSQL and ClickHouse instances
// ABOUTME: Ignored by default; set TEST_SOURCE_URL and TEST_CLICKHOUSE_URL and run with --ignored

use project_sync::config::ClickHouseConfig;
use project_sync::sink::schema::{current_view_name, rollup_view_name};
use project_sync::sink::{ClickHouseSink, RollupDimension, SinkStore};
use project_sync::source::postgres::{column_types, connect_with_retry};
use project_sync::source::{ChangeListener, ListenerSignal, PgSource, SourceStore};
use project_sync::sync::{
    EngineSettings, FullSyncEngine, IncrementalSyncEngine, ReconcileMode, ReconciliationEngine,
    SyncCoordinator, WatermarkStore,
};
use project_sync::utils::{BackoffPolicy, ShutdownSignal};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let clickhouse = env::var("TEST_CLICKHOUSE_URL").ok()?;
    Some((source, clickhouse))
}

fn test_table_name(suffix: &str) -> String {
    format!("project_sync_live_{}_{}", suffix, std::process::id())
}

/// Create the source table with every column the source reader selects,
/// plus the trigger that publishes change notifications on `channel`.
async fn setup_source_table(
    client: &tokio_postgres::Client,
    table: &str,
    channel: &str,
) -> anyhow::Result<()> {
    let columns = column_types()
        .into_iter()
        .map(|(name, ty)| {
            if name == "id_root" {
                format!("\"{}\" {} PRIMARY KEY", name, ty)
            } else if name == "updated_at" {
                format!("\"{}\" {} NOT NULL DEFAULT now()", name, ty)
            } else {
                format!("\"{}\" {}", name, ty)
            }
        })
        .collect::<Vec<_>>()
        .join(",\n    ");

    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{table}" CASCADE;
        CREATE TABLE "public"."{table}" (
            {columns}
        );
        CREATE OR REPLACE FUNCTION "{table}_notify"() RETURNS trigger AS $$
        DECLARE
            rec RECORD;
        BEGIN
            IF TG_OP = 'DELETE' THEN rec := OLD; ELSE rec := NEW; END IF;
            PERFORM pg_notify('{channel}', json_build_object(
                'operation', TG_OP,
                'id_root', rec.id_root,
                'timestamp', now()
            )::text);
            RETURN rec;
        END;
        $$ LANGUAGE plpgsql;
        CREATE TRIGGER "{table}_changes"
            AFTER INSERT OR UPDATE OR DELETE ON "public"."{table}"
            FOR EACH ROW EXECUTE FUNCTION "{table}_notify"();
        "#
    );
    client.batch_execute(&ddl).await?;
    Ok(())
}

async fn cleanup_source_table(client: &tokio_postgres::Client, table: &str) {
    let ddl = format!(
        r#"DROP TABLE IF EXISTS "public"."{table}" CASCADE; DROP FUNCTION IF EXISTS "{table}_notify"();"#
    );
    let _ = client.batch_execute(&ddl).await;
}

async fn cleanup_sink_table(clickhouse_url: &str, table: &str) {
    let http = reqwest::Client::new();
    let mut names: Vec<String> = RollupDimension::ALL
        .iter()
        .map(|d| rollup_view_name(table, *d))
        .collect();
    names.push(current_view_name(table));
    names.push(table.to_string());
    for name in names {
        let _ = http
            .post(clickhouse_url)
            .body(format!("DROP TABLE IF EXISTS `default`.`{}`", name))
            .send()
            .await;
    }
}

fn clickhouse_config(url: &str) -> ClickHouseConfig {
    ClickHouseConfig {
        url: url.to_string(),
        ..ClickHouseConfig::default()
    }
}

async fn insert_project(client: &tokio_postgres::Client, table: &str, id: &str, region: &str) {
    client
        .execute(
            &format!(
                r#"INSERT INTO "public"."{}" (id_root, klaster_regional, rkap, rkap_januari)
                   VALUES ($1, $2, 1200, 100)"#,
                table
            ),
            &[&id, &region],
        )
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_full_then_incremental_then_reconcile() {
    let (source_url, clickhouse_url) = match get_test_urls() {
        Some(urls) => urls,
        None => {
            eprintln!("Skipping: TEST_SOURCE_URL and TEST_CLICKHOUSE_URL must be set");
            return;
        }
    };
    let table = test_table_name("sync");
    let client = connect_with_retry(&source_url).await.unwrap();
    setup_source_table(&client, &table, "project_sync_live").await.unwrap();

    for (id, region) in [("P-1", "Regional 1"), ("P-2", "Regional 1"), ("P-3", "Regional 2")] {
        insert_project(&client, &table, id, region).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(
        SyncCoordinator::open(WatermarkStore::new(dir.path().join("watermark.json")), true)
            .await
            .unwrap(),
    );
    let source: Arc<dyn SourceStore> = Arc::new(PgSource::new(&source_url, &table).unwrap());
    let sink: Arc<dyn SinkStore> = Arc::new(
        ClickHouseSink::new(&clickhouse_config(&clickhouse_url), &table, Duration::from_secs(30))
            .unwrap(),
    );
    sink.ensure_schema().await.unwrap();

    let settings = EngineSettings {
        snapshot_lag: Duration::ZERO,
        ..EngineSettings::default()
    };
    let full = FullSyncEngine::new(
        source.clone(),
        sink.clone(),
        coordinator.clone(),
        settings.clone(),
    );
    let result = full.full_sync().await.unwrap();
    assert_eq!(result.applied, 3);

    client
        .execute(
            &format!(
                r#"UPDATE "public"."{}" SET klaster_regional = 'Regional 3', updated_at = now() WHERE id_root = 'P-2'"#,
                table
            ),
            &[],
        )
        .await
        .unwrap();
    client
        .execute(
            &format!(r#"DELETE FROM "public"."{}" WHERE id_root = 'P-3'"#, table),
            &[],
        )
        .await
        .unwrap();

    let incremental = Arc::new(IncrementalSyncEngine::new(
        source.clone(),
        sink.clone(),
        coordinator.clone(),
        settings.clone(),
    ));
    let result = incremental
        .sync(&["P-2".to_string(), "P-3".to_string()].into())
        .await
        .unwrap();
    assert_eq!(result.applied, 2);
    assert_eq!(result.tombstoned, 1);

    let stored = sink.fetch(&["P-2".to_string(), "P-3".to_string()]).await.unwrap();
    let p2 = stored.iter().find(|r| r.record.entity_id == "P-2").unwrap();
    assert_eq!(p2.record.region.as_deref(), Some("Regional 3"));
    assert!(stored.iter().find(|r| r.record.entity_id == "P-3").unwrap().deleted);

    let reconciler = ReconciliationEngine::new(source, sink.clone(), incremental, settings);
    let report = reconciler.reconcile(ReconcileMode::Checksum).await.unwrap();
    assert!(!report.has_drift(), "{}", report);
    assert_eq!(report.sink_count, 2);

    let rollup = sink.rollup(RollupDimension::Region).await.unwrap();
    assert_eq!(rollup.iter().map(|r| r.entities).sum::<u64>(), 2);

    cleanup_source_table(&client, &table).await;
    cleanup_sink_table(&clickhouse_url, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_listener_delivers_notifications() {
    let (source_url, _) = match get_test_urls() {
        Some(urls) => urls,
        None => {
            eprintln!("Skipping: TEST_SOURCE_URL and TEST_CLICKHOUSE_URL must be set");
            return;
        }
    };
    let table = test_table_name("listen");
    let channel = format!("project_sync_live_{}", std::process::id());
    let client = connect_with_retry(&source_url).await.unwrap();
    setup_source_table(&client, &table, &channel).await.unwrap();

    let listener = ChangeListener::new(
        &source_url,
        &channel,
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        },
        5,
        Duration::from_secs(5),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let (trigger, shutdown) = ShutdownSignal::new();
    let task = tokio::spawn(async move { listener.run(tx, shutdown).await });

    let subscribed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscribed, ListenerSignal::Subscribed { reconnect: false });

    insert_project(&client, &table, "P-9", "Regional 4").await;
    let signal = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match signal {
        ListenerSignal::Event(event) => assert_eq!(event.entity_id, "P-9"),
        other => panic!("expected an event, got {:?}", other),
    }

    trigger.trigger();
    task.await.unwrap().unwrap();
    cleanup_source_table(&client, &table).await;
}
