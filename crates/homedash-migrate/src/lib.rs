//! Batched sqlite → Postgres migration for the legacy energy price archive.
//!
//! The legacy dashboard accumulated several near-identical copies of this
//! migration; they are collapsed here into one paginated upsert routine
//! configured by an [`UpsertSpec`] and driven either one window at a time
//! (the HTTP paging endpoint) or to completion (the CLI runner).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use homedash_core::{validate_source_row, SourceRecord};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use homedash_core::EnergyPrice;

pub const CRATE_NAME: &str = "homedash-migrate";

/// Hard ceiling on rows per batch; bounds the latency of one paging call.
pub const MAX_BATCH_SIZE: i64 = 50;
pub const DEFAULT_BATCH_SIZE: i64 = 10;

const SOURCE_TABLE: &str = "prices";

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("start offset {start} is outside the source row set (0..={total})")]
    InvalidRange { start: i64, total: i64 },
    #[error("destination setup failed: {0}")]
    FatalSetup(String),
    #[error("source store error: {0}")]
    Source(String),
}

fn fatal(err: sqlx::Error) -> MigrateError {
    MigrateError::FatalSetup(err.to_string())
}

fn source_err(err: sqlx::Error) -> MigrateError {
    MigrateError::Source(err.to_string())
}

/// Read-only handle on the embedded sqlite archive.
///
/// One instance backs exactly one run (or one paging call) and must be
/// closed on every exit path; [`run_batch_from_file`] and
/// [`MigrationRunner::run`] take care of that.
pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    pub async fn open(path: &Path) -> Result<Self, MigrateError> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(source_err)?;
        Ok(Self { pool })
    }

    /// An empty in-memory database; the caller seeds it.
    pub async fn open_in_memory() -> Result<Self, MigrateError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(source_err)?;
        Ok(Self { pool })
    }

    pub async fn count(&self) -> Result<i64, MigrateError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {SOURCE_TABLE}"))
            .fetch_one(&self.pool)
            .await
            .map_err(source_err)?;
        row.try_get("n").map_err(source_err)
    }

    /// Reads one window of rows ordered by ascending `date`. The ordering is
    /// stable, so re-running a window always sees the same rows.
    pub async fn read_window(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRecord>, MigrateError> {
        let rows = sqlx::query(&format!(
            "SELECT date, price_energy, p1_counter_energy, price_gas, p1_counter_gas \
             FROM {SOURCE_TABLE} ORDER BY date ASC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(source_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(SourceRecord {
                date: row.try_get("date").map_err(source_err)?,
                price_energy: row.try_get("price_energy").map_err(source_err)?,
                p1_counter_energy: row.try_get("p1_counter_energy").map_err(source_err)?,
                price_gas: row.try_get("price_gas").map_err(source_err)?,
                p1_counter_gas: row.try_get("p1_counter_gas").map_err(source_err)?,
            });
        }
        Ok(records)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Parameters of the destination upsert statement: table, conflict key and
/// the value columns overwritten on collision. `touch_column`, when set, is
/// bumped to `NOW()` so re-migrated rows carry a fresh `updated_at`.
#[derive(Debug, Clone)]
pub struct UpsertSpec {
    pub table: String,
    pub conflict_column: String,
    pub value_columns: Vec<String>,
    pub touch_column: Option<String>,
}

impl UpsertSpec {
    pub fn energy_prices() -> Self {
        Self {
            table: "energy_prices".to_string(),
            conflict_column: "timestamp".to_string(),
            value_columns: vec![
                "price_energy".to_string(),
                "p1_counter_energy".to_string(),
                "price_gas".to_string(),
                "p1_counter_gas".to_string(),
            ],
            touch_column: Some("updated_at".to_string()),
        }
    }

    pub fn upsert_sql(&self) -> String {
        let mut columns = vec![self.conflict_column.clone()];
        columns.extend(self.value_columns.iter().cloned());
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut updates = self
            .value_columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>();
        if let Some(touch) = &self.touch_column {
            updates.push(format!("{touch} = NOW()"));
        }
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            self.table,
            columns.join(", "),
            placeholders,
            self.conflict_column,
            updates.join(", ")
        )
    }
}

/// Seam between the batch loop and the destination store.
///
/// `ensure_schema` failing is fatal to the whole run; `upsert` failing is a
/// per-record event that the loop counts and moves past.
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), MigrateError>;
    async fn upsert(&self, price: &EnergyPrice) -> anyhow::Result<()>;
}

/// Postgres-backed destination.
pub struct PgDestination {
    pool: PgPool,
    upsert_sql: String,
}

impl PgDestination {
    pub fn new(pool: PgPool) -> Self {
        Self::with_spec(pool, UpsertSpec::energy_prices())
    }

    pub fn with_spec(pool: PgPool, spec: UpsertSpec) -> Self {
        Self {
            upsert_sql: spec.upsert_sql(),
            pool,
        }
    }
}

#[async_trait]
impl DestinationWriter for PgDestination {
    async fn ensure_schema(&self) -> Result<(), MigrateError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS energy_prices (
                id SERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL UNIQUE,
                price_energy DOUBLE PRECISION,
                p1_counter_energy DOUBLE PRECISION,
                price_gas DOUBLE PRECISION,
                p1_counter_gas DOUBLE PRECISION,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(fatal)?;
        Ok(())
    }

    async fn upsert(&self, price: &EnergyPrice) -> anyhow::Result<()> {
        sqlx::query(&self.upsert_sql)
            .bind(price.timestamp)
            .bind(price.price_energy)
            .bind(price.p1_counter_energy)
            .bind(price.price_gas)
            .bind(price.p1_counter_gas)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upserting row {}", price.timestamp))?;
        Ok(())
    }
}

/// Progress of one paging call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub successful: u64,
    pub failed: u64,
    pub total: i64,
    pub processed_in_this_batch: u64,
    pub is_complete: bool,
    pub next_offset: Option<i64>,
}

/// Migrates one window of rows.
///
/// The batch size is clamped to [`MAX_BATCH_SIZE`]. Rows failing validation
/// and rows the destination rejects are counted as `failed` and skipped;
/// `next_offset` advances past every processed row, valid or not, so a
/// resumed run never re-reads a rejected row.
pub async fn run_batch(
    source: &SqliteSource,
    dest: &dyn DestinationWriter,
    start_offset: i64,
    batch_size: i64,
) -> Result<BatchResult, MigrateError> {
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);

    dest.ensure_schema().await?;

    let total = source.count().await?;
    if start_offset < 0 || start_offset > total {
        return Err(MigrateError::InvalidRange {
            start: start_offset,
            total,
        });
    }

    let records = source.read_window(start_offset, batch_size).await?;
    let mut successful = 0u64;
    let mut failed = 0u64;

    for record in &records {
        let validation = validate_source_row(record);
        if !validation.valid {
            warn!(date = %record.date, errors = ?validation.errors, "skipping invalid source row");
            failed += 1;
            continue;
        }
        let Some(price) = record.to_energy_price() else {
            failed += 1;
            continue;
        };
        match dest.upsert(&price).await {
            Ok(()) => successful += 1,
            Err(err) => {
                warn!(date = %record.date, error = %err, "destination rejected row");
                failed += 1;
            }
        }
    }

    let processed = records.len() as u64;
    let next = start_offset + processed as i64;
    let is_complete = next >= total;
    Ok(BatchResult {
        successful,
        failed,
        total,
        processed_in_this_batch: processed,
        is_complete,
        next_offset: if is_complete { None } else { Some(next) },
    })
}

/// One-shot variant for callers that hold only a file path (the paging
/// endpoint). Opens the source for the duration of the call and closes it on
/// both the success and the error path.
pub async fn run_batch_from_file(
    sqlite_path: &Path,
    dest: &dyn DestinationWriter,
    start_offset: i64,
    batch_size: i64,
) -> Result<BatchResult, MigrateError> {
    let source = SqliteSource::open(sqlite_path).await?;
    let result = run_batch(&source, dest, start_offset, batch_size).await;
    source.close().await;
    result
}

/// Lifecycle of a driven migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Complete,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub start_offset: i64,
    pub batch_size: i64,
    /// Pause between batches; eases pressure on the destination store. Not a
    /// correctness requirement.
    pub batch_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            start_offset: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub batches: u64,
    pub successful: u64,
    pub failed: u64,
    pub total: i64,
    pub next_offset: Option<i64>,
    pub error: Option<String>,
}

/// Drives batches to completion with cooperative cancellation.
///
/// The stop flag is only observed at batch boundaries: a run always finishes
/// the batch it is in. A stop that lands during the final batch still
/// reports `Complete` when that batch exhausted the row set.
pub struct MigrationRunner {
    config: RunnerConfig,
    stop: Arc<AtomicBool>,
}

impl MigrationRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with whoever requests cancellation (ctrl-c handler).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn run(&self, sqlite_path: &Path, dest: &dyn DestinationWriter) -> RunSummary {
        let run_id = Uuid::new_v4();
        let source = match SqliteSource::open(sqlite_path).await {
            Ok(source) => source,
            Err(err) => {
                return RunSummary {
                    run_id,
                    state: RunState::Failed,
                    batches: 0,
                    successful: 0,
                    failed: 0,
                    total: 0,
                    next_offset: None,
                    error: Some(err.to_string()),
                }
            }
        };
        let summary = self.run_with_source(run_id, &source, dest).await;
        source.close().await;
        summary
    }

    async fn run_with_source(
        &self,
        run_id: Uuid,
        source: &SqliteSource,
        dest: &dyn DestinationWriter,
    ) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            state: RunState::Running,
            batches: 0,
            successful: 0,
            failed: 0,
            total: 0,
            next_offset: None,
            error: None,
        };
        let mut offset = self.config.start_offset;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                summary.state = RunState::Stopped;
                summary.next_offset = Some(offset);
                break;
            }
            match run_batch(source, dest, offset, self.config.batch_size).await {
                Ok(batch) => {
                    summary.batches += 1;
                    summary.successful += batch.successful;
                    summary.failed += batch.failed;
                    summary.total = batch.total;
                    summary.next_offset = batch.next_offset;
                    info!(
                        %run_id,
                        offset,
                        successful = batch.successful,
                        failed = batch.failed,
                        total = batch.total,
                        "migrated batch"
                    );
                    match batch.next_offset {
                        None => {
                            summary.state = RunState::Complete;
                            break;
                        }
                        Some(next) => offset = next,
                    }
                    if !self.config.batch_delay.is_zero() {
                        tokio::time::sleep(self.config.batch_delay).await;
                    }
                }
                Err(err) => {
                    summary.state = RunState::Failed;
                    summary.error = Some(err.to_string());
                    break;
                }
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Named migration ledger
// ---------------------------------------------------------------------------

/// Ledger name for the weather archive table.
pub const CREATE_WEATHER_HISTORY: &str = "001_create_weather_history";

pub const WEATHER_HISTORY_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS weather_history (
    id SERIAL PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    temp DOUBLE PRECISION NOT NULL,
    feels_like DOUBLE PRECISION NOT NULL,
    humidity DOUBLE PRECISION NOT NULL,
    description TEXT NOT NULL,
    icon TEXT NOT NULL,
    wind_speed DOUBLE PRECISION,
    wind_deg DOUBLE PRECISION,
    pressure DOUBLE PRECISION,
    clouds DOUBLE PRECISION,
    rain_1h DOUBLE PRECISION,
    snow_1h DOUBLE PRECISION,
    lat DOUBLE PRECISION NOT NULL,
    lon DOUBLE PRECISION NOT NULL,
    location_name TEXT,
    raw_data JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS weather_history_timestamp_idx ON weather_history (timestamp);
"#;

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool, MigrateError> {
    let row = sqlx::query(
        "SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = $1
        ) AS present",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .map_err(fatal)?;
    row.try_get("present").map_err(fatal)
}

pub async fn ensure_ledger(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(fatal)?;
    Ok(())
}

pub async fn ledger_has_run(pool: &PgPool, name: &str) -> Result<bool, MigrateError> {
    let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE name = $1) AS present")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(fatal)?;
    row.try_get("present").map_err(fatal)
}

pub async fn ledger_record(pool: &PgPool, name: &str) -> Result<(), MigrateError> {
    sqlx::query("INSERT INTO schema_migrations (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(pool)
        .await
        .map_err(fatal)?;
    Ok(())
}

/// Runs a named DDL migration once; later calls are no-ops recorded in the
/// ledger. Returns whether the migration was applied by this call.
pub async fn apply_named_migration(
    pool: &PgPool,
    name: &str,
    ddl: &str,
) -> Result<bool, MigrateError> {
    ensure_ledger(pool).await?;
    if ledger_has_run(pool, name).await? {
        info!(name, "migration already applied, skipping");
        return Ok(false);
    }
    sqlx::raw_sql(ddl).execute(pool).await.map_err(fatal)?;
    ledger_record(pool, name).await?;
    info!(name, "migration applied");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryDestination {
        rows: Mutex<BTreeMap<DateTime<Utc>, EnergyPrice>>,
        fail_schema: bool,
        fail_on: Option<DateTime<Utc>>,
    }

    #[async_trait]
    impl DestinationWriter for MemoryDestination {
        async fn ensure_schema(&self) -> Result<(), MigrateError> {
            if self.fail_schema {
                return Err(MigrateError::FatalSetup("destination unavailable".into()));
            }
            Ok(())
        }

        async fn upsert(&self, price: &EnergyPrice) -> anyhow::Result<()> {
            if self.fail_on == Some(price.timestamp) {
                anyhow::bail!("simulated write failure");
            }
            self.rows
                .lock()
                .expect("rows lock")
                .insert(price.timestamp, price.clone());
            Ok(())
        }
    }

    impl MemoryDestination {
        fn row_count(&self) -> usize {
            self.rows.lock().expect("rows lock").len()
        }

        fn get(&self, ts: DateTime<Utc>) -> Option<EnergyPrice> {
            self.rows.lock().expect("rows lock").get(&ts).cloned()
        }
    }

    type Seed<'a> = (&'a str, Option<f64>, Option<f64>, Option<f64>, Option<f64>);

    async fn seeded_source(rows: &[Seed<'_>]) -> SqliteSource {
        let source = SqliteSource::open_in_memory().await.expect("in-memory sqlite");
        sqlx::query(
            "CREATE TABLE prices (
                date TEXT PRIMARY KEY,
                price_energy REAL,
                p1_counter_energy REAL,
                price_gas REAL,
                p1_counter_gas REAL
            )",
        )
        .execute(&source.pool)
        .await
        .expect("create source table");
        for row in rows {
            sqlx::query("INSERT INTO prices VALUES (?1, ?2, ?3, ?4, ?5)")
                .bind(row.0)
                .bind(row.1)
                .bind(row.2)
                .bind(row.3)
                .bind(row.4)
                .execute(&source.pool)
                .await
                .expect("seed row");
        }
        source
    }

    fn hourly_dates(count: usize) -> Vec<String> {
        let base = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).single().unwrap();
        (0..count)
            .map(|i| {
                (base + ChronoDuration::hours(i as i64))
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn upsert_sql_renders_conflict_clause() {
        let sql = UpsertSpec::energy_prices().upsert_sql();
        assert_eq!(
            sql,
            "INSERT INTO energy_prices (timestamp, price_energy, p1_counter_energy, price_gas, p1_counter_gas) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (timestamp) DO UPDATE SET \
             price_energy = EXCLUDED.price_energy, \
             p1_counter_energy = EXCLUDED.p1_counter_energy, \
             price_gas = EXCLUDED.price_gas, \
             p1_counter_gas = EXCLUDED.p1_counter_gas, \
             updated_at = NOW()"
        );
    }

    #[tokio::test]
    async fn batch_counts_add_up() {
        let source = seeded_source(&[
            ("2023-06-01 00:00:00", Some(0.25), Some(100.0), Some(0.8), Some(50.0)),
            ("2023-06-01 01:00:00", Some(0.26), None, None, None),
            ("2023-06-01 02:00:00", None, None, None, None),
            ("2023-06-01 03:00:00", Some(0.30), Some(103.0), Some(0.9), Some(53.0)),
            ("not-a-date", Some(0.31), Some(104.0), Some(1.0), Some(54.0)),
        ])
        .await;
        let dest = MemoryDestination::default();

        let result = run_batch(&source, &dest, 0, 10).await.expect("batch runs");
        assert_eq!(result.processed_in_this_batch, 5);
        assert_eq!(result.successful, 4);
        assert_eq!(result.failed, 1);
        assert_eq!(result.successful + result.failed, result.processed_in_this_batch);
        assert_eq!(result.total, 5);
        assert!(result.is_complete);
        assert_eq!(result.next_offset, None);
        assert_eq!(dest.row_count(), 4);
        source.close().await;
    }

    #[tokio::test]
    async fn migrating_the_same_range_twice_is_idempotent() {
        let source = seeded_source(&[(
            "2023-06-01 00:00:00",
            Some(5.0),
            Some(10.0),
            Some(1.0),
            Some(2.0),
        )])
        .await;
        let dest = MemoryDestination::default();

        let first = run_batch(&source, &dest, 0, 10).await.expect("first run");
        let second = run_batch(&source, &dest, 0, 10).await.expect("second run");
        assert_eq!(first.successful, 1);
        assert_eq!(second.successful, 1);
        assert_eq!(dest.row_count(), 1);

        let ts = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).single().unwrap();
        let row = dest.get(ts).expect("row exists");
        assert_eq!(row.price_energy, Some(5.0));
        assert_eq!(row.p1_counter_energy, Some(10.0));
        assert_eq!(row.price_gas, Some(1.0));
        assert_eq!(row.p1_counter_gas, Some(2.0));
        source.close().await;
    }

    #[tokio::test]
    async fn oversized_batch_request_is_clamped() {
        let dates = hourly_dates(60);
        let rows: Vec<Seed> = dates
            .iter()
            .map(|d| (d.as_str(), Some(0.2), None, None, None))
            .collect();
        let source = seeded_source(&rows).await;
        let dest = MemoryDestination::default();

        let result = run_batch(&source, &dest, 0, 1000).await.expect("batch runs");
        assert_eq!(result.processed_in_this_batch, 50);
        assert!(!result.is_complete);
        assert_eq!(result.next_offset, Some(50));

        let rest = run_batch(&source, &dest, 50, 1000).await.expect("batch runs");
        assert_eq!(rest.processed_in_this_batch, 10);
        assert!(rest.is_complete);
        assert_eq!(dest.row_count(), 60);
        source.close().await;
    }

    #[tokio::test]
    async fn start_beyond_row_count_is_invalid_range() {
        let source = seeded_source(&[(
            "2023-06-01 00:00:00",
            Some(0.2),
            None,
            None,
            None,
        )])
        .await;
        let dest = MemoryDestination::default();

        let err = run_batch(&source, &dest, 999, 10).await.expect_err("out of range");
        assert!(matches!(
            err,
            MigrateError::InvalidRange { start: 999, total: 1 }
        ));
        assert_eq!(dest.row_count(), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn invalid_date_produces_no_destination_row() {
        let source = seeded_source(&[("not-a-date", Some(0.2), None, None, None)]).await;
        let dest = MemoryDestination::default();

        let result = run_batch(&source, &dest, 0, 10).await.expect("batch runs");
        assert_eq!(result.failed, 1);
        assert_eq!(result.successful, 0);
        assert_eq!(dest.row_count(), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn completion_tracks_offset_plus_processed() {
        let dates = hourly_dates(5);
        let rows: Vec<Seed> = dates
            .iter()
            .map(|d| (d.as_str(), Some(0.2), None, None, None))
            .collect();
        let source = seeded_source(&rows).await;
        let dest = MemoryDestination::default();

        let first = run_batch(&source, &dest, 0, 3).await.expect("first window");
        assert_eq!(first.processed_in_this_batch, 3);
        assert!(!first.is_complete);
        assert_eq!(first.next_offset, Some(3));

        let second = run_batch(&source, &dest, 3, 3).await.expect("second window");
        assert_eq!(second.processed_in_this_batch, 2);
        assert!(second.is_complete);
        assert_eq!(second.next_offset, None);
        source.close().await;
    }

    #[tokio::test]
    async fn empty_source_completes_immediately() {
        let source = seeded_source(&[]).await;
        let dest = MemoryDestination::default();

        let result = run_batch(&source, &dest, 0, 10).await.expect("batch runs");
        assert_eq!(result.processed_in_this_batch, 0);
        assert!(result.is_complete);
        assert_eq!(result.next_offset, None);
        source.close().await;
    }

    #[tokio::test]
    async fn schema_setup_failure_is_fatal() {
        let source = seeded_source(&[("2023-06-01 00:00:00", Some(0.2), None, None, None)]).await;
        let dest = MemoryDestination {
            fail_schema: true,
            ..MemoryDestination::default()
        };

        let err = run_batch(&source, &dest, 0, 10).await.expect_err("fatal");
        assert!(matches!(err, MigrateError::FatalSetup(_)));
        source.close().await;
    }

    #[tokio::test]
    async fn transient_write_failure_is_counted_not_fatal() {
        let dates = hourly_dates(3);
        let rows: Vec<Seed> = dates
            .iter()
            .map(|d| (d.as_str(), Some(0.2), None, None, None))
            .collect();
        let source = seeded_source(&rows).await;
        let poisoned = Utc.with_ymd_and_hms(2023, 6, 1, 1, 0, 0).single().unwrap();
        let dest = MemoryDestination {
            fail_on: Some(poisoned),
            ..MemoryDestination::default()
        };

        let result = run_batch(&source, &dest, 0, 10).await.expect("batch runs");
        assert_eq!(result.successful, 2);
        assert_eq!(result.failed, 1);
        assert!(result.is_complete);
        assert_eq!(dest.row_count(), 2);
        source.close().await;
    }

    #[tokio::test]
    async fn runner_drives_all_batches_to_completion() {
        let dates = hourly_dates(12);
        let rows: Vec<Seed> = dates
            .iter()
            .map(|d| (d.as_str(), Some(0.2), None, None, None))
            .collect();
        let source = seeded_source(&rows).await;
        let dest = MemoryDestination::default();
        let runner = MigrationRunner::new(RunnerConfig {
            start_offset: 0,
            batch_size: 5,
            batch_delay: Duration::ZERO,
        });

        let summary = runner
            .run_with_source(Uuid::new_v4(), &source, &dest)
            .await;
        assert_eq!(summary.state, RunState::Complete);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.successful, 12);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.next_offset, None);
        assert_eq!(dest.row_count(), 12);
        source.close().await;
    }

    #[tokio::test]
    async fn runner_honors_stop_at_batch_boundary() {
        let dates = hourly_dates(4);
        let rows: Vec<Seed> = dates
            .iter()
            .map(|d| (d.as_str(), Some(0.2), None, None, None))
            .collect();
        let source = seeded_source(&rows).await;
        let dest = MemoryDestination::default();
        let runner = MigrationRunner::new(RunnerConfig {
            start_offset: 0,
            batch_size: 2,
            batch_delay: Duration::ZERO,
        });
        runner.stop_handle().store(true, Ordering::SeqCst);

        let summary = runner
            .run_with_source(Uuid::new_v4(), &source, &dest)
            .await;
        assert_eq!(summary.state, RunState::Stopped);
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.next_offset, Some(0));
        assert_eq!(dest.row_count(), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn runner_reports_failure_on_missing_source_file() {
        let dest = MemoryDestination::default();
        let runner = MigrationRunner::new(RunnerConfig::default());
        let summary = runner
            .run(Path::new("/nonexistent/energy.db"), &dest)
            .await;
        assert_eq!(summary.state, RunState::Failed);
        assert!(summary.error.is_some());
    }
}
