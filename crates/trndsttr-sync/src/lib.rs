//! Ingestion pipeline: batching, normalization, de-duplication, persistence and the KPI read path.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use trndsttr_core::{
    CoreError, Geo, IngestOutcome, IngestionBatch, KpiRow, Timeframe, TimeseriesPoint, TrendPoint,
    WideTable, MAX_KEYWORDS_PER_REQUEST,
};
use trndsttr_provider::{
    FixtureProvider, GoogleTrendsConfig, GoogleTrendsProvider, ProviderError, TrendsProvider,
};
use trndsttr_storage::{
    retry_on_rate_limit, BackoffPolicy, HttpClientConfig, HttpFetcher, SnapshotStore,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trndsttr-sync";

pub const TRENDS_TABLE: &str = "topics";

pub const DEFAULT_WINDOW_DAYS: u32 = 7;

const SECONDS_PER_DAY: i64 = 86_400;

/// Rows per multi-VALUES insert; four binds per row keeps well under SQLite's variable cap.
const INSERT_CHUNK_ROWS: usize = 1_000;

const TIME_COLUMN_ALIASES: [&str; 4] = [WideTable::TIME_COLUMN, "date_ts", "timestamp", "time"];

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub snapshots_dir: PathBuf,
    pub snapshots_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub hl: String,
    pub tz_offset_minutes: i32,
    pub skip_existing: bool,
    pub fixture_path: Option<PathBuf>,
    pub watchlist_path: PathBuf,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://db/trends.db".to_string()),
            snapshots_dir: std::env::var("TRNDSTTR_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            snapshots_enabled: env_flag("TRNDSTTR_SNAPSHOTS_ENABLED"),
            user_agent: std::env::var("TRNDSTTR_USER_AGENT")
                .unwrap_or_else(|_| "trndsttr/0.1".to_string()),
            http_timeout_secs: std::env::var("TRNDSTTR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            hl: std::env::var("TRNDSTTR_HL").unwrap_or_else(|_| "en-US".to_string()),
            tz_offset_minutes: std::env::var("TRNDSTTR_TZ")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            skip_existing: env_flag("TRNDSTTR_SKIP_EXISTING"),
            fixture_path: std::env::var("TRNDSTTR_FIXTURE").ok().map(PathBuf::from),
            watchlist_path: std::env::var("TRNDSTTR_WATCHLIST")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("watchlist.yaml")),
        }
    }

    pub fn append_mode(&self) -> AppendMode {
        if self.skip_existing {
            AppendMode::SkipExisting
        } else {
            AppendMode::Blind
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// Default keywords and fetch parameters used when a caller supplies none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watchlist {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default)]
    pub geo: Geo,
}

impl Default for Watchlist {
    fn default() -> Self {
        Self {
            keywords: vec![
                "Sabrina Carpenter".to_string(),
                "Addison Rae".to_string(),
                "Taylor Swift".to_string(),
            ],
            timeframe: Timeframe::default(),
            geo: Geo::default(),
        }
    }
}

impl Watchlist {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no watchlist file; using built-in defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Split keywords into provider-sized chunks, preserving order.
pub fn split_keywords(keywords: &[String]) -> Vec<Vec<String>> {
    keywords
        .chunks(MAX_KEYWORDS_PER_REQUEST)
        .map(<[String]>::to_vec)
        .collect()
}

pub fn plan_batches(
    keywords: &[String],
    timeframe: Timeframe,
    geo: Geo,
) -> Result<Vec<IngestionBatch>, CoreError> {
    split_keywords(keywords)
        .into_iter()
        .map(|chunk| IngestionBatch::new(chunk, timeframe, geo))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedChunk {
    pub points: Vec<TrendPoint>,
    pub dropped_timestamps: usize,
}

/// Parse a time bucket as UTC epoch seconds.
///
/// Accepts integers (or digit strings) as epoch seconds, RFC 3339, naive
/// `YYYY-MM-DD[ T]HH:MM:SS` and bare dates, all read as UTC.
pub fn parse_timestamp(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        JsonValue::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp())
}

/// Numbers and numeric strings become interest values; anything else is null.
pub fn coerce_interest(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Reshape one wide response into long rows, one per (time bucket, keyword) cell.
///
/// Output is column-major: every row of the first keyword, then the second, and
/// so on. The partial-period flag is discarded. Rows whose time bucket does not
/// parse are dropped and counted.
pub fn normalize_wide_table(table: &WideTable, fetched_at: DateTime<Utc>) -> NormalizedChunk {
    let mut out = NormalizedChunk::default();
    if table.is_empty() {
        return out;
    }

    let Some(time_idx) = TIME_COLUMN_ALIASES
        .iter()
        .find_map(|name| table.column_index(name))
    else {
        warn!(columns = ?table.columns, rows = table.rows.len(), "wide table has no time column; dropping it");
        out.dropped_timestamps = table.rows.len();
        return out;
    };

    let keyword_columns: Vec<(usize, &str)> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(idx, name)| *idx != time_idx && name.as_str() != WideTable::PARTIAL_COLUMN)
        .map(|(idx, name)| (idx, name.as_str()))
        .collect();

    let timestamps: Vec<Option<i64>> = table
        .rows
        .iter()
        .map(|row| {
            let raw = row.get(time_idx).unwrap_or(&JsonValue::Null);
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                warn!(raw = %raw, keywords = ?keyword_columns, "dropping row with unparseable timestamp");
            }
            parsed
        })
        .collect();
    out.dropped_timestamps = timestamps.iter().filter(|t| t.is_none()).count();

    out.points.reserve(keyword_columns.len() * table.rows.len());
    for (col_idx, keyword) in &keyword_columns {
        for (row, timestamp) in table.rows.iter().zip(&timestamps) {
            let Some(timestamp) = *timestamp else {
                continue;
            };
            out.points.push(TrendPoint {
                keyword: keyword.to_string(),
                timestamp,
                interest: coerce_interest(row.get(*col_idx)),
                fetched_at,
            });
        }
    }
    out
}

/// Keep the first row for every (timestamp, keyword) pair, in input order.
pub fn dedupe_points(points: Vec<TrendPoint>) -> Vec<TrendPoint> {
    let mut seen = HashSet::with_capacity(points.len());
    points
        .into_iter()
        .filter(|p| seen.insert((p.timestamp, p.keyword.clone())))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendMode {
    /// Insert every row; pairs already stored by earlier runs get duplicated.
    #[default]
    Blind,
    /// Insert a row only when no stored row has the same (keyword, date_ts).
    SkipExisting,
}

pub async fn connect_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    if !in_memory {
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    // Every connection to an in-memory database is its own database.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
    };
    pool_options.connect_with(options).await
}

/// Sole writer of the trends table.
#[derive(Debug, Clone)]
pub struct TrendSink {
    pool: SqlitePool,
    mode: AppendMode,
}

impl TrendSink {
    pub fn new(pool: SqlitePool, mode: AppendMode) -> Self {
        Self { pool, mode }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn mode(&self) -> AppendMode {
        self.mode
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                keyword TEXT NOT NULL,
                date_ts INTEGER NOT NULL,
                interest REAL,
                fetched_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_topics_date_ts ON topics (date_ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_topics_keyword_date_ts ON topics (keyword, date_ts)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert `points` in one transaction and return how many rows were written.
    pub async fn append(&self, points: &[TrendPoint]) -> Result<u64, sqlx::Error> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        match self.mode {
            AppendMode::Blind => {
                for chunk in points.chunks(INSERT_CHUNK_ROWS) {
                    let mut qb = QueryBuilder::<Sqlite>::new(
                        "INSERT INTO topics (keyword, date_ts, interest, fetched_at) ",
                    );
                    qb.push_values(chunk, |mut row, p| {
                        row.push_bind(p.keyword.as_str())
                            .push_bind(p.timestamp)
                            .push_bind(p.interest)
                            .push_bind(p.fetched_at);
                    });
                    inserted += qb.build().execute(&mut *tx).await?.rows_affected();
                }
            }
            AppendMode::SkipExisting => {
                for p in points {
                    inserted += sqlx::query(
                        r#"
                        INSERT INTO topics (keyword, date_ts, interest, fetched_at)
                        SELECT ?1, ?2, ?3, ?4
                         WHERE NOT EXISTS (
                               SELECT 1 FROM topics WHERE keyword = ?1 AND date_ts = ?2
                         )
                        "#,
                    )
                    .bind(p.keyword.as_str())
                    .bind(p.timestamp)
                    .bind(p.interest)
                    .bind(p.fetched_at)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
            }
        }

        tx.commit().await?;
        debug!(rows = inserted, offered = points.len(), mode = ?self.mode, "appended trend rows");
        Ok(inserted)
    }
}

/// Read-only aggregation over the trends table.
#[derive(Debug, Clone)]
pub struct KpiAggregator {
    pool: SqlitePool,
}

impl KpiAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn latest_timestamp(&self) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(date_ts) FROM topics")
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_keywords(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT DISTINCT keyword FROM topics ORDER BY keyword")
            .fetch_all(&self.pool)
            .await
    }

    /// First `limit` stored keywords, used to seed views that have no explicit selection.
    pub async fn default_focus_keywords(&self, limit: usize) -> Result<Vec<String>, sqlx::Error> {
        let mut keywords = self.list_keywords().await?;
        keywords.truncate(limit);
        Ok(keywords)
    }

    /// Compare the trailing `window_days` before the newest stored timestamp with
    /// the window before it. `None` when nothing is stored yet.
    ///
    /// Keywords with no rows in the current window are omitted. An empty filter
    /// means all keywords.
    pub async fn compute_kpis(
        &self,
        keyword_filter: Option<&[String]>,
        window_days: u32,
    ) -> Result<Option<Vec<KpiRow>>, sqlx::Error> {
        let Some(d0) = self.latest_timestamp().await? else {
            return Ok(None);
        };
        let window = i64::from(window_days) * SECONDS_PER_DAY;
        let d7 = d0 - window;
        let d14 = d0 - 2 * window;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT keyword, AVG(CASE WHEN date_ts > ");
        qb.push_bind(d7)
            .push(" THEN interest END) AS avg_current, AVG(CASE WHEN date_ts <= ")
            .push_bind(d7)
            .push(" THEN interest END) AS avg_prior, SUM(CASE WHEN date_ts > ")
            .push_bind(d7)
            .push(" THEN 1 ELSE 0 END) AS current_rows FROM topics WHERE date_ts > ")
            .push_bind(d14)
            .push(" AND date_ts <= ")
            .push_bind(d0);
        if let Some(keywords) = keyword_filter.filter(|k| !k.is_empty()) {
            push_keyword_filter(&mut qb, keywords);
        }
        qb.push(" GROUP BY keyword HAVING current_rows > 0 ORDER BY keyword");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(KpiRow::from_window_averages(
                row.try_get::<String, _>("keyword")?,
                row.try_get::<Option<f64>, _>("avg_current")?,
                row.try_get::<Option<f64>, _>("avg_prior")?,
            ));
        }
        Ok(Some(out))
    }

    /// Mean interest per (timestamp, keyword), ordered by timestamp then keyword.
    pub async fn timeseries_for(&self, keywords: &[String]) -> Result<Vec<TimeseriesPoint>, sqlx::Error> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT date_ts, keyword, AVG(interest) AS interest FROM topics WHERE 1 = 1",
        );
        push_keyword_filter(&mut qb, keywords);
        qb.push(" GROUP BY date_ts, keyword ORDER BY date_ts, keyword");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: i64 = row.try_get("date_ts")?;
            out.push(TimeseriesPoint {
                timestamp,
                date: DateTime::from_timestamp(timestamp, 0),
                keyword: row.try_get("keyword")?,
                interest: row.try_get("interest")?,
            });
        }
        Ok(out)
    }
}

fn push_keyword_filter<'a>(qb: &mut QueryBuilder<'a, Sqlite>, keywords: &'a [String]) {
    qb.push(" AND keyword IN (");
    let mut separated = qb.separated(", ");
    for keyword in keywords {
        separated.push_bind(keyword.as_str());
    }
    separated.push_unseparated(")");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default)]
    pub geo: Geo,
}

/// Result of one ingest call. Carries the request context so callers can seed
/// later views without shared mutable state.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub keywords: Vec<String>,
    pub timeframe: Timeframe,
    pub geo: Geo,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub batches: usize,
    pub normalized_rows: usize,
    pub dropped_timestamps: usize,
    pub duplicates_dropped: usize,
    pub unique_rows: usize,
    pub rows_ingested: u64,
    pub raw_snapshots: Vec<String>,
    pub processed_manifest: Option<String>,
}

impl IngestReport {
    pub fn outcome(&self) -> IngestOutcome {
        if self.keywords.is_empty() {
            IngestOutcome::NoKeywords
        } else if self.unique_rows == 0 {
            IngestOutcome::NoData
        } else {
            IngestOutcome::Ingested {
                rows: self.rows_ingested,
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("rate limited after {attempts} attempts for {keywords:?}")]
    RateLimited { attempts: usize, keywords: Vec<String> },
    #[error("provider failure: {0}")]
    Provider(#[source] ProviderError),
    #[error("invalid batch: {0}")]
    InvalidBatch(#[from] CoreError),
    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("snapshot failure: {0:#}")]
    Snapshot(#[source] anyhow::Error),
}

pub fn ingest_outcome(result: &Result<IngestReport, IngestError>) -> IngestOutcome {
    match result {
        Ok(report) => report.outcome(),
        Err(IngestError::RateLimited { .. }) => IngestOutcome::RateLimited,
        Err(err) => IngestOutcome::Failed {
            cause: err.to_string(),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub struct IngestPipeline {
    provider: Arc<dyn TrendsProvider>,
    backoff: BackoffPolicy,
    sink: TrendSink,
    raw_snapshots: Option<SnapshotStore>,
    processed_dir: Option<PathBuf>,
}

impl IngestPipeline {
    pub fn new(provider: Arc<dyn TrendsProvider>, sink: TrendSink) -> Self {
        Self {
            provider,
            backoff: BackoffPolicy::default(),
            sink,
            raw_snapshots: None,
            processed_dir: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_snapshots(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.raw_snapshots = Some(SnapshotStore::new(root.join("raw")));
        self.processed_dir = Some(root.join("processed"));
        self
    }

    pub fn sink(&self) -> &TrendSink {
        &self.sink
    }

    pub fn provider_id(&self) -> &'static str {
        self.provider.provider_id()
    }

    /// Fetch, normalize, de-duplicate and append. Chunks run strictly one after
    /// another; the first unrecoverable chunk failure aborts the call.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport, IngestError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let fetched_at = Utc::now();

        let mut report = IngestReport {
            run_id,
            keywords: request.keywords.clone(),
            timeframe: request.timeframe,
            geo: request.geo,
            started_at,
            finished_at: started_at,
            fetched_at,
            batches: 0,
            normalized_rows: 0,
            dropped_timestamps: 0,
            duplicates_dropped: 0,
            unique_rows: 0,
            rows_ingested: 0,
            raw_snapshots: Vec::new(),
            processed_manifest: None,
        };

        if request.keywords.is_empty() {
            debug!(%run_id, "no keywords requested; nothing to fetch");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let batches = plan_batches(&request.keywords, request.timeframe, request.geo)?;
        report.batches = batches.len();

        let mut points = Vec::new();
        for batch in &batches {
            let span = info_span!("ingest_batch", %run_id, keywords = ?batch.keywords);
            let table = retry_on_rate_limit(&self.backoff, |attempt| {
                debug!(attempt, provider = self.provider.provider_id(), "fetching interest over time");
                self.provider.interest_over_time(batch)
            })
            .instrument(span)
            .await
            .map_err(|err| match err {
                ProviderError::RateLimited => IngestError::RateLimited {
                    attempts: self.backoff.max_attempts.max(1),
                    keywords: batch.keywords.clone(),
                },
                other => IngestError::Provider(other),
            })?;

            if table.is_empty() {
                info!(%run_id, keywords = ?batch.keywords, "provider returned no data for batch");
                continue;
            }

            if let Some(store) = &self.raw_snapshots {
                let stored = store
                    .write_json(fetched_at, &batch.label(), &table)
                    .await
                    .map_err(IngestError::Snapshot)?;
                report
                    .raw_snapshots
                    .push(stored.absolute_path.display().to_string());
            }

            let chunk = normalize_wide_table(&table, fetched_at);
            report.dropped_timestamps += chunk.dropped_timestamps;
            points.extend(chunk.points);
        }

        report.normalized_rows = points.len();
        let unique = dedupe_points(points);
        report.unique_rows = unique.len();
        report.duplicates_dropped = report.normalized_rows - report.unique_rows;

        if let Some(dir) = &self.processed_dir {
            if !unique.is_empty() {
                let manifest = write_processed_snapshot(&dir.join(run_id.to_string()), run_id, &unique)
                    .map_err(IngestError::Snapshot)?;
                report.processed_manifest = Some(manifest.display().to_string());
            }
        }

        report.rows_ingested = self.sink.append(&unique).await?;
        report.finished_at = Utc::now();

        info!(
            %run_id,
            batches = report.batches,
            normalized = report.normalized_rows,
            dropped_timestamps = report.dropped_timestamps,
            duplicates = report.duplicates_dropped,
            ingested = report.rows_ingested,
            "ingest complete"
        );
        Ok(report)
    }
}

/// Wiring shared by the CLI and the web surface.
#[derive(Clone)]
pub struct TrendServices {
    pub pipeline: Arc<IngestPipeline>,
    pub aggregator: KpiAggregator,
}

impl TrendServices {
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let pool = connect_pool(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        let sink = TrendSink::new(pool.clone(), config.append_mode());
        sink.ensure_schema().await.context("ensuring trends schema")?;

        let provider: Arc<dyn TrendsProvider> = match &config.fixture_path {
            Some(path) => {
                info!(path = %path.display(), "using fixture provider");
                Arc::new(FixtureProvider::from_path(path)?)
            }
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                })?;
                Arc::new(GoogleTrendsProvider::new(
                    http,
                    GoogleTrendsConfig {
                        hl: config.hl.clone(),
                        tz_offset_minutes: config.tz_offset_minutes,
                        ..Default::default()
                    },
                ))
            }
        };

        let mut pipeline = IngestPipeline::new(provider, sink);
        if config.snapshots_enabled {
            pipeline = pipeline.with_snapshots(config.snapshots_dir.clone());
        }

        Ok(Self {
            pipeline: Arc::new(pipeline),
            aggregator: KpiAggregator::new(pool),
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(&IngestConfig::from_env()).await
    }
}

fn write_processed_snapshot(dir: &Path, run_id: Uuid, points: &[TrendPoint]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let parquet_path = dir.join("trends_long.parquet");
    write_long_parquet(&parquet_path, points)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        files: vec![manifest_entry("trends_long", dir, &parquet_path, points.len())?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    debug!(path = %manifest_path.display(), "wrote processed snapshot");
    Ok(manifest_path)
}

fn write_long_parquet(path: &Path, points: &[TrendPoint]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date_ts", DataType::Int64, false),
        ArrowField::new("keyword", DataType::Utf8, false),
        ArrowField::new("interest", DataType::Float64, true),
        ArrowField::new("fetched_at", DataType::Utf8, false),
    ]));

    let timestamps = Int64Array::from(points.iter().map(|p| p.timestamp).collect::<Vec<_>>());
    let keywords = StringArray::from(points.iter().map(|p| p.keyword.as_str()).collect::<Vec<_>>());
    let interest = Float64Array::from(points.iter().map(|p| p.interest).collect::<Vec<_>>());
    let fetched_at = StringArray::from(
        points
            .iter()
            .map(|p| p.fetched_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(timestamps),
            Arc::new(keywords),
            Arc::new(interest),
            Arc::new(fetched_at),
        ],
    )
    .context("building trends_long record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: path
            .strip_prefix(base)
            .unwrap_or(path)
            .display()
            .to_string(),
        sha256: SnapshotStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}
