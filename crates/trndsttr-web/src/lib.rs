//! Axum JSON surface over the ingest pipeline and the KPI read path.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use trndsttr_core::{
    parse_keyword_list, Geo, IngestOutcome, KpiRow, KpiSummary, Timeframe, TimeseriesPoint,
};
use trndsttr_sync::{ingest_outcome, IngestRequest, TrendServices, DEFAULT_WINDOW_DAYS};

pub const CRATE_NAME: &str = "trndsttr-web";

const DEFAULT_FOCUS_KEYWORDS: usize = 3;
const TOP_MOVERS_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    keywords: Vec<String>,
    timeframe: Timeframe,
    geo: Geo,
}

impl CacheKey {
    fn for_request(request: &IngestRequest) -> Self {
        let mut keywords: Vec<String> = request
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .collect();
        // Order ignores case; the keywords themselves keep it, as storage does.
        keywords.sort_by_key(|k| k.to_lowercase());
        Self {
            keywords,
            timeframe: request.timeframe,
            geo: request.geo,
        }
    }
}

pub struct AppState {
    pub services: TrendServices,
    cache_ttl: Duration,
    cache: Mutex<HashMap<CacheKey, (Instant, IngestOutcome)>>,
}

impl AppState {
    pub fn new(services: TrendServices, cache_ttl: Duration) -> Self {
        Self {
            services,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached_outcome(&self, key: &CacheKey) -> Option<IngestOutcome> {
        let mut cache = self.cache.lock().ok()?;
        let fresh = cache
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.cache_ttl)
            .map(|(_, outcome)| outcome.clone());
        if fresh.is_none() {
            cache.remove(key);
        }
        fresh
    }

    fn remember(&self, key: CacheKey, outcome: IngestOutcome) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|_, (stored_at, _)| stored_at.elapsed() < self.cache_ttl);
            cache.insert(key, (Instant::now(), outcome));
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum KeywordInput {
    List(Vec<String>),
    Text(String),
}

impl KeywordInput {
    fn into_keywords(self) -> Vec<String> {
        match self {
            KeywordInput::List(items) => items
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            KeywordInput::Text(text) => parse_keyword_list(&text),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    #[serde(default)]
    keywords: Option<KeywordInput>,
    #[serde(default)]
    timeframe: Timeframe,
    #[serde(default)]
    geo: Geo,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub rows: u64,
    pub message: String,
    pub cached: bool,
    pub keywords: Vec<String>,
    pub timeframe: Timeframe,
    pub geo: Geo,
}

impl IngestResponse {
    fn new(request: &IngestRequest, outcome: &IngestOutcome, cached: bool) -> Self {
        Self {
            status: outcome.status(),
            rows: outcome.rows(),
            message: outcome.message(),
            cached,
            keywords: request.keywords.clone(),
            timeframe: request.timeframe,
            geo: request.geo,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KpisQuery {
    keywords: Option<String>,
    window_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct KpisResponse {
    keywords: Vec<String>,
    window_days: u32,
    rows: Vec<KpiRow>,
    top_movers: Vec<KpiRow>,
    summary: KpiSummary,
}

#[derive(Debug, Deserialize)]
struct TimeseriesQuery {
    keywords: Option<String>,
}

#[derive(Debug, Serialize)]
struct TimeseriesResponse {
    keywords: Vec<String>,
    points: Vec<TimeseriesPoint>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/ingest", post(ingest_handler))
        .route("/keywords", get(keywords_handler))
        .route("/kpis", get(kpis_handler))
        .route("/timeseries", get(timeseries_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TRNDSTTR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let cache_ttl_secs: u64 = std::env::var("TRNDSTTR_CACHE_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600);
    let services = TrendServices::from_env().await?;
    let state = AppState::new(services, Duration::from_secs(cache_ttl_secs));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, cache_ttl_secs, "serving trends api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn ingest_handler(State(state): State<Arc<AppState>>, Json(body): Json<IngestBody>) -> Response {
    let request = IngestRequest {
        keywords: body.keywords.map(KeywordInput::into_keywords).unwrap_or_default(),
        timeframe: body.timeframe,
        geo: body.geo,
    };

    if request.keywords.is_empty() {
        return ingest_response(&request, &IngestOutcome::NoKeywords, false);
    }

    let key = CacheKey::for_request(&request);
    if let Some(outcome) = state.cached_outcome(&key) {
        debug!(keywords = ?request.keywords, "ingest served from cache");
        return ingest_response(&request, &outcome, true);
    }

    let result = state.services.pipeline.ingest(&request).await;
    if let Err(err) = &result {
        warn!(error = %err, keywords = ?request.keywords, "ingest failed");
    }
    let outcome = ingest_outcome(&result);
    if matches!(outcome, IngestOutcome::Ingested { .. } | IngestOutcome::NoData) {
        state.remember(key, outcome.clone());
    }
    ingest_response(&request, &outcome, false)
}

fn ingest_response(request: &IngestRequest, outcome: &IngestOutcome, cached: bool) -> Response {
    let status = match outcome {
        IngestOutcome::Ingested { .. } | IngestOutcome::NoData => StatusCode::OK,
        IngestOutcome::NoKeywords => StatusCode::BAD_REQUEST,
        IngestOutcome::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        IngestOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, Json(IngestResponse::new(request, outcome, cached))).into_response()
}

async fn keywords_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.aggregator.list_keywords().await {
        Ok(keywords) => Json(keywords).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn kpis_handler(State(state): State<Arc<AppState>>, Query(query): Query<KpisQuery>) -> Response {
    let aggregator = &state.services.aggregator;
    let window_days = query.window_days.filter(|d| *d > 0).unwrap_or(DEFAULT_WINDOW_DAYS);

    let mut keywords = query.keywords.as_deref().map(parse_keyword_list).unwrap_or_default();
    if keywords.is_empty() {
        keywords = match aggregator.default_focus_keywords(DEFAULT_FOCUS_KEYWORDS).await {
            Ok(focus) => focus,
            Err(err) => return server_error(err.into()),
        };
    }

    match aggregator.compute_kpis(Some(&keywords), window_days).await {
        Ok(rows) => {
            let rows = rows.unwrap_or_default();
            Json(KpisResponse {
                summary: KpiSummary::from_rows(&rows),
                top_movers: top_movers(&rows, TOP_MOVERS_LIMIT),
                keywords,
                window_days,
                rows,
            })
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn timeseries_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimeseriesQuery>,
) -> Response {
    let keywords = query.keywords.as_deref().map(parse_keyword_list).unwrap_or_default();
    match state.services.aggregator.timeseries_for(&keywords).await {
        Ok(points) => Json(TimeseriesResponse { keywords, points }).into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Rows ordered by delta, largest gain first; rows without a delta sort last.
fn top_movers(rows: &[KpiRow], limit: usize) -> Vec<KpiRow> {
    let mut sorted = rows.to_vec();
    sorted.sort_by(|a, b| match (a.delta, b.delta) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    sorted.truncate(limit);
    sorted
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
