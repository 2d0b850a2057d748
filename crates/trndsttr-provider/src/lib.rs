//! Trends provider contract plus the Google Trends and fixture-backed implementations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use trndsttr_core::{IngestionBatch, WideTable};
use trndsttr_storage::{FetchError, HttpFetcher, RateLimitSignal};

pub const CRATE_NAME: &str = "trndsttr-provider";

pub const GOOGLE_TRENDS_BASE_URL: &str = "https://trends.google.com";

const TIMESERIES_WIDGET_ID: &str = "TIMESERIES";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limit hit (429)")]
    RateLimited,
    #[error(transparent)]
    Fetch(FetchError),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

impl From<FetchError> for ProviderError {
    fn from(err: FetchError) -> Self {
        if err.is_rate_limited() {
            ProviderError::RateLimited
        } else {
            ProviderError::Fetch(err)
        }
    }
}

impl RateLimitSignal for ProviderError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited)
    }
}

/// One interest-over-time lookup for at most five keywords.
///
/// Implementations perform exactly one logical round trip and surface the
/// provider's failure unchanged; retries belong to the caller.
#[async_trait]
pub trait TrendsProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn interest_over_time(&self, batch: &IngestionBatch) -> Result<WideTable, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GoogleTrendsConfig {
    pub base_url: String,
    pub hl: String,
    pub tz_offset_minutes: i32,
}

impl Default for GoogleTrendsConfig {
    fn default() -> Self {
        Self {
            base_url: GOOGLE_TRENDS_BASE_URL.to_string(),
            hl: "en-US".to_string(),
            tz_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GoogleTrendsProvider {
    http: HttpFetcher,
    config: GoogleTrendsConfig,
}

impl GoogleTrendsProvider {
    pub fn new(http: HttpFetcher, config: GoogleTrendsConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TrendsProvider for GoogleTrendsProvider {
    fn provider_id(&self) -> &'static str {
        "google-trends"
    }

    async fn interest_over_time(&self, batch: &IngestionBatch) -> Result<WideTable, ProviderError> {
        let tz = self.config.tz_offset_minutes.to_string();
        let explore = self
            .http
            .get(
                &self.endpoint("/trends/api/explore"),
                &[
                    ("hl", self.config.hl.clone()),
                    ("tz", tz.clone()),
                    ("req", explore_request(batch).to_string()),
                ],
            )
            .await?;
        let widget = timeseries_widget(&explore.text())?;

        let multiline = self
            .http
            .get(
                &self.endpoint("/trends/api/widgetdata/multiline"),
                &[
                    ("hl", self.config.hl.clone()),
                    ("tz", tz),
                    ("req", widget.request.to_string()),
                    ("token", widget.token),
                ],
            )
            .await?;

        let table = parse_multiline(&multiline.text(), &batch.keywords)?;
        debug!(rows = table.rows.len(), keywords = ?batch.keywords, "parsed timeline");
        Ok(table)
    }
}

pub fn explore_request(batch: &IngestionBatch) -> JsonValue {
    let items: Vec<JsonValue> = batch
        .keywords
        .iter()
        .map(|keyword| {
            json!({
                "keyword": keyword,
                "time": batch.timeframe.as_str(),
                "geo": batch.geo.code(),
            })
        })
        .collect();
    json!({ "comparisonItem": items, "category": 0, "property": "" })
}

/// Responses are prefixed with an anti-JSON-hijacking guard such as `)]}'`.
pub fn strip_json_guard(body: &str) -> &str {
    match body.find('{') {
        Some(idx) => &body[idx..],
        None => body,
    }
}

#[derive(Debug, Clone)]
pub struct TimeseriesWidget {
    pub token: String,
    pub request: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ExploreResponse {
    #[serde(default)]
    widgets: Vec<ExploreWidget>,
}

#[derive(Debug, Deserialize)]
struct ExploreWidget {
    #[serde(default)]
    id: String,
    token: Option<String>,
    request: Option<JsonValue>,
}

pub fn timeseries_widget(body: &str) -> Result<TimeseriesWidget, ProviderError> {
    let explore: ExploreResponse = serde_json::from_str(strip_json_guard(body))
        .map_err(|e| ProviderError::Malformed(format!("explore payload: {e}")))?;
    let widget = explore
        .widgets
        .into_iter()
        .find(|w| w.id == TIMESERIES_WIDGET_ID)
        .ok_or_else(|| ProviderError::Malformed("explore payload has no TIMESERIES widget".into()))?;
    match (widget.token, widget.request) {
        (Some(token), Some(request)) => Ok(TimeseriesWidget { token, request }),
        _ => Err(ProviderError::Malformed(
            "TIMESERIES widget is missing token or request".into(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct MultilineResponse {
    #[serde(default)]
    default: MultilineBody,
}

#[derive(Debug, Default, Deserialize)]
struct MultilineBody {
    #[serde(rename = "timelineData", default)]
    timeline_data: Vec<TimelinePoint>,
}

#[derive(Debug, Deserialize)]
struct TimelinePoint {
    time: JsonValue,
    #[serde(default)]
    value: Vec<JsonValue>,
    #[serde(rename = "isPartial", default)]
    is_partial: bool,
}

/// Map a multiline timeline payload to a wide table with one column per keyword.
/// A payload without timeline points yields an empty table.
pub fn parse_multiline(body: &str, keywords: &[String]) -> Result<WideTable, ProviderError> {
    let parsed: MultilineResponse = serde_json::from_str(strip_json_guard(body))
        .map_err(|e| ProviderError::Malformed(format!("multiline payload: {e}")))?;
    if parsed.default.timeline_data.is_empty() {
        return Ok(WideTable::default());
    }

    let mut columns = Vec::with_capacity(keywords.len() + 2);
    columns.push(WideTable::TIME_COLUMN.to_string());
    columns.extend(keywords.iter().cloned());
    columns.push(WideTable::PARTIAL_COLUMN.to_string());

    let rows = parsed
        .default
        .timeline_data
        .into_iter()
        .map(|point| {
            let mut row = Vec::with_capacity(keywords.len() + 2);
            row.push(point.time);
            for i in 0..keywords.len() {
                row.push(point.value.get(i).cloned().unwrap_or(JsonValue::Null));
            }
            row.push(JsonValue::Bool(point.is_partial));
            row
        })
        .collect();

    Ok(WideTable { columns, rows })
}

/// Serves interest data from a wide-table JSON file instead of the network.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    source_path: PathBuf,
    table: WideTable,
}

impl FixtureProvider {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            source_path: path.to_path_buf(),
            table: load_wide_table_fixture(path)?,
        })
    }

    pub fn from_table(table: WideTable) -> Self {
        Self {
            source_path: PathBuf::from("<inline>"),
            table,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }
}

#[async_trait]
impl TrendsProvider for FixtureProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn interest_over_time(&self, batch: &IngestionBatch) -> Result<WideTable, ProviderError> {
        let any_known = batch
            .keywords
            .iter()
            .any(|k| self.table.column_index(k).is_some());
        if !any_known {
            return Ok(WideTable::default());
        }
        Ok(self.table.select_keywords(&batch.keywords))
    }
}

pub fn load_wide_table_fixture(path: impl AsRef<Path>) -> Result<WideTable> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trndsttr_core::{Geo, Timeframe};

    fn batch(keywords: &[&str]) -> IngestionBatch {
        IngestionBatch::new(
            keywords.iter().map(|k| k.to_string()).collect(),
            Timeframe::Last3Months,
            Geo::UnitedStates,
        )
        .unwrap()
    }

    #[test]
    fn explore_request_lists_one_item_per_keyword() {
        let req = explore_request(&batch(&["a", "b"]));
        let items = req["comparisonItem"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["keyword"], "b");
        assert_eq!(items[0]["time"], "today 3-m");
        assert_eq!(items[0]["geo"], "US");
    }

    #[test]
    fn finds_timeseries_widget_behind_guard() {
        let body = r#")]}'
{"widgets":[{"id":"GEO_MAP","token":"x","request":{}},{"id":"TIMESERIES","token":"tok","request":{"time":"today 3-m"}}]}"#;
        let widget = timeseries_widget(body).unwrap();
        assert_eq!(widget.token, "tok");
        assert_eq!(widget.request["time"], "today 3-m");
    }

    #[test]
    fn missing_widget_is_malformed() {
        let err = timeseries_widget(r#")]}'{"widgets":[]}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn multiline_payload_becomes_wide_table() {
        let body = r#")]}',
{"default":{"timelineData":[
  {"time":"1700000000","formattedTime":"Nov 14, 2023","value":[10,20],"hasData":[true,true]},
  {"time":"1700086400","value":[11],"isPartial":true}
]}}"#;
        let keywords = vec!["a".to_string(), "b".to_string()];
        let table = parse_multiline(body, &keywords).unwrap();
        assert_eq!(table.columns, vec!["date", "a", "b", "isPartial"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][1], json!(10));
        assert_eq!(table.rows[1][2], JsonValue::Null);
        assert_eq!(table.rows[1][3], json!(true));
    }

    #[test]
    fn empty_timeline_is_not_an_error() {
        let table = parse_multiline(r#")]}',{"default":{"timelineData":[]}}"#, &["a".into()]).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn http_429_maps_to_rate_limited() {
        let err: ProviderError = FetchError::HttpStatus {
            status: 429,
            url: "https://trends.google.com/trends/api/explore".into(),
        }
        .into();
        assert!(err.is_rate_limited());

        let err: ProviderError = FetchError::HttpStatus {
            status: 500,
            url: "https://trends.google.com/trends/api/explore".into(),
        }
        .into();
        assert!(!err.is_rate_limited());
    }

    #[tokio::test]
    async fn fixture_provider_returns_empty_for_unknown_terms() {
        let provider = FixtureProvider::from_table(WideTable {
            columns: vec!["date".into(), "a".into()],
            rows: vec![vec![json!("2026-01-01"), json!(5)]],
        });
        let known = provider.interest_over_time(&batch(&["a"])).await.unwrap();
        assert_eq!(known.rows.len(), 1);
        let unknown = provider.interest_over_time(&batch(&["zzz"])).await.unwrap();
        assert!(unknown.is_empty());
    }
}
