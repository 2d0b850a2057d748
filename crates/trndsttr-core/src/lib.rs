//! Core domain model for TRNDSTTR: request shapes, wide/long trend rows and KPI rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "trndsttr-core";

/// Provider-imposed limit on terms per interest-over-time request.
pub const MAX_KEYWORDS_PER_REQUEST: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown timeframe `{0}`")]
    UnknownTimeframe(String),
    #[error("unknown geo `{0}`")]
    UnknownGeo(String),
    #[error("batch of {0} keywords exceeds the per-request limit of {MAX_KEYWORDS_PER_REQUEST}")]
    BatchTooLarge(usize),
    #[error("batch must contain at least one keyword")]
    EmptyBatch,
}

/// Requested historical window and granularity for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "now 7-d")]
    Last7Days,
    #[default]
    #[serde(rename = "today 3-m")]
    Last3Months,
    #[serde(rename = "today 12-m")]
    Last12Months,
    #[serde(rename = "today 5-y")]
    Last5Years,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [
        Timeframe::Last7Days,
        Timeframe::Last3Months,
        Timeframe::Last12Months,
        Timeframe::Last5Years,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Last7Days => "now 7-d",
            Timeframe::Last3Months => "today 3-m",
            Timeframe::Last12Months => "today 12-m",
            Timeframe::Last5Years => "today 5-y",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CoreError::UnknownTimeframe(s.to_string()))
    }
}

/// Region constraint for a fetch. Worldwide is the empty provider code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Geo {
    #[default]
    UnitedStates,
    Worldwide,
}

impl Geo {
    pub fn code(&self) -> &'static str {
        match self {
            Geo::UnitedStates => "US",
            Geo::Worldwide => "",
        }
    }
}

impl fmt::Display for Geo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geo::UnitedStates => f.write_str("US"),
            Geo::Worldwide => f.write_str("worldwide"),
        }
    }
}

impl FromStr for Geo {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" => Ok(Geo::UnitedStates),
            "" | "worldwide" | "world" => Ok(Geo::Worldwide),
            _ => Err(CoreError::UnknownGeo(s.to_string())),
        }
    }
}

impl TryFrom<String> for Geo {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Geo> for String {
    fn from(value: Geo) -> Self {
        value.code().to_string()
    }
}

/// One provider request worth of keywords. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub keywords: Vec<String>,
    pub timeframe: Timeframe,
    pub geo: Geo,
}

impl IngestionBatch {
    pub fn new(keywords: Vec<String>, timeframe: Timeframe, geo: Geo) -> Result<Self, CoreError> {
        if keywords.is_empty() {
            return Err(CoreError::EmptyBatch);
        }
        if keywords.len() > MAX_KEYWORDS_PER_REQUEST {
            return Err(CoreError::BatchTooLarge(keywords.len()));
        }
        Ok(Self {
            keywords,
            timeframe,
            geo,
        })
    }

    /// Short filesystem-safe label used for snapshot paths.
    pub fn label(&self) -> String {
        let joined = self
            .keywords
            .iter()
            .map(|k| {
                k.to_ascii_lowercase()
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("_");
        let trimmed: String = joined.chars().take(80).collect();
        if trimmed.is_empty() {
            "batch".to_string()
        } else {
            trimmed
        }
    }
}

/// Wide-form provider response: one row per time bucket, one column per keyword.
///
/// Column names are carried verbatim from the provider. The time bucket lives in
/// [`WideTable::TIME_COLUMN`] and the optional still-accumulating flag in
/// [`WideTable::PARTIAL_COLUMN`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WideTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<JsonValue>>,
}

impl WideTable {
    pub const TIME_COLUMN: &'static str = "date";
    pub const PARTIAL_COLUMN: &'static str = "isPartial";

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Copy of the table limited to the time column, the partial flag and `keywords`.
    /// Keyword columns keep the order given by `keywords`; unknown keywords are skipped.
    pub fn select_keywords(&self, keywords: &[String]) -> WideTable {
        let mut picked = Vec::new();
        for fixed in [Self::TIME_COLUMN, Self::PARTIAL_COLUMN] {
            if let Some(idx) = self.column_index(fixed) {
                picked.push(idx);
            }
        }
        for keyword in keywords {
            if let Some(idx) = self.column_index(keyword) {
                picked.push(idx);
            }
        }

        WideTable {
            columns: picked.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| {
                    picked
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(JsonValue::Null))
                        .collect()
                })
                .collect(),
        }
    }
}

/// Persisted long-form row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub keyword: String,
    /// Epoch seconds, UTC.
    pub timestamp: i64,
    pub interest: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl TrendPoint {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// Week-over-week comparison for one keyword. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiRow {
    pub keyword: String,
    pub avg_current: Option<f64>,
    pub avg_prior: f64,
    pub delta: Option<f64>,
    pub pct_change: Option<f64>,
}

impl KpiRow {
    /// A keyword absent from the prior window compares against zero; percent
    /// change stays undefined whenever the prior average is zero.
    pub fn from_window_averages(
        keyword: impl Into<String>,
        avg_current: Option<f64>,
        avg_prior: Option<f64>,
    ) -> Self {
        let avg_prior = avg_prior.unwrap_or(0.0);
        let delta = avg_current.map(|current| current - avg_prior);
        let pct_change = match delta {
            Some(delta) if avg_prior != 0.0 => Some(delta / avg_prior * 100.0),
            _ => None,
        };
        Self {
            keyword: keyword.into(),
            avg_current,
            avg_prior,
            delta,
            pct_change,
        }
    }
}

/// Headline numbers over a KPI result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub keywords_tracked: usize,
    pub total_interest: i64,
    pub top_mover: Option<String>,
}

impl KpiSummary {
    pub fn from_rows(rows: &[KpiRow]) -> Self {
        let mut keywords: Vec<&str> = rows.iter().map(|r| r.keyword.as_str()).collect();
        keywords.sort_unstable();
        keywords.dedup();

        let total: f64 = rows.iter().filter_map(|r| r.avg_current).sum();

        let top_mover = rows
            .iter()
            .filter_map(|r| r.delta.map(|d| (d, r.keyword.as_str())))
            .fold(None::<(f64, &str)>, |best, (delta, keyword)| match best {
                Some((best_delta, _)) if best_delta >= delta => best,
                _ => Some((delta, keyword)),
            })
            .map(|(_, keyword)| keyword.to_string());

        Self {
            keywords_tracked: keywords.len(),
            total_interest: total.trunc() as i64,
            top_mover,
        }
    }
}

/// Read-path row for charting: mean interest per (timestamp, keyword).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub timestamp: i64,
    pub date: Option<DateTime<Utc>>,
    pub keyword: String,
    pub interest: Option<f64>,
}

/// User-facing result of one ingest request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Ingested { rows: u64 },
    NoKeywords,
    NoData,
    RateLimited,
    Failed { cause: String },
}

impl IngestOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            IngestOutcome::Ingested { .. } => "ingested",
            IngestOutcome::NoKeywords => "no_keywords",
            IngestOutcome::NoData => "no_data",
            IngestOutcome::RateLimited => "rate_limited",
            IngestOutcome::Failed { .. } => "failed",
        }
    }

    pub fn rows(&self) -> u64 {
        match self {
            IngestOutcome::Ingested { rows } => *rows,
            _ => 0,
        }
    }

    pub fn message(&self) -> String {
        match self {
            IngestOutcome::Ingested { rows } => format!("Ingested {rows} rows."),
            IngestOutcome::NoKeywords => "Add at least one keyword.".to_string(),
            IngestOutcome::NoData => {
                "No data returned. Try different keywords/timeframe.".to_string()
            }
            IngestOutcome::RateLimited => {
                "Trends rate limit hit (429). Please wait a minute and try again.".to_string()
            }
            IngestOutcome::Failed { cause } => format!("Fetch failed: {cause}"),
        }
    }
}

/// Split comma-separated user input into trimmed, non-empty keywords.
pub fn parse_keyword_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}
