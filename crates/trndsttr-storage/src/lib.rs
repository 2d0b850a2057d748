//! Immutable snapshot storage, single-shot HTTP fetching and rate-limit backoff for TRNDSTTR.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trndsttr-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once store for raw provider responses, one JSON document per fetched chunk.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<YYYYmmdd_HHMMSS>/<label>/<sha256>.json`, relative to the store root.
    pub fn snapshot_relative_path(&self, fetched_at: DateTime<Utc>, label: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(label)
            .join(format!("{content_hash}.json"))
    }

    /// Serialize `payload` and file it under its content hash. A payload already
    /// stored for the same fetch time and label is reported as deduplicated.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        payload: &T,
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec(payload).context("serializing snapshot payload")?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.snapshot_relative_path(fetched_at, label, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let created = publish_once(&absolute_path, &bytes).await?;
        if !created {
            debug!(path = %absolute_path.display(), "snapshot already present");
        }

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !created,
        })
    }
}

/// Place `bytes` at `target` unless something is already there. Readers never
/// see a partial file: content is staged next to the target and renamed in.
async fn publish_once(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = target
        .parent()
        .with_context(|| format!("snapshot path {} has no parent", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking snapshot path {}", target.display()))?
    {
        return Ok(false);
    }

    let staging = parent.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&staging, bytes)
        .await
        .with_context(|| format!("staging snapshot {}", staging.display()))?;
    if let Err(err) = fs::rename(&staging, target).await {
        let _ = fs::remove_file(&staging).await;
        return Err(err).with_context(|| format!("publishing snapshot {}", target.display()));
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Other,
}

pub fn classify_status(status: StatusCode) -> FailureKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        FailureKind::RateLimited
    } else {
        FailureKind::Other
    }
}

/// Errors that can tell the retrier whether they mean "slow down".
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;
}

/// Bounded exponential backoff applied only to rate-limit failures.
///
/// Attempt 1 runs immediately; attempt `n > 1` waits
/// `min(base_delay * 2^(n-2), max_delay)` plus up to `max_jitter`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            max_jitter: Duration::from_millis(700),
        }
    }
}

impl BackoffPolicy {
    /// Same attempt budget without any waiting. Used for fixtures and tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_before_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl((attempt - 2) as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay_before_attempt(&self, attempt: usize) -> Duration {
        let delay = self.delay_before_attempt(attempt);
        if attempt <= 1 || self.max_jitter.is_zero() {
            return delay;
        }
        let max_jitter_ms = self.max_jitter.as_millis() as u64;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
    }
}

/// Run `operation` until it succeeds, fails with a non-rate-limit error, or the
/// attempt budget is spent. The closure receives the 1-based attempt number.
pub async fn retry_on_rate_limit<T, E, F, Fut>(policy: &BackoffPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RateLimitSignal + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limited() && attempt < max_attempts => {
                let delay = policy.jittered_delay_before_attempt(attempt + 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited; backing off before retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_rate_limited() {
                    warn!(attempt, "rate limit persisted after final attempt");
                }
                return Err(err);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureKind::Other),
            _ => FailureKind::Other,
        }
    }
}

impl RateLimitSignal for FetchError {
    fn is_rate_limited(&self) -> bool {
        self.failure_kind() == FailureKind::RateLimited
    }
}

/// Thin reqwest wrapper: one GET per call, no retries of its own.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str, params: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let url = reqwest::Url::parse_with_params(url, params)
            .map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        let span = info_span!("http_fetch", host = url.host_str().unwrap_or(""), path = url.path());

        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Debug)]
    enum TestError {
        Limited,
        Broken,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RateLimitSignal for TestError {
        fn is_rate_limited(&self) -> bool {
            matches!(self, TestError::Limited)
        }
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_share_one_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .write_json(fetched_at, "taylor-swift", &serde_json::json!({ "columns": [] }))
            .await
            .expect("first write");
        let second = store
            .write_json(fetched_at, "taylor-swift", &serde_json::json!({ "columns": [] }))
            .await
            .expect("second write");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20260224_120000").join("taylor-swift")));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn snapshot_holds_the_serialized_payload_only() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let fetched_at = Utc::now();
        let payload = serde_json::json!({ "columns": ["date", "rust"], "rows": [["2026-09-01", 40]] });

        let stored = store
            .write_json(fetched_at, "rust", &payload)
            .await
            .expect("write");
        assert_eq!(stored.absolute_path.extension().and_then(|e| e.to_str()), Some("json"));

        let on_disk = std::fs::read(&stored.absolute_path).expect("read back");
        assert_eq!(stored.byte_size, on_disk.len());
        assert_eq!(stored.content_hash, SnapshotStore::sha256_hex(&on_disk));
        let parsed: serde_json::Value = serde_json::from_slice(&on_disk).expect("json");
        assert_eq!(parsed, payload);

        let siblings: Vec<_> = std::fs::read_dir(stored.absolute_path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1, "staging files must not linger: {siblings:?}");
    }

    #[test]
    fn default_schedule_doubles_from_two_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_before_attempt(9), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.jittered_delay_before_attempt(1), Duration::ZERO);
        for _ in 0..50 {
            let d = policy.jittered_delay_before_attempt(3);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_millis(4700));
        }
    }

    #[test]
    fn only_429_counts_as_rate_limited() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::RateLimited);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureKind::Other);
        let err = FetchError::HttpStatus {
            status: 429,
            url: "https://example.test".into(),
        };
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn persistent_rate_limit_uses_full_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = retry_on_rate_limit(&BackoffPolicy::immediate(4), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Limited) }
        })
        .await;
        assert!(matches!(result, Err(TestError::Limited)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), TestError> = retry_on_rate_limit(&BackoffPolicy::immediate(4), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Broken) }
        })
        .await;
        assert!(matches!(result, Err(TestError::Broken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_once_the_limit_lifts() {
        let result: Result<usize, TestError> =
            retry_on_rate_limit(&BackoffPolicy::immediate(4), |attempt| async move {
                if attempt < 3 {
                    Err(TestError::Limited)
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }
}
