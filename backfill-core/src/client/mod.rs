//! Fetch clients and their error taxonomy.
//!
//! The [`FetchClient`] trait abstracts over the two Benchmarks endpoint shapes
//! (windowed price updates, TradingView-style bar history) so the orchestrator
//! can be driven by a scripted fake in tests.

pub mod history;
pub mod updates;

pub use history::{BarHistoryClient, Resolution};
pub use updates::{normalize_feed_id, PointSelection, PriceUpdatesClient};

use crate::domain::TimeWindow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Public Benchmarks API root.
pub const DEFAULT_BASE_URL: &str = "https://benchmarks.pyth.network";

/// Errors from a single fetch. The variant decides the caller's retry policy.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// HTTP 429. Cool down, then retry the same window.
    #[error("rate limited by provider")]
    RateLimited,

    /// Network failure or 5xx. Retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Payload could not be parsed. Retrying will not help.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Any other 4xx. The request itself is wrong; retrying will not help.
    #[error("request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited | FetchError::Transient(_))
    }
}

/// Successful result of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<T> {
    /// Points in ascending timestamp order.
    pub points: Vec<T>,
    /// Set when the server stopped short of the window end: the
    /// `[resume_at, window.end)` tail still needs fetching.
    pub resume_at: Option<i64>,
}

impl<T> FetchOutcome<T> {
    pub fn complete(points: Vec<T>) -> Self {
        Self {
            points,
            resume_at: None,
        }
    }

    pub fn empty() -> Self {
        Self::complete(Vec::new())
    }
}

/// One request per call, one window per request.
pub trait FetchClient<T>: Send + Sync {
    /// Human-readable name of this endpoint.
    fn name(&self) -> &str;

    fn fetch(&self, window: &TimeWindow) -> Result<FetchOutcome<T>, FetchError>;
}

impl<T, C: FetchClient<T> + ?Sized> FetchClient<T> for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch(&self, window: &TimeWindow) -> Result<FetchOutcome<T>, FetchError> {
        (**self).fetch(window)
    }
}

/// Shared blocking HTTP client with a request timeout.
pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::blocking::Client, FetchError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("pyth-backfill/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetchError::Transient(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success status to the taxonomy. `None` means the caller should
/// treat the response as "no data".
pub(crate) fn classify_status(status: u16, body: &str) -> Option<FetchError> {
    match status {
        429 => Some(FetchError::RateLimited),
        404 => None,
        408 | 500..=599 => Some(FetchError::Transient(format!("HTTP {status}"))),
        _ => Some(FetchError::Rejected {
            status,
            body: truncate(body, 200),
        }),
    }
}

pub(crate) fn classify_transport(e: &reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Malformed(e.to_string())
    }
}

/// Issue a GET and hand back the body of a 2xx response.
///
/// `Ok(None)` is a 404, which both endpoints use for "nothing in this range".
pub(crate) fn get_body(
    client: &reqwest::blocking::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<Option<String>, FetchError> {
    let resp = client
        .get(url)
        .query(query)
        .send()
        .map_err(|e| classify_transport(&e))?;
    let status = resp.status();
    let body = resp.text().map_err(|e| classify_transport(&e))?;
    if status.is_success() {
        return Ok(Some(body));
    }
    match classify_status(status.as_u16(), &body) {
        Some(err) => Err(err),
        None => Ok(None),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
