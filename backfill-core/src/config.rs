//! Run configuration: TOML file, built-in presets, validation.
//!
//! ```toml
//! [source]
//! endpoint = "updates"
//! feed_id = "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43"
//! selection = "first"
//!
//! [range]
//! days_back = 365
//! window_secs = 60
//!
//! [rate_limit]
//! max_requests = 90
//! period_secs = 10
//! delay_ms = 120
//!
//! [output]
//! csv = "data/pyth_btc_usd_1min_1y.csv"
//! json = "data/pyth_btc_usd_1min_1y.json"
//! ```

use crate::checkpoint::series_key;
use crate::client::{normalize_feed_id, PointSelection, Resolution};
use crate::planner::align_down;
use crate::rate_limiter::effective_delay;
use crate::sink::sql::validate_table_name;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// BTC/USD price feed.
pub const BTC_USD_FEED_ID: &str =
    "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43";

/// BTC/USD symbol on the bar-history endpoint.
pub const BTC_USD_SYMBOL: &str = "Crypto.BTC/USD";

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown preset '{0}' (valid: minute, second, daily)")]
    UnknownPreset(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ── Presets ─────────────────────────────────────────────────────────

/// The three stock backfills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// One price per minute from the updates endpoint, to CSV and JSON.
    Minute,
    /// Every update (about one per second) from the updates endpoint, to a database table.
    Second,
    /// Daily OHLC bars from the history endpoint, to CSV and JSON.
    Daily,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Minute, Preset::Second, Preset::Daily];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Minute => "minute",
            Preset::Second => "second",
            Preset::Daily => "daily",
        }
    }

    pub fn config(&self) -> FetchConfig {
        match self {
            Preset::Minute => FetchConfig {
                source: SourceConfig::updates(BTC_USD_FEED_ID, PointSelection::First),
                range: RangeConfig::days_back(365, 60),
                rate_limit: RateLimitConfig {
                    max_requests: 90,
                    period_secs: 10,
                    delay_ms: 120,
                    cooldown_secs: 60,
                },
                retry: RetryConfig::default(),
                output: OutputConfig {
                    csv: Some(PathBuf::from("data/pyth_btc_usd_1min_1y.csv")),
                    json: Some(PathBuf::from("data/pyth_btc_usd_1min_1y.json")),
                    // The JSON file is rewritten whole on every commit.
                    commit_every: 100,
                    ..OutputConfig::default()
                },
            },
            Preset::Second => FetchConfig {
                source: SourceConfig::updates(BTC_USD_FEED_ID, PointSelection::All),
                range: RangeConfig::days_back(365, 60),
                rate_limit: RateLimitConfig {
                    max_requests: 30,
                    period_secs: 10,
                    delay_ms: 350,
                    cooldown_secs: 60,
                },
                retry: RetryConfig::default(),
                output: OutputConfig {
                    db_table: Some("pyth_btc_usd_1sec".to_string()),
                    ..OutputConfig::default()
                },
            },
            Preset::Daily => FetchConfig {
                source: SourceConfig {
                    base_url: None,
                    timeout_secs: 30,
                    endpoint: EndpointConfig::History {
                        symbol: BTC_USD_SYMBOL.to_string(),
                        resolution: Resolution::Day,
                    },
                },
                range: RangeConfig::days_back(365, 90 * SECONDS_PER_DAY),
                rate_limit: RateLimitConfig::default(),
                retry: RetryConfig::default(),
                output: OutputConfig {
                    csv: Some(PathBuf::from("data/pyth_btc_usd_1y.csv")),
                    json: Some(PathBuf::from("data/pyth_btc_usd_1y.json")),
                    commit_every: 100,
                    ..OutputConfig::default()
                },
            },
        }
    }
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownPreset(s.to_string()))
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub source: SourceConfig,
    pub range: RangeConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Preset::Minute.config()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Defaults to the public Benchmarks API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
}

fn default_timeout_secs() -> u64 {
    30
}

impl SourceConfig {
    pub fn updates(feed_id: &str, selection: PointSelection) -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
            endpoint: EndpointConfig::Updates {
                feed_id: feed_id.to_string(),
                selection,
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::updates(BTC_USD_FEED_ID, PointSelection::First)
    }
}

/// Which endpoint shape to query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "endpoint", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// Windowed price updates (`/v1/updates/price/...`), yields price points.
    Updates {
        feed_id: String,
        #[serde(default)]
        selection: PointSelection,
    },
    /// Bar history (`/v1/shims/tradingview/history`), yields OHLC bars.
    History { symbol: String, resolution: Resolution },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Explicit range start (Unix seconds). Overrides `days_back`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Explicit range end (Unix seconds, exclusive). Defaults to now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// Range length when `start` is not given.
    pub days_back: u32,
    pub window_secs: i64,
}

/// Longest allowed window.
pub const MAX_WINDOW_SECS: i64 = 366 * 86_400;

impl RangeConfig {
    pub fn days_back(days: u32, window_secs: i64) -> Self {
        Self {
            start: None,
            end: None,
            days_back: days,
            window_secs,
        }
    }

    /// Concrete `[start, end)` for a run starting at `now`.
    ///
    /// Bounds derived from the clock or from `days_back` are aligned down to
    /// `align` seconds; explicit bounds are used as given.
    pub fn resolve(&self, now: i64, align: i64) -> Result<(i64, i64), ConfigError> {
        let end = self.end.unwrap_or_else(|| align_down(now, align));
        let start = match self.start {
            Some(s) => s,
            None => align_down(end - i64::from(self.days_back) * SECONDS_PER_DAY, align),
        };
        if start >= end {
            return Err(invalid(format!("range start {start} is not before end {end}")));
        }
        Ok((start, end))
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self::days_back(365, 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// At most this many requests per `period_secs`.
    pub max_requests: u32,
    pub period_secs: u64,
    /// Minimum spacing between requests.
    pub delay_ms: u64,
    /// Wait after a throttling response.
    pub cooldown_secs: u64,
}

impl RateLimitConfig {
    pub fn pacing_delay(&self) -> Duration {
        effective_delay(
            self.max_requests,
            Duration::from_secs(self.period_secs),
            Duration::from_millis(self.delay_ms),
        )
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            period_secs: 10,
            delay_ms: 350,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per window for transient failures (including the first).
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<PathBuf>,
    /// Table in the SQLite or Postgres database named by `database_url` / `DATABASE_URL`.
    #[serde(alias = "sqlite_table", skip_serializing_if = "Option::is_none")]
    pub db_table: Option<String>,
    /// Overrides the `DATABASE_URL` environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Checkpoint file for file outputs. Defaults to `<first output>.checkpoint.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
    /// Windows buffered per sink write + checkpoint save (0 is treated as 1).
    pub commit_every: u32,
    /// Progress line every N windows (0 disables).
    pub progress_every: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv: None,
            json: None,
            db_table: None,
            database_url: None,
            checkpoint: None,
            commit_every: 1,
            progress_every: 100,
        }
    }
}

impl OutputConfig {
    pub fn has_target(&self) -> bool {
        self.csv.is_some() || self.json.is_some() || self.db_table.is_some()
    }

    /// File outputs in a fixed order: CSV first, then JSON.
    pub fn files(&self) -> Vec<&Path> {
        self.csv
            .iter()
            .chain(self.json.iter())
            .map(PathBuf::as_path)
            .collect()
    }

    pub fn commit_every(&self) -> usize {
        self.commit_every.max(1) as usize
    }
}

// ── Loading and validation ──────────────────────────────────────────

impl FetchConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| invalid(format!("cannot serialize config: {e}")))
    }

    /// Reject values that cannot produce a sensible run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.source.endpoint {
            EndpointConfig::Updates { feed_id, .. } => {
                let id = normalize_feed_id(feed_id);
                if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid(format!("feed_id '{feed_id}' is not a hex id")));
                }
            }
            EndpointConfig::History { symbol, .. } => {
                if symbol.trim().is_empty() {
                    return Err(invalid("history symbol is empty"));
                }
            }
        }
        if self.source.timeout_secs == 0 {
            return Err(invalid("source.timeout_secs must be positive"));
        }
        if self.range.window_secs <= 0 {
            return Err(invalid("range.window_secs must be positive"));
        }
        if self.range.window_secs > MAX_WINDOW_SECS {
            return Err(invalid(format!(
                "range.window_secs must be at most {MAX_WINDOW_SECS} (366 days)"
            )));
        }
        if self.range.start.is_none() && self.range.days_back == 0 {
            return Err(invalid("range needs either start or a positive days_back"));
        }
        if let (Some(start), Some(end)) = (self.range.start, self.range.end) {
            if start >= end {
                return Err(invalid(format!("range start {start} is not before end {end}")));
            }
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.period_secs == 0 {
            return Err(invalid("rate_limit.max_requests and period_secs must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid("retry.base_backoff_ms exceeds max_backoff_ms"));
        }
        if !self.output.has_target() {
            return Err(invalid("no output configured (csv, json or db_table)"));
        }
        if let Some(table) = &self.output.db_table {
            validate_table_name(table).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }

    /// Granularity that "now" and `days_back` are aligned to.
    pub fn alignment_secs(&self) -> i64 {
        match &self.source.endpoint {
            EndpointConfig::Updates { .. } => self.range.window_secs,
            EndpointConfig::History { resolution, .. } => resolution.step_secs(),
        }
    }

    /// Fingerprint of the series this configuration fetches.
    pub fn series_key(&self) -> String {
        let window = self.range.window_secs.to_string();
        match &self.source.endpoint {
            EndpointConfig::Updates { feed_id, selection } => {
                let selection = match selection {
                    PointSelection::All => "all",
                    PointSelection::First => "first",
                };
                series_key(&["updates", &normalize_feed_id(feed_id), selection, &window])
            }
            EndpointConfig::History { symbol, resolution } => {
                series_key(&["history", symbol, &resolution.to_string(), &window])
            }
        }
    }
}
