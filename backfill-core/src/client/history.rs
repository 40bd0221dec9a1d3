//! TradingView-style bar history endpoint.
//!
//! `GET /v1/shims/tradingview/history?symbol=&resolution=&from=&to=` returns
//! column arrays (`t`, `o`, `h`, `l`, `c`, `v`) for a whole range in one call.
//! The server may truncate long ranges; a response that stops short of the
//! window is reported through [`FetchOutcome::resume_at`].

use super::{build_http_client, get_body, FetchClient, FetchError, FetchOutcome, DEFAULT_BASE_URL};
use crate::domain::{iso_utc, OhlcBar, TimeWindow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bar resolution accepted by the shim: minutes, or day/week/month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Resolution {
    Minutes(u32),
    Day,
    Week,
    Month,
}

const MINUTE_RESOLUTIONS: [u32; 10] = [1, 2, 5, 15, 30, 60, 120, 240, 360, 720];

impl Resolution {
    /// Nominal bar spacing in seconds (a month counts as 30 days).
    pub fn step_secs(&self) -> i64 {
        match self {
            Resolution::Minutes(m) => i64::from(*m) * 60,
            Resolution::Day => 86_400,
            Resolution::Week => 7 * 86_400,
            Resolution::Month => 30 * 86_400,
        }
    }

    fn as_param(&self) -> String {
        match self {
            Resolution::Minutes(m) => m.to_string(),
            Resolution::Day => "D".into(),
            Resolution::Week => "W".into(),
            Resolution::Month => "M".into(),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_param())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "D" | "1D" => Ok(Resolution::Day),
            "W" | "1W" => Ok(Resolution::Week),
            "M" | "1M" => Ok(Resolution::Month),
            other => match other.parse::<u32>() {
                Ok(m) if MINUTE_RESOLUTIONS.contains(&m) => Ok(Resolution::Minutes(m)),
                _ => Err(format!(
                    "unsupported resolution '{s}' (valid: 1, 2, 5, 15, 30, 60, 120, 240, 360, 720, D, W, M)"
                )),
            },
        }
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        s.parse()
    }
}

impl From<Resolution> for String {
    fn from(r: Resolution) -> String {
        r.as_param()
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    s: String,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default)]
    t: Vec<i64>,
    #[serde(default)]
    o: Vec<Option<f64>>,
    #[serde(default)]
    h: Vec<Option<f64>>,
    #[serde(default)]
    l: Vec<Option<f64>>,
    #[serde(default)]
    c: Vec<Option<f64>>,
    #[serde(default)]
    v: Vec<Option<f64>>,
}

/// Parse a history payload into the bars that fall inside `window`.
pub fn parse_history(
    body: &str,
    window: &TimeWindow,
    resolution: Resolution,
) -> Result<FetchOutcome<OhlcBar>, FetchError> {
    let resp: HistoryResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Malformed(format!("history payload: {e}")))?;

    match resp.s.as_str() {
        "ok" => {}
        "no_data" => return Ok(FetchOutcome::empty()),
        other => {
            return Err(FetchError::Malformed(format!(
                "server status '{other}': {}",
                resp.errmsg.unwrap_or_default()
            )))
        }
    }

    let col = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();
    let mut bars: Vec<OhlcBar> = resp
        .t
        .iter()
        .enumerate()
        .filter(|(_, ts)| window.contains(**ts))
        .map(|(i, &ts)| OhlcBar {
            timestamp: ts,
            datetime_utc: iso_utc(ts),
            open: col(&resp.o, i),
            high: col(&resp.h, i),
            low: col(&resp.l, i),
            close: col(&resp.c, i),
            volume: col(&resp.v, i),
        })
        .collect();
    bars.sort_by_key(|b| b.timestamp);

    let step = resolution.step_secs();
    let resume_at = bars
        .last()
        .map(|b| b.timestamp + step)
        .filter(|next| *next < window.end());

    Ok(FetchOutcome {
        points: bars,
        resume_at,
    })
}

/// Client for the bar history endpoint.
pub struct BarHistoryClient {
    client: reqwest::blocking::Client,
    base_url: String,
    symbol: String,
    resolution: Resolution,
}

impl BarHistoryClient {
    pub fn new(
        base_url: Option<&str>,
        symbol: &str,
        resolution: Resolution,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            symbol: symbol.to_string(),
            resolution,
        })
    }
}

impl FetchClient<OhlcBar> for BarHistoryClient {
    fn name(&self) -> &str {
        "benchmarks_tradingview_history"
    }

    fn fetch(&self, window: &TimeWindow) -> Result<FetchOutcome<OhlcBar>, FetchError> {
        let url = format!("{}/v1/shims/tradingview/history", self.base_url);
        // `to` is inclusive on the server side.
        let query = [
            ("symbol", self.symbol.clone()),
            ("resolution", self.resolution.as_param()),
            ("from", window.start().to_string()),
            ("to", (window.end() - 1).to_string()),
        ];
        match get_body(&self.client, &url, &query)? {
            Some(body) => parse_history(&body, window, self.resolution),
            None => Ok(FetchOutcome::empty()),
        }
    }
}
