//! Windowed price-update endpoint.
//!
//! `GET /v1/updates/price/{timestamp}/{interval}?ids={feed}&parsed=true`
//! returns every update of a feed published in a short interval (60 s max).
//! Prices arrive as integers plus an exponent and are scaled at parse time.

use super::{build_http_client, get_body, FetchClient, FetchError, FetchOutcome, DEFAULT_BASE_URL};
use crate::domain::{PricePoint, TimeWindow};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest interval the endpoint accepts.
pub const MAX_INTERVAL_SECS: i64 = 60;

/// Feed exponent assumed when the payload omits it.
const DEFAULT_EXPO: i32 = -8;

/// Which updates of a window are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSelection {
    /// Every update (second granularity).
    #[default]
    All,
    /// Only the earliest update of the window (one point per window).
    First,
}

/// Lower-case hex id without the `0x` prefix, as the API expects.
pub fn normalize_feed_id(id: &str) -> String {
    let id = id.trim().to_ascii_lowercase();
    id.strip_prefix("0x").map(str::to_string).unwrap_or(id)
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpdateItem {
    #[serde(default)]
    parsed: Option<ParsedField>,
}

/// `parsed` is a list in current responses and a single object in older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParsedField {
    Many(Vec<ParsedUpdate>),
    One(ParsedUpdate),
}

#[derive(Debug, Deserialize)]
struct ParsedUpdate {
    #[serde(default)]
    id: String,
    #[serde(default)]
    price: Option<WirePrice>,
}

#[derive(Debug, Deserialize)]
struct WirePrice {
    #[serde(default)]
    price: Option<IntLike>,
    #[serde(default)]
    conf: Option<IntLike>,
    #[serde(default)]
    expo: Option<i32>,
    #[serde(default)]
    publish_time: Option<i64>,
}

/// Integers are sent as decimal strings; accept bare numbers too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntLike {
    Int(i64),
    Text(String),
}

impl IntLike {
    fn value(&self) -> Result<i64, FetchError> {
        match self {
            IntLike::Int(v) => Ok(*v),
            IntLike::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| FetchError::Malformed(format!("non-integer price field {s:?}"))),
        }
    }
}

/// Parse an updates payload into the points of `feed_id` that fall inside `window`.
pub fn parse_updates(
    body: &str,
    feed_id: &str,
    window: &TimeWindow,
    selection: PointSelection,
) -> Result<Vec<PricePoint>, FetchError> {
    let items: Vec<UpdateItem> = serde_json::from_str(body)
        .map_err(|e| FetchError::Malformed(format!("updates payload: {e}")))?;
    let wanted = normalize_feed_id(feed_id);

    let mut points = Vec::new();
    for item in items {
        let updates = match item.parsed {
            Some(ParsedField::Many(v)) => v,
            Some(ParsedField::One(u)) => vec![u],
            None => continue,
        };
        for update in updates {
            if normalize_feed_id(&update.id) != wanted {
                continue;
            }
            let Some(wire) = update.price else { continue };
            let (Some(raw_price), Some(ts)) = (wire.price.as_ref(), wire.publish_time) else {
                continue;
            };
            if !window.contains(ts) {
                continue;
            }
            let raw_price = raw_price.value()?;
            let raw_conf = match &wire.conf {
                Some(c) => c.value()?,
                None => 0,
            };
            let expo = wire.expo.unwrap_or(DEFAULT_EXPO);
            let point = PricePoint::from_raw(ts, raw_price, raw_conf, expo).ok_or_else(|| {
                FetchError::Malformed(format!("price {raw_price}e{expo} out of range"))
            })?;
            points.push(point);
        }
    }

    points.sort_by_key(|p| p.timestamp);
    if selection == PointSelection::First {
        points.truncate(1);
    }
    Ok(points)
}

/// Client for the windowed updates endpoint.
pub struct PriceUpdatesClient {
    client: reqwest::blocking::Client,
    base_url: String,
    feed_id: String,
    selection: PointSelection,
}

impl PriceUpdatesClient {
    pub fn new(
        base_url: Option<&str>,
        feed_id: &str,
        selection: PointSelection,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            feed_id: normalize_feed_id(feed_id),
            selection,
        })
    }

    fn url(&self, window: &TimeWindow) -> String {
        format!(
            "{}/v1/updates/price/{}/{}",
            self.base_url,
            window.start(),
            window.len_secs().min(MAX_INTERVAL_SECS)
        )
    }
}

impl FetchClient<PricePoint> for PriceUpdatesClient {
    fn name(&self) -> &str {
        "benchmarks_price_updates"
    }

    fn fetch(&self, window: &TimeWindow) -> Result<FetchOutcome<PricePoint>, FetchError> {
        let query = [
            ("ids", self.feed_id.clone()),
            ("parsed", "true".to_string()),
        ];
        let Some(body) = get_body(&self.client, &self.url(window), &query)? else {
            return Ok(FetchOutcome::empty());
        };
        let points = parse_updates(&body, &self.feed_id, window, self.selection)?;
        // Windows longer than the endpoint's interval cap leave a tail.
        let covered_to = window.start() + MAX_INTERVAL_SECS;
        let resume_at = (covered_to < window.end()).then_some(covered_to);
        Ok(FetchOutcome { points, resume_at })
    }
}
