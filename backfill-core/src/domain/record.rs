//! Persisted record types: oracle price points and OHLC bars.

use chrono::{DateTime, SecondsFormat};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Anything keyed by a Unix-seconds timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

/// Bound shared by every record type the engine can fetch and persist.
pub trait SeriesRecord:
    Timestamped + Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> SeriesRecord for T where
    T: Timestamped + Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// ISO-8601 rendering of a Unix timestamp, e.g. `2025-01-29T16:51:00+00:00`.
///
/// Out-of-range timestamps render as an empty string rather than failing the row.
pub fn iso_utc(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, false))
        .unwrap_or_default()
}

/// One oracle observation. `price` and `conf` are already scaled by the feed exponent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub datetime_utc: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub conf: Decimal,
}

impl PricePoint {
    pub fn new(timestamp: i64, price: Decimal, conf: Decimal) -> Self {
        Self {
            timestamp,
            datetime_utc: iso_utc(timestamp),
            price,
            conf,
        }
    }

    /// Build from the feed's raw integer representation: `value × 10^expo`.
    pub fn from_raw(timestamp: i64, raw_price: i64, raw_conf: i64, expo: i32) -> Option<Self> {
        Some(Self::new(
            timestamp,
            scale_by_exponent(raw_price, expo)?,
            scale_by_exponent(raw_conf, expo)?,
        ))
    }
}

impl Timestamped for PricePoint {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Exact `raw × 10^expo`. Returns `None` when the result does not fit a `Decimal`.
pub fn scale_by_exponent(raw: i64, expo: i32) -> Option<Decimal> {
    if expo <= 0 {
        let scale = expo.unsigned_abs();
        if scale > 28 {
            return None;
        }
        Some(Decimal::new(raw, scale).normalize())
    } else {
        let factor = 10i64.checked_pow(expo.unsigned_abs())?;
        Decimal::from(raw).checked_mul(Decimal::from(factor))
    }
}

/// One bar from the range-query endpoint. Fields the server omits stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub timestamp: i64,
    pub datetime_utc: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl Timestamped for OhlcBar {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn iso_rendering_matches_utc_offset_form() {
        assert_eq!(iso_utc(1738169460), "2025-01-29T16:51:00+00:00");
        assert_eq!(iso_utc(0), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn raw_price_is_scaled_exactly() {
        let p = PricePoint::from_raw(1738169460, 10207160000000, 3412345678, -8).unwrap();
        assert_eq!(p.price, Decimal::from_str("102071.6").unwrap());
        assert_eq!(p.conf, Decimal::from_str("34.12345678").unwrap());
        assert_eq!(p.datetime_utc, "2025-01-29T16:51:00+00:00");
    }

    #[test]
    fn positive_exponent_multiplies() {
        assert_eq!(scale_by_exponent(12, 3), Some(Decimal::from(12_000)));
        assert_eq!(scale_by_exponent(12, 0), Some(Decimal::from(12)));
    }

    #[test]
    fn absurd_exponents_are_rejected() {
        assert_eq!(scale_by_exponent(1, -40), None);
        assert_eq!(scale_by_exponent(1, 40), None);
    }

    #[test]
    fn price_point_json_keeps_decimal_text() {
        let p = PricePoint::new(
            1738169520,
            Decimal::from_str("102037.70").unwrap(),
            Decimal::from_str("30.5").unwrap(),
        );
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"price\":\"102037.70\""));
        let back: PricePoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
