//! Checkpoint — durable marker of the latest fully persisted window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress record for one output target.
///
/// `series_key` identifies what was being fetched (endpoint, feed, window
/// grid). A checkpoint is only ever applied to a run with the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub series_key: String,
    /// End of the last window whose points are durably in every sink.
    pub last_completed_window_end: i64,
    /// Requests issued across all runs that advanced this checkpoint.
    pub requests_issued: u64,
    pub started_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(series_key: impl Into<String>, window_end: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            series_key: series_key.into(),
            last_completed_window_end: window_end,
            requests_issued: 0,
            started_at,
        }
    }

    /// Advance past a committed window. Never moves backwards.
    pub fn advance(&mut self, window_end: i64, requests: u64) {
        self.last_completed_window_end = self.last_completed_window_end.max(window_end);
        self.requests_issued += requests;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let mut cp = Checkpoint::new("k", 120, Utc::now());
        cp.advance(180, 1);
        cp.advance(60, 2);
        assert_eq!(cp.last_completed_window_end, 180);
        assert_eq!(cp.requests_issued, 3);
    }

    #[test]
    fn json_roundtrip() {
        let cp = Checkpoint::new("abc", 1738169520, Utc::now());
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }
}
