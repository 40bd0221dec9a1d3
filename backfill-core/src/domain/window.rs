//! TimeWindow — the unit of one fetch request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open interval `[start, end)` in Unix seconds (UTC).
///
/// Constructed only through [`TimeWindow::new`], which enforces `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    start: i64,
    end: i64,
}

impl TimeWindow {
    /// Returns `None` for an empty or inverted interval.
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Length in seconds (always > 0).
    pub fn len_secs(&self) -> i64 {
        self.end - self.start
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    /// The uncovered tail `[from, end)`, if `from` falls strictly inside the window.
    pub fn tail_from(&self, from: i64) -> Option<Self> {
        if from <= self.start {
            return None;
        }
        Self::new(from, self.end)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
