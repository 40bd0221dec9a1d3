//! Window planner — splits a time range into fixed-size fetch windows.
//!
//! The plan is a plain iterator: lazy, finite, and restartable by building a
//! new planner with a later `resume_from`.

use crate::domain::TimeWindow;

/// Plans `[max(range_start, resume_from), range_end)` as consecutive windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlanner {
    range_start: i64,
    range_end: i64,
    window_secs: i64,
    resume_from: Option<i64>,
}

impl WindowPlanner {
    /// `window_secs` must be positive; zero or negative sizes produce an empty plan.
    pub fn new(range_start: i64, range_end: i64, window_secs: i64) -> Self {
        Self {
            range_start,
            range_end,
            window_secs,
            resume_from: None,
        }
    }

    pub fn resume_from(mut self, resume_from: Option<i64>) -> Self {
        self.resume_from = resume_from;
        self
    }

    /// First timestamp the plan covers.
    pub fn effective_start(&self) -> i64 {
        match self.resume_from {
            Some(r) => r.max(self.range_start),
            None => self.range_start,
        }
    }

    pub fn range_end(&self) -> i64 {
        self.range_end
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// True when nothing is left to fetch (e.g. the checkpoint is already past the end).
    pub fn is_exhausted(&self) -> bool {
        self.window_secs <= 0 || self.effective_start() >= self.range_end
    }

    /// Number of windows the plan will yield.
    pub fn window_count(&self) -> u64 {
        if self.is_exhausted() {
            return 0;
        }
        let span = self.range_end - self.effective_start();
        let partial = span % self.window_secs != 0;
        (span / self.window_secs + i64::from(partial)) as u64
    }

    pub fn windows(&self) -> Windows {
        Windows {
            next_start: self.effective_start(),
            range_end: self.range_end,
            window_secs: self.window_secs,
        }
    }
}

impl IntoIterator for WindowPlanner {
    type Item = TimeWindow;
    type IntoIter = Windows;

    fn into_iter(self) -> Windows {
        self.windows()
    }
}

/// Iterator over planned windows.
#[derive(Debug, Clone)]
pub struct Windows {
    next_start: i64,
    range_end: i64,
    window_secs: i64,
}

impl Iterator for Windows {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        if self.window_secs <= 0 || self.next_start >= self.range_end {
            return None;
        }
        let end = self
            .next_start
            .saturating_add(self.window_secs)
            .min(self.range_end);
        let window = TimeWindow::new(self.next_start, end)?;
        self.next_start = end;
        Some(window)
    }
}

/// Align a timestamp down to a multiple of `step` (used for "days back" ranges).
pub fn align_down(ts: i64, step: i64) -> i64 {
    if step <= 0 {
        return ts;
    }
    ts.div_euclid(step) * step
}

/// Start of the planned window (relative to `range_start`) that contains `ts`.
///
/// Used to turn a "last persisted timestamp" into a resume point that
/// re-fetches the possibly partial window it belongs to.
pub fn window_start_containing(range_start: i64, window_secs: i64, ts: i64) -> i64 {
    if window_secs <= 0 || ts <= range_start {
        return range_start;
    }
    range_start + (ts - range_start) / window_secs * window_secs
}
