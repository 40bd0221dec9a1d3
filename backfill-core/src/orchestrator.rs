//! Fetch orchestrator — drives planner, limiter, client, sinks and checkpoint.
//!
//! Per window: permit → fetch → (throttled: cool down, same window again;
//! transient: back off, same window again) → merge into every sink →
//! advance and save the checkpoint. The checkpoint only moves after the sink
//! write returned, so a crash at any point re-fetches at most the windows
//! that were not yet committed.

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::client::{FetchClient, FetchError, FetchOutcome};
use crate::clock::Clock;
use crate::domain::{Checkpoint, SeriesRecord, TimeWindow};
use crate::planner::{window_start_containing, WindowPlanner};
use crate::rate_limiter::RateLimiter;
use crate::sink::{SeriesSink, SinkError};
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// What one run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub range_start: i64,
    pub range_end: i64,
    pub window_secs: i64,
    /// Fingerprint of the series; must match any stored checkpoint.
    pub series_key: String,
    /// Stop after this many windows (for partial runs and smoke tests).
    pub max_windows: Option<u64>,
    /// Windows buffered per commit.
    pub commit_every: usize,
    /// Progress line every N windows; 0 disables.
    pub progress_every: u64,
}

impl RunPlan {
    pub fn new(range_start: i64, range_end: i64, window_secs: i64, series_key: impl Into<String>) -> Self {
        Self {
            range_start,
            range_end,
            window_secs,
            series_key: series_key.into(),
            max_windows: None,
            commit_every: 1,
            progress_every: 100,
        }
    }

    pub fn with_max_windows(mut self, max: Option<u64>) -> Self {
        self.max_windows = max;
        self
    }

    pub fn with_commit_every(mut self, n: usize) -> Self {
        self.commit_every = n.max(1);
        self
    }

    pub fn with_progress_every(mut self, n: u64) -> Self {
        self.progress_every = n;
        self
    }
}

/// Capped exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per window, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the computed delay (0.1 = up to 10 %).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based):
    /// `base × 2^(failures−1)`, plus jitter, capped at `max_delay`.
    ///
    /// `unit` is a sample from `[0, 1)` scaling the jitter.
    pub fn delay(&self, failures: u32, unit: f64) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let extra = raw.mul_f64((self.jitter * unit.clamp(0.0, 1.0)).max(0.0));
        (raw + extra).min(self.max_delay)
    }
}

/// Why a run stopped without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every planned window is persisted.
    Completed,
    /// `max_windows` reached with windows left.
    Capped,
    /// Cancel flag observed between windows.
    Interrupted,
    /// The checkpoint already covers the whole range.
    NothingToDo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub windows_completed: u64,
    pub points_written: u64,
    /// Throttling responses received (each one cost a cooldown).
    pub throttled: u64,
    /// Transient failures that were retried.
    pub retries: u64,
    pub requests_issued: u64,
    pub stop: StopReason,
    /// Where this run started (checkpoint or sink resume point).
    pub resumed_from: Option<i64>,
    /// Checkpoint position when the run stopped.
    pub checkpoint_end: Option<i64>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("window {window} failed after {windows_completed} completed windows: {source}; re-run to resume")]
    Fatal {
        window: TimeWindow,
        windows_completed: u64,
        #[source]
        source: FetchError,
    },

    /// A fatal fetch, after which saving the buffered windows also failed.
    #[error("window {window} failed ({fetch}), then saving earlier windows failed: {source}")]
    FatalUnsaved {
        window: TimeWindow,
        fetch: FetchError,
        #[source]
        source: Box<RunError>,
    },

    #[error("writing to {sink} failed after {windows_completed} completed windows: {source}")]
    Sink {
        sink: String,
        windows_completed: u64,
        #[source]
        source: SinkError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("stored checkpoint belongs to a different series ({found}, expected {expected}); run with --reset to start over")]
    SeriesMismatch { expected: String, found: String },
}

impl RunError {
    /// Windows committed before the failure, where known.
    pub fn windows_completed(&self) -> Option<u64> {
        match self {
            RunError::Fatal {
                windows_completed, ..
            }
            | RunError::Sink {
                windows_completed, ..
            } => Some(*windows_completed),
            RunError::FatalUnsaved { source, .. } => source.windows_completed(),
            _ => None,
        }
    }
}

enum WindowFailure {
    Fetch(FetchError),
    Interrupted,
}

/// Completed windows not yet handed to the sinks.
struct Pending<T> {
    points: Vec<T>,
    windows: u64,
    end: Option<i64>,
    requests: u64,
}

impl<T> Pending<T> {
    fn new() -> Self {
        Self {
            points: Vec::new(),
            windows: 0,
            end: None,
            requests: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    windows_completed: u64,
    points_written: u64,
    throttled: u64,
    retries: u64,
    requests_issued: u64,
}

// ─── Orchestrator ───────────────────────────────────────────────────

pub struct FetchOrchestrator<T, C> {
    client: C,
    sinks: Vec<Box<dyn SeriesSink<T>>>,
    checkpoints: Box<dyn CheckpointStore>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: Arc<AtomicBool>,
    counters: Counters,
}

impl<T, C> FetchOrchestrator<T, C>
where
    T: SeriesRecord,
    C: FetchClient<T>,
{
    pub fn new(
        client: C,
        checkpoints: Box<dyn CheckpointStore>,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            sinks: Vec::new(),
            checkpoints,
            limiter,
            retry: RetryPolicy::default(),
            clock,
            cancel: Arc::new(AtomicBool::new(false)),
            counters: Counters::default(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn SeriesSink<T>>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Box<dyn SeriesSink<T>>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a cancel flag (set it from a signal handler to stop between windows).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn sinks(&self) -> &[Box<dyn SeriesSink<T>>] {
        &self.sinks
    }

    /// Where the next run would start: the checkpoint if present, otherwise
    /// the start of the window holding the oldest "latest row" across sinks.
    pub fn resume_point(&self, plan: &RunPlan) -> Result<Option<i64>, RunError> {
        if let Some(cp) = self.load_checkpoint(plan)? {
            return Ok(Some(cp.last_completed_window_end));
        }
        let mut oldest: Option<i64> = None;
        for sink in &self.sinks {
            let last = sink.last_timestamp().map_err(|source| RunError::Sink {
                sink: sink.describe(),
                windows_completed: 0,
                source,
            })?;
            match last {
                // A sink with nothing in it needs the whole range.
                None => return Ok(None),
                Some(ts) => oldest = Some(oldest.map_or(ts, |o| o.min(ts))),
            }
        }
        Ok(oldest.map(|ts| window_start_containing(plan.range_start, plan.window_secs, ts)))
    }

    fn load_checkpoint(&self, plan: &RunPlan) -> Result<Option<Checkpoint>, RunError> {
        match self.checkpoints.load()? {
            Some(cp) if cp.series_key != plan.series_key => Err(RunError::SeriesMismatch {
                expected: plan.series_key.clone(),
                found: cp.series_key,
            }),
            other => Ok(other),
        }
    }

    /// Run the plan to completion, cap, interrupt or fatal error.
    pub fn run(&mut self, plan: &RunPlan) -> Result<RunSummary, RunError> {
        self.counters = Counters::default();
        let stored = self.load_checkpoint(plan)?;
        let resumed_from = self.resume_point(plan)?;
        let planner = WindowPlanner::new(plan.range_start, plan.range_end, plan.window_secs)
            .resume_from(resumed_from);

        let mut checkpoint = stored.unwrap_or_else(|| {
            Checkpoint::new(plan.series_key.clone(), planner.effective_start(), Utc::now())
        });

        if planner.is_exhausted() {
            tracing::info!(
                resumed_from = ?resumed_from,
                range_end = plan.range_end,
                "nothing to do: range already covered"
            );
            return Ok(self.summary(
                StopReason::NothingToDo,
                resumed_from,
                Some(checkpoint.last_completed_window_end),
            ));
        }

        let planned = planner.window_count();
        let total = plan.max_windows.map_or(planned, |m| m.min(planned));
        tracing::info!(
            client = self.client.name(),
            from = planner.effective_start(),
            to = plan.range_end,
            windows = total,
            resumed = resumed_from.is_some(),
            "starting fetch"
        );

        let started = self.clock.now();
        let mut pending = Pending::new();
        let mut windows = planner.windows().peekable();
        let mut fetched_this_run: u64 = 0;

        let stop = loop {
            if self.cancel.load(Ordering::Relaxed) {
                break StopReason::Interrupted;
            }
            if plan.max_windows.is_some_and(|m| fetched_this_run >= m) {
                break if windows.peek().is_some() {
                    StopReason::Capped
                } else {
                    StopReason::Completed
                };
            }
            let Some(window) = windows.next() else {
                break StopReason::Completed;
            };

            let requests_before = self.counters.requests_issued;
            let points = match self.fetch_window(&window) {
                Ok(points) => points,
                Err(WindowFailure::Interrupted) => break StopReason::Interrupted,
                Err(WindowFailure::Fetch(source)) => {
                    tracing::error!(%window, error = %source, "fatal fetch error");
                    // Windows already fetched are complete; keep them.
                    if let Err(unsaved) = self.commit(&mut pending, &mut checkpoint) {
                        return Err(RunError::FatalUnsaved {
                            window,
                            fetch: source,
                            source: Box::new(unsaved),
                        });
                    }
                    return Err(RunError::Fatal {
                        window,
                        windows_completed: self.counters.windows_completed,
                        source,
                    });
                }
            };

            tracing::debug!(%window, points = points.len(), "window fetched");
            pending.points.extend(points);
            pending.windows += 1;
            pending.end = Some(window.end());
            pending.requests += self.counters.requests_issued - requests_before;
            fetched_this_run += 1;

            if pending.windows as usize >= plan.commit_every {
                self.commit(&mut pending, &mut checkpoint)?;
            }
            if plan.progress_every > 0 && fetched_this_run % plan.progress_every == 0 {
                self.log_progress(fetched_this_run, total, started);
            }
        };

        self.commit(&mut pending, &mut checkpoint)?;
        let summary = self.summary(stop, resumed_from, Some(checkpoint.last_completed_window_end));
        tracing::info!(
            windows = summary.windows_completed,
            points = summary.points_written,
            requests = summary.requests_issued,
            throttled = summary.throttled,
            retries = summary.retries,
            stop = ?summary.stop,
            elapsed_secs = (self.clock.now() - started).as_secs_f64(),
            "fetch finished"
        );
        Ok(summary)
    }

    /// Fetch one window, following server-side truncation until the window is
    /// covered or the server stops making progress.
    fn fetch_window(&mut self, window: &TimeWindow) -> Result<Vec<T>, WindowFailure> {
        let mut points = Vec::new();
        let mut current = *window;
        loop {
            let outcome = self.fetch_with_retry(&current)?;
            points.extend(outcome.points);
            match outcome.resume_at.and_then(|at| window.tail_from(at)) {
                Some(tail) if tail.start() > current.start() => {
                    tracing::debug!(%window, tail = %tail, "re-querying uncovered tail");
                    current = tail;
                }
                _ => return Ok(points),
            }
        }
    }

    fn fetch_with_retry(
        &mut self,
        window: &TimeWindow,
    ) -> Result<FetchOutcome<T>, WindowFailure> {
        let mut failures: u32 = 0;
        loop {
            self.limiter.acquire();
            self.counters.requests_issued += 1;
            match self.client.fetch(window) {
                Ok(outcome) => return Ok(outcome),
                Err(FetchError::RateLimited) => {
                    self.counters.throttled += 1;
                    self.limiter.throttled();
                    if self.cancel.load(Ordering::Relaxed) {
                        return Err(WindowFailure::Interrupted);
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= self.retry.max_attempts {
                        return Err(WindowFailure::Fetch(e));
                    }
                    self.counters.retries += 1;
                    let delay = self.retry.delay(failures, rand::thread_rng().gen::<f64>());
                    tracing::warn!(
                        %window,
                        attempt = failures,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, backing off"
                    );
                    self.clock.sleep(delay);
                    if self.cancel.load(Ordering::Relaxed) {
                        return Err(WindowFailure::Interrupted);
                    }
                }
                Err(e) => return Err(WindowFailure::Fetch(e)),
            }
        }
    }

    /// Write buffered windows to every sink, then move the checkpoint.
    fn commit(&mut self, pending: &mut Pending<T>, checkpoint: &mut Checkpoint) -> Result<(), RunError> {
        let Some(end) = pending.end else {
            return Ok(());
        };
        for sink in &mut self.sinks {
            sink.write(&pending.points).map_err(|source| RunError::Sink {
                sink: sink.describe(),
                windows_completed: self.counters.windows_completed,
                source,
            })?;
        }
        checkpoint.advance(end, pending.requests);
        self.checkpoints.save(checkpoint)?;

        self.counters.windows_completed += pending.windows;
        self.counters.points_written += pending.points.len() as u64;
        *pending = Pending::new();
        Ok(())
    }

    fn log_progress(&self, done: u64, total: u64, started: Instant) {
        let elapsed = self.clock.now() - started;
        let pct = if total > 0 {
            100.0 * done as f64 / total as f64
        } else {
            100.0
        };
        let eta = eta(elapsed, done, total);
        tracing::info!(
            windows = done,
            total,
            points = self.counters.points_written,
            pct = %format!("{pct:.1}"),
            eta = %format_eta(eta),
            "progress"
        );
    }

    fn summary(&self, stop: StopReason, resumed_from: Option<i64>, checkpoint_end: Option<i64>) -> RunSummary {
        RunSummary {
            windows_completed: self.counters.windows_completed,
            points_written: self.counters.points_written,
            throttled: self.counters.throttled,
            retries: self.counters.retries,
            requests_issued: self.counters.requests_issued,
            stop,
            resumed_from,
            checkpoint_end,
        }
    }
}

/// Remaining time, extrapolated from the average so far.
fn eta(elapsed: Duration, done: u64, total: u64) -> Duration {
    if done == 0 || done >= total {
        return Duration::ZERO;
    }
    let per_window = elapsed.as_secs_f64() / done as f64;
    Duration::from_secs_f64(per_window * (total - done) as f64)
}

/// `3h07m`, `12m`, or `0m`.
fn format_eta(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m) = (secs / 3600, (secs % 3600) / 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else {
        format!("{m}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            jitter: 0.0,
        };
        let delays: Vec<u128> = (1..=5).map(|n| policy.delay(n, 0.9).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::default();
        let low = policy.delay(1, 0.0);
        let high = policy.delay(1, 0.999);
        assert_eq!(low, Duration::from_secs(1));
        assert!(high > low && high <= Duration::from_millis(1100));
    }

    #[test]
    fn eta_extrapolates_average() {
        assert_eq!(eta(Duration::from_secs(100), 100, 300), Duration::from_secs(200));
        assert_eq!(eta(Duration::from_secs(100), 0, 300), Duration::ZERO);
        assert_eq!(eta(Duration::from_secs(100), 300, 300), Duration::ZERO);
        assert_eq!(format_eta(Duration::from_secs(3 * 3600 + 7 * 60 + 5)), "3h07m");
        assert_eq!(format_eta(Duration::from_secs(59)), "0m");
    }
}
