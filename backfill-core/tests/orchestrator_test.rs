//! End-to-end orchestrator behavior against a scripted client.
//!
//! No test here sleeps or touches the network: waits go through a
//! `ManualClock` and responses come from `ScriptedClient`.

use backfill_core::checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, SqliteCheckpointStore,
};
use backfill_core::client::{FetchClient, FetchError, FetchOutcome};
use backfill_core::clock::{Clock, ManualClock};
use backfill_core::domain::{Checkpoint, PricePoint, TimeWindow};
use backfill_core::orchestrator::{FetchOrchestrator, RetryPolicy, RunError, RunPlan, StopReason};
use backfill_core::rate_limiter::RateLimiter;
use backfill_core::sink::{FileFormat, FileSink, SeriesSink, SinkError, SqliteSink};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const START: i64 = 1738169400;
const KEY: &str = "test-series";
const COOLDOWN: Duration = Duration::from_secs(60);
const DELAY: Duration = Duration::from_millis(100);

// ── Fakes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Fetch(i64),
    Save(i64),
}

type Log = Arc<Mutex<Vec<Event>>>;

/// Serves a deterministic point per window unless a scripted response is queued.
struct ScriptedClient {
    script: Mutex<HashMap<i64, VecDeque<Result<FetchOutcome<PricePoint>, FetchError>>>>,
    log: Log,
    /// Set `cancel` once this many requests have been served.
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
}

impl ScriptedClient {
    fn new(log: Log) -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            log,
            cancel_after: None,
        }
    }

    fn on(self, window_start: i64, response: Result<FetchOutcome<PricePoint>, FetchError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(window_start)
            .or_default()
            .push_back(response);
        self
    }

    fn cancel_after(mut self, requests: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((requests, flag));
        self
    }

    fn requests(&self) -> Vec<i64> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Fetch(s) => Some(*s),
                Event::Save(_) => None,
            })
            .collect()
    }
}

fn point(ts: i64) -> PricePoint {
    PricePoint::new(ts, Decimal::new(10_000_000 + ts % 10_000, 2), Decimal::new(3, 0))
}

impl FetchClient<PricePoint> for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, window: &TimeWindow) -> Result<FetchOutcome<PricePoint>, FetchError> {
        let served = {
            let mut log = self.log.lock().unwrap();
            log.push(Event::Fetch(window.start()));
            log.iter().filter(|e| matches!(e, Event::Fetch(_))).count()
        };
        if let Some((n, flag)) = &self.cancel_after {
            if served >= *n {
                flag.store(true, Ordering::Relaxed);
            }
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&window.start())
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| {
            Ok(FetchOutcome::complete(vec![
                point(window.start()),
                point(window.start() + 30),
            ]))
        })
    }
}

/// Records every save into the shared event log, then delegates.
struct RecordingStore {
    inner: FileCheckpointStore,
    log: Log,
}

impl CheckpointStore for RecordingStore {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load()
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.log
            .lock()
            .unwrap()
            .push(Event::Save(checkpoint.last_completed_window_end));
        self.inner.save(checkpoint)
    }

    fn reset(&self) -> Result<(), CheckpointError> {
        self.inner.reset()
    }
}

/// A sink whose disk is full.
struct FullDiskSink;

impl SeriesSink<PricePoint> for FullDiskSink {
    fn describe(&self) -> String {
        "csv:full.csv".into()
    }

    fn last_timestamp(&self) -> Result<Option<i64>, SinkError> {
        Ok(None)
    }

    fn write(&mut self, _batch: &[PricePoint]) -> Result<usize, SinkError> {
        Err(SinkError::Io {
            path: PathBuf::from("full.csv"),
            source: std::io::Error::other("no space left on device"),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    dir: PathBuf,
    clock: Arc<ManualClock>,
    log: Log,
}

impl Harness {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            clock: Arc::new(ManualClock::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn csv(&self) -> PathBuf {
        self.dir.join("btc.csv")
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("btc.csv.checkpoint.json")
    }

    fn orchestrator(
        &self,
        client: Arc<ScriptedClient>,
    ) -> FetchOrchestrator<PricePoint, Arc<ScriptedClient>> {
        let sink = FileSink::<PricePoint>::open(self.csv(), FileFormat::Csv).unwrap();
        let store = RecordingStore {
            inner: FileCheckpointStore::new(self.checkpoint_path()),
            log: Arc::clone(&self.log),
        };
        let clock: Arc<dyn Clock> = self.clock.clone();
        let limiter = RateLimiter::new(Arc::clone(&clock), DELAY, COOLDOWN);
        FetchOrchestrator::new(client, Box::new(store), limiter, clock)
            .with_sink(Box::new(sink))
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                jitter: 0.0,
            })
    }

    fn saved(&self) -> Option<Checkpoint> {
        FileCheckpointStore::new(self.checkpoint_path()).load().unwrap()
    }

    fn rows(&self) -> Vec<PricePoint> {
        FileSink::<PricePoint>::open(self.csv(), FileFormat::Csv)
            .unwrap()
            .series()
            .to_vec()
    }
}

fn plan(windows: i64) -> RunPlan {
    RunPlan::new(START, START + windows * 60, 60, KEY).with_progress_every(0)
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn two_minute_range_fetches_two_windows() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan(2)).unwrap();

    assert_eq!(client.requests(), vec![START, START + 60]);
    assert_eq!(summary.windows_completed, 2);
    assert_eq!(summary.points_written, 4);
    assert_eq!(summary.requests_issued, 2);
    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(h.saved().unwrap().last_completed_window_end, START + 120);
    assert_eq!(h.rows().len(), 4);
}

#[test]
fn commit_cadence_batches_sink_writes() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));

    let summary = h
        .orchestrator(Arc::clone(&client))
        .run(&plan(250).with_commit_every(100))
        .unwrap();

    let saves: Vec<Event> = h
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::Save(_)))
        .cloned()
        .collect();
    assert_eq!(
        saves,
        vec![
            Event::Save(START + 100 * 60),
            Event::Save(START + 200 * 60),
            Event::Save(START + 250 * 60),
        ]
    );
    assert_eq!(summary.windows_completed, 250);
    assert_eq!(h.rows().len(), 500);
}

#[test]
fn throttle_on_third_window_cools_down_once_and_retries_same_window() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let w3 = START + 120;
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log)).on(w3, Err(FetchError::RateLimited)),
    );

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan(5)).unwrap();

    assert_eq!(summary.throttled, 1);
    assert_eq!(summary.windows_completed, 5);
    assert_eq!(summary.retries, 0);

    // Exactly one cooldown-length wait.
    let cooldowns = h.clock.sleeps().iter().filter(|d| **d == COOLDOWN).count();
    assert_eq!(cooldowns, 1);

    // Window 3 is retried (not window 4) and the checkpoint does not move
    // past window 2 until window 3 has succeeded.
    let log = h.log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            Event::Fetch(START),
            Event::Save(START + 60),
            Event::Fetch(START + 60),
            Event::Save(START + 120),
            Event::Fetch(w3),
            Event::Fetch(w3),
            Event::Save(START + 180),
            Event::Fetch(START + 180),
            Event::Save(START + 240),
            Event::Fetch(START + 240),
            Event::Save(START + 300),
        ]
    );
}

#[test]
fn permits_are_spaced_by_the_pacing_delay() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));

    h.orchestrator(client).run(&plan(4)).unwrap();

    // The fake answers instantly, so every permit after the first waits the full delay.
    assert_eq!(h.clock.sleeps(), vec![DELAY; 3]);
}

#[test]
fn transient_failures_back_off_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log))
            .on(START + 60, Err(FetchError::Transient("HTTP 503".into())))
            .on(START + 60, Err(FetchError::Transient("timeout".into()))),
    );

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan(3)).unwrap();

    assert_eq!(summary.retries, 2);
    assert_eq!(summary.windows_completed, 3);
    assert_eq!(summary.requests_issued, 5);
    let backoffs: Vec<Duration> = h
        .clock
        .sleeps()
        .into_iter()
        .filter(|d| *d >= Duration::from_secs(1))
        .collect();
    assert_eq!(backoffs, vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[test]
fn exhausted_retries_are_fatal_and_preserve_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let failing = START + 60;
    let mut client = ScriptedClient::new(Arc::clone(&h.log));
    for _ in 0..3 {
        client = client.on(failing, Err(FetchError::Transient("HTTP 502".into())));
    }
    let client = Arc::new(client);

    let err = h.orchestrator(Arc::clone(&client)).run(&plan(3)).unwrap_err();

    match &err {
        RunError::Fatal {
            window,
            windows_completed,
            source,
        } => {
            assert_eq!(window.start(), failing);
            assert_eq!(*windows_completed, 1);
            assert!(matches!(source, FetchError::Transient(_)));
        }
        other => panic!("expected Fatal, got {other:?}"),
    }
    assert!(err.to_string().contains("re-run to resume"));
    assert_eq!(h.saved().unwrap().last_completed_window_end, failing);

    // A healthy re-run resumes at the failed window.
    let healthy = Arc::new(ScriptedClient::new(Arc::new(Mutex::new(Vec::new()))));
    let summary = h.orchestrator(Arc::clone(&healthy)).run(&plan(3)).unwrap();
    assert_eq!(healthy.requests(), vec![failing, failing + 60]);
    assert_eq!(summary.resumed_from, Some(failing));
    assert_eq!(h.rows().len(), 6);
}

#[test]
fn malformed_payload_is_fatal_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log))
            .on(START, Err(FetchError::Malformed("expected array".into()))),
    );

    let err = h.orchestrator(Arc::clone(&client)).run(&plan(3)).unwrap_err();

    assert!(matches!(err, RunError::Fatal { windows_completed: 0, .. }));
    assert_eq!(client.requests(), vec![START]);
    assert!(h.saved().is_none());
}

#[test]
fn failed_save_after_fatal_fetch_reports_both() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let failing = START + 120;
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log))
            .on(failing, Err(FetchError::Rejected { status: 403, body: "forbidden".into() })),
    );

    let err = h
        .orchestrator(Arc::clone(&client))
        .with_sink(Box::new(FullDiskSink))
        .run(&plan(5).with_commit_every(5))
        .unwrap_err();

    match &err {
        RunError::FatalUnsaved { window, fetch, source } => {
            assert_eq!(window.start(), failing);
            assert!(matches!(fetch, FetchError::Rejected { status: 403, .. }));
            assert!(matches!(**source, RunError::Sink { windows_completed: 0, .. }));
        }
        other => panic!("expected FatalUnsaved, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("HTTP 403"));
    assert!(message.contains("forbidden"));
    assert!(message.contains("no space left on device"));
    assert_eq!(err.windows_completed(), Some(0));
    assert!(h.saved().is_none());
}

#[test]
fn interrupted_then_resumed_matches_uninterrupted_run() {
    let straight_dir = tempfile::tempdir().unwrap();
    let straight = Harness::new(straight_dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&straight.log)));
    straight.orchestrator(client).run(&plan(6)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let cancel = Arc::new(AtomicBool::new(false));
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log)).cancel_after(4, Arc::clone(&cancel)),
    );
    let first = h
        .orchestrator(client)
        .with_cancel(Arc::clone(&cancel))
        .run(&plan(6))
        .unwrap();
    assert_eq!(first.stop, StopReason::Interrupted);
    assert_eq!(first.windows_completed, 4);

    let client = Arc::new(ScriptedClient::new(Arc::new(Mutex::new(Vec::new()))));
    let second = h.orchestrator(Arc::clone(&client)).run(&plan(6)).unwrap();
    assert_eq!(second.stop, StopReason::Completed);
    assert_eq!(client.requests(), vec![START + 240, START + 300]);

    assert_eq!(h.rows(), straight.rows());
    assert_eq!(
        std::fs::read_to_string(h.csv()).unwrap(),
        std::fs::read_to_string(straight.csv()).unwrap()
    );
}

#[test]
fn interrupt_flushes_buffered_windows() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let cancel = Arc::new(AtomicBool::new(false));
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log)).cancel_after(2, Arc::clone(&cancel)),
    );

    let summary = h
        .orchestrator(client)
        .with_cancel(cancel)
        .run(&plan(10).with_commit_every(5))
        .unwrap();

    assert_eq!(summary.stop, StopReason::Interrupted);
    assert_eq!(summary.windows_completed, 2);
    assert_eq!(h.saved().unwrap().last_completed_window_end, START + 120);
    assert_eq!(h.rows().len(), 4);
}

#[test]
fn max_windows_caps_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));

    let summary = h
        .orchestrator(Arc::clone(&client))
        .run(&plan(10).with_max_windows(Some(3)))
        .unwrap();
    assert_eq!(summary.stop, StopReason::Capped);
    assert_eq!(summary.windows_completed, 3);

    let summary = h
        .orchestrator(Arc::clone(&client))
        .run(&plan(4).with_max_windows(Some(3)))
        .unwrap();
    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.windows_completed, 1);
}

#[test]
fn completed_range_is_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));
    h.orchestrator(Arc::clone(&client)).run(&plan(2)).unwrap();

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan(2)).unwrap();
    assert_eq!(summary.stop, StopReason::NothingToDo);
    assert_eq!(summary.requests_issued, 0);
    assert_eq!(client.requests().len(), 2);
}

#[test]
fn checkpoint_for_another_series_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    FileCheckpointStore::new(h.checkpoint_path())
        .save(&Checkpoint::new("other-series", START + 60, chrono::Utc::now()))
        .unwrap();
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));

    let err = h.orchestrator(Arc::clone(&client)).run(&plan(2)).unwrap_err();
    assert!(matches!(err, RunError::SeriesMismatch { .. }));
    assert!(client.requests().is_empty());
}

#[test]
fn without_checkpoint_resumes_from_last_persisted_window() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    {
        let mut sink = FileSink::<PricePoint>::open(h.csv(), FileFormat::Csv).unwrap();
        sink.write(&[point(START + 125)]).unwrap();
    }
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)));

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan(4)).unwrap();

    // The window holding the last row is fetched again; earlier ones are not.
    assert_eq!(client.requests(), vec![START + 120, START + 180]);
    assert_eq!(summary.resumed_from, Some(START + 120));
}

#[test]
fn truncated_response_re_queries_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(ScriptedClient::new(Arc::clone(&h.log)).on(
        START,
        Ok(FetchOutcome {
            points: vec![point(START)],
            resume_at: Some(START + 20),
        }),
    ));
    let plan = RunPlan::new(START, START + 60, 60, KEY).with_progress_every(0);

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan).unwrap();

    assert_eq!(client.requests(), vec![START, START + 20]);
    assert_eq!(summary.windows_completed, 1);
    assert_eq!(summary.requests_issued, 2);
    // First call's point plus the default reply for the tail window.
    let ts: Vec<i64> = h.rows().iter().map(|p| p.timestamp).collect();
    assert_eq!(ts, vec![START, START + 20, START + 50]);
}

#[test]
fn empty_windows_still_advance_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let client = Arc::new(
        ScriptedClient::new(Arc::clone(&h.log)).on(START, Ok(FetchOutcome::empty())),
    );

    let summary = h.orchestrator(Arc::clone(&client)).run(&plan(2)).unwrap();

    assert_eq!(summary.windows_completed, 2);
    assert_eq!(summary.points_written, 2);
    assert_eq!(h.saved().unwrap().last_completed_window_end, START + 120);
}

#[test]
fn sqlite_target_upserts_and_keeps_checkpoint_in_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pyth.db");
    let table = "pyth_btc_usd_1sec";
    let clock = Arc::new(ManualClock::new());

    let run = |client: Arc<ScriptedClient>, reset: bool| {
        let store = SqliteCheckpointStore::open(&db, table).unwrap();
        if reset {
            store.reset().unwrap();
        }
        let sink = SqliteSink::<PricePoint>::open(&db, table).unwrap();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let limiter = RateLimiter::new(Arc::clone(&dyn_clock), DELAY, COOLDOWN);
        FetchOrchestrator::new(client, Box::new(store), limiter, dyn_clock)
            .with_sink(Box::new(sink))
            .run(&plan(3))
            .unwrap()
    };

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let first = run(
        Arc::new(ScriptedClient::new(Arc::clone(&log)).on(START + 60, Err(FetchError::RateLimited))),
        false,
    );
    assert_eq!(first.windows_completed, 3);
    assert_eq!(first.throttled, 1);

    let saved = SqliteCheckpointStore::open(&db, table).unwrap().load().unwrap().unwrap();
    assert_eq!(saved.last_completed_window_end, START + 180);
    assert_eq!(saved.series_key, KEY);

    // Same windows again after a reset, with new prices: rows are replaced, not duplicated.
    let mut client = ScriptedClient::new(Arc::new(Mutex::new(Vec::new())));
    for w in 0..3 {
        let start = START + w * 60;
        client = client.on(
            start,
            Ok(FetchOutcome::complete(vec![
                PricePoint::new(start, Decimal::ONE, Decimal::ZERO),
                PricePoint::new(start + 30, Decimal::ONE, Decimal::ZERO),
            ])),
        );
    }
    run(Arc::new(client), true);

    let sink = SqliteSink::<PricePoint>::open(&db, table).unwrap();
    assert_eq!(sink.row_count().unwrap(), 6);
    let rows = sink.load_all().unwrap();
    assert!(rows.iter().all(|p| p.price == Decimal::ONE));
    assert_eq!(sink.last_timestamp().unwrap(), Some(START + 150));
}

