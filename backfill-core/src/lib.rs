//! pyth-backfill core — resumable, rate-limited bulk fetch of oracle price history.
//!
//! This crate contains the whole fetch engine:
//! - Domain types (time windows, price points, OHLC bars, checkpoints)
//! - Window planner and pacing rate limiter with throttling cooldown
//! - Fetch clients for the Benchmarks updates and bar-history endpoints
//! - Deduplicating merge, file, SQLite and Postgres sinks, checkpoint stores
//! - The orchestrator tying them together, plus configuration and presets

mod atomic;

pub mod checkpoint;
pub mod client;
pub mod clock;
pub mod config;
pub mod domain;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod planner;
pub mod rate_limiter;
pub mod sink;
pub mod targets;

pub use checkpoint::{
    series_key, CheckpointError, CheckpointStore, FileCheckpointStore, PostgresCheckpointStore, SqliteCheckpointStore,
};
pub use client::{BarHistoryClient, FetchClient, FetchError, FetchOutcome, PointSelection, PriceUpdatesClient, Resolution};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EndpointConfig, FetchConfig, Preset};
pub use domain::{Checkpoint, OhlcBar, PricePoint, SeriesRecord, TimeWindow, Timestamped};
pub use merge::{merge, MergeStats, Series};
pub use orchestrator::{FetchOrchestrator, RetryPolicy, RunError, RunPlan, RunSummary, StopReason};
pub use planner::WindowPlanner;
pub use rate_limiter::{LimiterState, RateLimiter};
pub use sink::{DatabaseUrl, FileFormat, FileSink, PgHandle, PostgresSink, SeriesSink, SinkError, SqliteSink};
pub use targets::{OutputTargets, TargetError};
