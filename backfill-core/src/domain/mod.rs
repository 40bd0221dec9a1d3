//! Domain types for the backfill engine

pub mod checkpoint;
pub mod record;
pub mod window;

pub use checkpoint::Checkpoint;
pub use record::{iso_utc, scale_by_exponent, OhlcBar, PricePoint, SeriesRecord, Timestamped};
pub use window::TimeWindow;
