//! Output sinks.
//!
//! A sink owns its file or table handle. `write` returns only once the batch
//! is durable, which is what allows the orchestrator to advance the
//! checkpoint afterwards.

pub mod file;
pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use file::{FileFormat, FileSink};
pub use postgres::{PgHandle, PostgresSink};
pub use sql::{parse_database_url, DatabaseUrl, SqlRecord};
pub use sqlite::SqliteSink;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("cannot start the database runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("invalid database URL: {0}")]
    Dsn(String),

    #[error("invalid table name '{0}'")]
    TableName(String),
}

/// Destination for fetched records.
pub trait SeriesSink<T>: Send {
    /// Short description for logs, e.g. `csv:data/btc.csv`.
    fn describe(&self) -> String;

    /// Latest timestamp already persisted, if any.
    fn last_timestamp(&self) -> Result<Option<i64>, SinkError>;

    /// Merge `batch` into the sink. Durable on `Ok`. Returns records persisted.
    fn write(&mut self, batch: &[T]) -> Result<usize, SinkError>;
}

impl<T, S: SeriesSink<T> + ?Sized> SeriesSink<T> for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn last_timestamp(&self) -> Result<Option<i64>, SinkError> {
        (**self).last_timestamp()
    }

    fn write(&mut self, batch: &[T]) -> Result<usize, SinkError> {
        (**self).write(batch)
    }
}
