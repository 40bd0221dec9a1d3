//! Checkpoint persistence.
//!
//! A checkpoint is saved only after the window it names is durable in every
//! sink, so on restart the planner can skip straight past it.

use crate::atomic::write_atomic;
use crate::domain::Checkpoint;
use crate::sink::postgres::validate_qualified_name;
use crate::sink::sql::validate_table_name;
use crate::sink::sqlite::open_connection;
use crate::sink::{PgHandle, SinkError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint row for {target} is corrupt: {detail}")]
    CorruptRow { target: String, detail: String },

    #[error("checkpoint database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("checkpoint database error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error(transparent)]
    Target(#[from] SinkError),
}

/// Durable storage for one output target's checkpoint.
pub trait CheckpointStore: Send {
    fn describe(&self) -> String;

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Persist `checkpoint`, replacing any previous one. Durable on `Ok`.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Forget all progress. The only way a checkpoint ever moves backwards.
    fn reset(&self) -> Result<(), CheckpointError>;
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        (**self).load()
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        (**self).save(checkpoint)
    }

    fn reset(&self) -> Result<(), CheckpointError> {
        (**self).reset()
    }
}

/// Fingerprint of what a run fetches: endpoint, instrument, granularity,
/// window size. A checkpoint is only reusable by a run with the same key.
pub fn series_key(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    let hex = hasher.finalize().to_hex();
    hex[..16].to_string()
}

// ── JSON file ───────────────────────────────────────────────────────

/// Checkpoint kept as a small JSON document next to the output.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location for an output file: `btc.csv` → `btc.csv.checkpoint.json`.
    pub fn beside(output: &Path) -> Self {
        let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".checkpoint.json");
        Self::new(output.with_file_name(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        write_atomic(&self.path, |w| {
            serde_json::to_writer_pretty(&mut *w, checkpoint).map_err(io::Error::other)?;
            w.write_all(b"\n")
        })
        .map_err(|e| self.io_err(e))
    }

    fn reset(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

// ── SQLite table ────────────────────────────────────────────────────

/// Checkpoint kept in a `fetch_checkpoint` table beside the data table,
/// one row per data table.
pub struct SqliteCheckpointStore {
    conn: Connection,
    path: PathBuf,
    target: String,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl Into<PathBuf>, target_table: &str) -> Result<Self, CheckpointError> {
        validate_table_name(target_table)?;
        let path = path.into();
        let conn = open_connection(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fetch_checkpoint (
                 target                    TEXT    PRIMARY KEY,
                 series_key                TEXT    NOT NULL,
                 last_completed_window_end INTEGER NOT NULL,
                 requests_issued           INTEGER NOT NULL,
                 started_at                TEXT    NOT NULL,
                 updated_at                TEXT    NOT NULL
             );",
        )?;
        Ok(Self {
            conn,
            path,
            target: target_table.to_string(),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn describe(&self) -> String {
        format!("sqlite:{}#fetch_checkpoint[{}]", self.path.display(), self.target)
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = self
            .conn
            .query_row(
                "SELECT series_key, last_completed_window_end, requests_issued, started_at
                 FROM fetch_checkpoint WHERE target = ?1",
                params![self.target],
                |row| {
                    let started: String = row.get(3)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        started,
                    ))
                },
            )
            .optional()?;

        let Some((series_key, end, requests, started)) = row else {
            return Ok(None);
        };
        let started_at = DateTime::parse_from_rfc3339(&started)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CheckpointError::CorruptRow {
                target: self.target.clone(),
                detail: format!("started_at '{started}': {e}"),
            })?;
        Ok(Some(Checkpoint {
            series_key,
            last_completed_window_end: end,
            requests_issued: requests.max(0) as u64,
            started_at,
        }))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.conn.execute(
            "INSERT INTO fetch_checkpoint
                 (target, series_key, last_completed_window_end, requests_issued, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(target) DO UPDATE SET
                 series_key = excluded.series_key,
                 last_completed_window_end = excluded.last_completed_window_end,
                 requests_issued = excluded.requests_issued,
                 started_at = excluded.started_at,
                 updated_at = excluded.updated_at",
            params![
                self.target,
                checkpoint.series_key,
                checkpoint.last_completed_window_end,
                checkpoint.requests_issued as i64,
                checkpoint.started_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn reset(&self) -> Result<(), CheckpointError> {
        self.conn.execute(
            "DELETE FROM fetch_checkpoint WHERE target = ?1",
            params![self.target],
        )?;
        Ok(())
    }
}

// ── Postgres table ──────────────────────────────────────────────────

/// The same `fetch_checkpoint` table, kept in the Postgres database (and
/// schema) that holds the data table.
pub struct PostgresCheckpointStore {
    db: PgHandle,
    table: String,
    target: String,
}

impl PostgresCheckpointStore {
    /// `schema` qualifies the checkpoint table the same way as the data table.
    pub fn open(db: PgHandle, schema: Option<&str>, target_table: &str) -> Result<Self, CheckpointError> {
        validate_qualified_name(target_table)?;
        let table = match schema {
            Some(schema) => format!("{schema}.fetch_checkpoint"),
            None => "fetch_checkpoint".to_string(),
        };
        validate_qualified_name(&table)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 target                    TEXT        PRIMARY KEY,
                 series_key                TEXT        NOT NULL,
                 last_completed_window_end BIGINT      NOT NULL,
                 requests_issued           BIGINT      NOT NULL,
                 started_at                TIMESTAMPTZ NOT NULL,
                 updated_at                TIMESTAMPTZ NOT NULL
             )"
        );
        db.block_on(sqlx::query(&ddl).execute(db.pool()))?;
        Ok(Self {
            db,
            table,
            target: target_table.to_string(),
        })
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn describe(&self) -> String {
        format!("postgres:{}[{}]", self.table, self.target)
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let sql = format!(
            "SELECT series_key, last_completed_window_end, requests_issued, started_at
             FROM {} WHERE target = $1",
            self.table
        );
        let row = self.db.block_on(
            sqlx::query_as::<_, (String, i64, i64, DateTime<Utc>)>(&sql)
                .bind(&self.target)
                .fetch_optional(self.db.pool()),
        )?;
        Ok(row.map(|(series_key, end, requests, started_at)| Checkpoint {
            series_key,
            last_completed_window_end: end,
            requests_issued: requests.max(0) as u64,
            started_at,
        }))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let sql = format!(
            "INSERT INTO {}
                 (target, series_key, last_completed_window_end, requests_issued, started_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (target) DO UPDATE SET
                 series_key = EXCLUDED.series_key,
                 last_completed_window_end = EXCLUDED.last_completed_window_end,
                 requests_issued = EXCLUDED.requests_issued,
                 started_at = EXCLUDED.started_at,
                 updated_at = EXCLUDED.updated_at",
            self.table
        );
        self.db.block_on(
            sqlx::query(&sql)
                .bind(&self.target)
                .bind(&checkpoint.series_key)
                .bind(checkpoint.last_completed_window_end)
                .bind(checkpoint.requests_issued as i64)
                .bind(checkpoint.started_at)
                .bind(Utc::now())
                .execute(self.db.pool()),
        )?;
        Ok(())
    }

    fn reset(&self) -> Result<(), CheckpointError> {
        let sql = format!("DELETE FROM {} WHERE target = $1", self.table);
        self.db.block_on(sqlx::query(&sql).bind(&self.target).execute(self.db.pool()))?;
        Ok(())
    }
}
