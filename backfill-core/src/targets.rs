//! Opening the configured outputs: sinks, checkpoint store and output lock.

use crate::checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, PostgresCheckpointStore, SqliteCheckpointStore,
};
use crate::config::OutputConfig;
use crate::lock::{LockError, OutputLock};
use crate::sink::{
    parse_database_url, DatabaseUrl, FileFormat, FileSink, PgHandle, PostgresSink, SeriesSink, SinkError, SqlRecord,
    SqliteSink,
};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("db_table is set but no database URL was given (set DATABASE_URL or output.database_url)")]
    MissingDatabaseUrl,

    #[error("no output configured")]
    NoOutput,
}

/// Everything a run writes to.
pub struct OutputTargets<T> {
    pub sinks: Vec<Box<dyn SeriesSink<T>>>,
    pub checkpoints: Box<dyn CheckpointStore>,
    /// Held for the lifetime of the targets when opened for writing.
    pub lock: Option<OutputLock>,
}

/// Database for the configured table, if any. `output.database_url`
/// takes precedence over `env_url` (the `DATABASE_URL` variable).
pub fn database_url(output: &OutputConfig, env_url: Option<&str>) -> Result<Option<DatabaseUrl>, TargetError> {
    if output.db_table.is_none() {
        return Ok(None);
    }
    let url = output
        .database_url
        .as_deref()
        .or(env_url)
        .filter(|u| !u.trim().is_empty())
        .ok_or(TargetError::MissingDatabaseUrl)?;
    Ok(Some(parse_database_url(url)?))
}

/// The path the output lock is taken on: the first file, else the SQLite
/// database. A Postgres-only run has no local path and is not locked.
pub fn primary_target(output: &OutputConfig, db: Option<&DatabaseUrl>) -> Option<PathBuf> {
    output.files().first().map(|p| p.to_path_buf()).or_else(|| match db {
        Some(DatabaseUrl::Sqlite(path)) => Some(path.clone()),
        _ => None,
    })
}

impl<T: SqlRecord> OutputTargets<T> {
    /// Open for a run: takes the output lock first.
    pub fn open(output: &OutputConfig, env_url: Option<&str>) -> Result<Self, TargetError> {
        let db = database_url(output, env_url)?;
        if !output.has_target() {
            return Err(TargetError::NoOutput);
        }
        let lock = primary_target(output, db.as_ref())
            .map(|primary| OutputLock::acquire(&primary))
            .transpose()?;
        let mut targets = Self::open_inner(output, db)?;
        targets.lock = lock;
        Ok(targets)
    }

    /// Open without locking, for read-only inspection.
    pub fn open_unlocked(output: &OutputConfig, env_url: Option<&str>) -> Result<Self, TargetError> {
        let db = database_url(output, env_url)?;
        Self::open_inner(output, db)
    }

    fn open_inner(output: &OutputConfig, db: Option<DatabaseUrl>) -> Result<Self, TargetError> {
        let mut sinks: Vec<Box<dyn SeriesSink<T>>> = Vec::new();
        if let Some(csv) = &output.csv {
            sinks.push(Box::new(FileSink::<T>::open(csv, FileFormat::Csv)?));
        }
        if let Some(json) = &output.json {
            sinks.push(Box::new(FileSink::<T>::open(json, FileFormat::Json)?));
        }

        let mut db_checkpoints: Option<Box<dyn CheckpointStore>> = None;
        if let (Some(db), Some(table)) = (&db, &output.db_table) {
            match db {
                DatabaseUrl::Sqlite(path) => {
                    sinks.push(Box::new(SqliteSink::<T>::open(path, table)?));
                    if output.checkpoint.is_none() {
                        db_checkpoints = Some(Box::new(SqliteCheckpointStore::open(path, table)?));
                    }
                }
                DatabaseUrl::Postgres { url, schema } => {
                    let handle = PgHandle::connect(url)?;
                    sinks.push(Box::new(PostgresSink::<T>::open(handle.clone(), &db.qualify(table))?));
                    if output.checkpoint.is_none() {
                        db_checkpoints = Some(Box::new(PostgresCheckpointStore::open(
                            handle,
                            schema.as_deref(),
                            table,
                        )?));
                    }
                }
            }
        }

        let checkpoints: Box<dyn CheckpointStore> = match (&output.checkpoint, db_checkpoints) {
            (Some(path), _) => Box::new(FileCheckpointStore::new(path)),
            (None, Some(store)) => store,
            (None, None) => {
                let first = output.files().first().map(|p| p.to_path_buf()).ok_or(TargetError::NoOutput)?;
                Box::new(FileCheckpointStore::beside(&first))
            }
        };

        tracing::debug!(
            sinks = ?sinks.iter().map(|s| s.describe()).collect::<Vec<_>>(),
            checkpoint = %checkpoints.describe(),
            "outputs opened"
        );
        Ok(Self {
            sinks,
            checkpoints,
            lock: None,
        })
    }

    /// Oldest "latest timestamp" across sinks (None if any sink is empty).
    pub fn last_persisted(&self) -> Result<Option<i64>, SinkError> {
        let mut oldest: Option<i64> = None;
        for sink in &self.sinks {
            match sink.last_timestamp()? {
                None => return Ok(None),
                Some(ts) => oldest = Some(oldest.map_or(ts, |o| o.min(ts))),
            }
        }
        Ok(oldest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PricePoint;

    #[test]
    fn files_get_a_sidecar_checkpoint_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            csv: Some(dir.path().join("btc.csv")),
            json: Some(dir.path().join("btc.json")),
            ..OutputConfig::default()
        };

        let targets = OutputTargets::<PricePoint>::open(&output, None).unwrap();
        assert_eq!(targets.sinks.len(), 2);
        assert!(targets.checkpoints.describe().ends_with("btc.csv.checkpoint.json"));
        assert!(dir.path().join("btc.csv.lock").exists());

        assert!(matches!(
            OutputTargets::<PricePoint>::open(&output, None),
            Err(TargetError::Lock(LockError::Held { .. }))
        ));
        assert!(OutputTargets::<PricePoint>::open_unlocked(&output, None).is_ok());

        drop(targets);
        assert!(OutputTargets::<PricePoint>::open(&output, None).is_ok());
    }

    #[test]
    fn db_table_needs_database_url() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            db_table: Some("pyth_btc_usd_1sec".into()),
            ..OutputConfig::default()
        };
        assert!(matches!(
            OutputTargets::<PricePoint>::open(&output, None),
            Err(TargetError::MissingDatabaseUrl)
        ));

        let url = format!("sqlite://{}?schema=public", dir.path().join("p.db").display());
        let targets = OutputTargets::<PricePoint>::open(&output, Some(&url)).unwrap();
        assert_eq!(targets.sinks.len(), 1);
        assert!(targets.checkpoints.describe().contains("fetch_checkpoint[pyth_btc_usd_1sec]"));
        assert_eq!(targets.last_persisted().unwrap(), None);
    }

    #[test]
    fn config_url_overrides_environment() {
        let output = OutputConfig {
            db_table: Some("t".into()),
            database_url: Some("sqlite://from_config.db".into()),
            ..OutputConfig::default()
        };
        assert_eq!(
            database_url(&output, Some("sqlite://from_env.db")).unwrap(),
            Some(DatabaseUrl::Sqlite(PathBuf::from("from_config.db")))
        );
    }

    #[test]
    fn postgres_url_selects_the_postgres_backend() {
        let output = OutputConfig {
            db_table: Some("pyth_btc_usd_1sec".into()),
            ..OutputConfig::default()
        };
        let db = database_url(&output, Some("postgresql://u:p@localhost/pyth?schema=public"))
            .unwrap()
            .unwrap();
        assert!(matches!(db, DatabaseUrl::Postgres { ref schema, .. } if schema.as_deref() == Some("public")));
        assert_eq!(db.qualify("pyth_btc_usd_1sec"), "public.pyth_btc_usd_1sec");
        // Nothing local to lock for a database-only Postgres run.
        assert_eq!(primary_target(&output, Some(&db)), None);

        let with_csv = OutputConfig {
            csv: Some(PathBuf::from("btc.csv")),
            ..output
        };
        assert_eq!(primary_target(&with_csv, Some(&db)), Some(PathBuf::from("btc.csv")));
    }

    #[test]
    #[ignore] // Needs TEST_DATABASE_URL - run with: cargo test -- --ignored
    fn postgres_target_keeps_checkpoint_in_database() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
        let output = OutputConfig {
            db_table: Some(format!("backfill_targets_{}", std::process::id())),
            ..OutputConfig::default()
        };
        let targets = OutputTargets::<PricePoint>::open(&output, Some(&url)).unwrap();
        assert_eq!(targets.sinks.len(), 1);
        assert!(targets.sinks[0].describe().starts_with("postgres:"));
        assert!(targets.checkpoints.describe().contains("fetch_checkpoint"));
        assert!(targets.lock.is_none());
    }
}
