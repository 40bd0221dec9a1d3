//! Postgres table sink.
//!
//! Same table shape and upsert semantics as the SQLite sink, with the
//! timestamp key as `BIGINT` and the rendered time as `TIMESTAMPTZ`. The
//! engine is blocking, so the handle owns a single-threaded tokio runtime
//! and drives sqlx through `block_on`.

use super::sql::{conflict_clause, create_table_sql, real_column_count, select_sql, validate_table_name};
use super::sql::{Dialect, SqlRecord, SqlValue};
use super::{SeriesSink, SinkError};
use crate::merge::Series;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Rows per INSERT statement.
const BATCH_ROWS: usize = 500;

/// Connection pool plus the runtime that drives it. Cheap to clone; the
/// sink and the checkpoint store share one.
#[derive(Clone)]
pub struct PgHandle {
    pool: PgPool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PgHandle {
    pub fn connect(url: &str) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SinkError::Runtime)?;
        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url),
        )?;
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

/// `schema.table` or `table`, each part a plain identifier.
pub(crate) fn validate_qualified_name(name: &str) -> Result<(), SinkError> {
    let mut parts = name.split('.');
    let (first, second, rest) = (parts.next(), parts.next(), parts.next());
    if rest.is_some() {
        return Err(SinkError::TableName(name.to_string()));
    }
    for part in [first, second].into_iter().flatten() {
        validate_table_name(part).map_err(|_| SinkError::TableName(name.to_string()))?;
    }
    Ok(())
}

pub struct PostgresSink<T> {
    db: PgHandle,
    table: String,
    _record: std::marker::PhantomData<fn() -> T>,
}

impl<T: SqlRecord> PostgresSink<T> {
    /// Create `table` (optionally schema-qualified) if it does not exist.
    pub fn open(db: PgHandle, table: &str) -> Result<Self, SinkError> {
        validate_qualified_name(table)?;
        let ddl = create_table_sql(Dialect::Postgres, table, T::COLUMNS);
        db.block_on(sqlx::query(&ddl).execute(db.pool()))?;
        Ok(Self {
            db,
            table: table.to_string(),
            _record: std::marker::PhantomData,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn row_count(&self) -> Result<u64, SinkError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let n: i64 = self
            .db
            .block_on(sqlx::query_scalar(&sql).fetch_one(self.db.pool()))?;
        Ok(n.max(0) as u64)
    }

    /// Every row in ascending timestamp order.
    pub fn load_all(&self) -> Result<Vec<T>, SinkError> {
        let sql = select_sql(&self.table, T::COLUMNS);
        let reals = real_column_count(T::COLUMNS);
        let rows = self.db.block_on(sqlx::query(&sql).fetch_all(self.db.pool()))?;
        rows.iter()
            .map(|row| {
                let timestamp: i64 = row.try_get(0)?;
                let values = (1..=reals)
                    .map(|i| row.try_get::<Option<f64>, _>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(T::from_columns(timestamp, &values))
            })
            .collect()
    }
}

impl<T: SqlRecord> SeriesSink<T> for PostgresSink<T> {
    fn describe(&self) -> String {
        format!("postgres:{}", self.table)
    }

    fn last_timestamp(&self) -> Result<Option<i64>, SinkError> {
        let sql = format!("SELECT MAX(timestamp) FROM {}", self.table);
        let ts: Option<i64> = self
            .db
            .block_on(sqlx::query_scalar(&sql).fetch_one(self.db.pool()))?;
        Ok(ts)
    }

    fn write(&mut self, batch: &[T]) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        // One statement may not touch a key twice; keep the newest of each.
        let rows: Series<T> = batch.iter().cloned().collect();
        let rows = rows.to_vec();

        let names: Vec<&str> = T::COLUMNS.iter().map(|c| c.name).collect();
        let head = format!("INSERT INTO {} (timestamp, {}) ", self.table, names.join(", "));
        let conflict = conflict_clause(T::COLUMNS);
        let pool = self.db.pool();

        self.db.block_on(async {
            let mut tx = pool.begin().await?;
            for chunk in rows.chunks(BATCH_ROWS) {
                let mut query = QueryBuilder::<Postgres>::new(head.as_str());
                query.push_values(chunk, |mut b, record| {
                    b.push_bind(record.timestamp());
                    for value in record.values() {
                        match value {
                            SqlValue::UtcTime(ts) => {
                                b.push_bind(DateTime::<Utc>::from_timestamp(ts, 0));
                            }
                            SqlValue::Real(v) => {
                                b.push_bind(v);
                            }
                        }
                    }
                });
                query.push(" ");
                query.push(conflict.as_str());
                query.build().execute(&mut *tx).await?;
            }
            tx.commit().await
        })?;
        Ok(batch.len())
    }
}
