//! SQLite table sink.
//!
//! One table keyed by `timestamp`. Rows are upserted inside a transaction so
//! a batch is either fully visible or not at all; a re-fetched window simply
//! overwrites its own rows.

use super::sql::{create_table_sql, real_column_count, select_sql, upsert_sql, validate_table_name};
use super::sql::{Dialect, SqlRecord, SqlValue};
use super::{SeriesSink, SinkError};
use crate::domain::iso_utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn to_sqlite(value: SqlValue) -> Value {
    match value {
        SqlValue::UtcTime(ts) => Value::Text(iso_utc(ts)),
        SqlValue::Real(Some(v)) => Value::Real(v),
        SqlValue::Real(None) => Value::Null,
    }
}

/// Open a connection with the settings every store in this crate uses.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        // Let SQLite report the real error if this fails.
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

pub struct SqliteSink<T> {
    conn: Connection,
    path: PathBuf,
    table: String,
    upsert_sql: String,
    _record: std::marker::PhantomData<fn() -> T>,
}

impl<T: SqlRecord> SqliteSink<T> {
    /// Open `path` and create `table` if it does not exist.
    pub fn open(path: impl Into<PathBuf>, table: &str) -> Result<Self, SinkError> {
        validate_table_name(table)?;
        let path = path.into();
        let conn = open_connection(&path)?;

        conn.execute_batch(&create_table_sql(Dialect::Sqlite, table, T::COLUMNS))?;
        let upsert_sql = upsert_sql(Dialect::Sqlite, table, T::COLUMNS);

        Ok(Self {
            conn,
            path,
            table: table.to_string(),
            upsert_sql,
            _record: std::marker::PhantomData,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn row_count(&self) -> Result<u64, SinkError> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Every row in ascending timestamp order.
    pub fn load_all(&self) -> Result<Vec<T>, SinkError> {
        let reals = real_column_count(T::COLUMNS);
        let mut stmt = self.conn.prepare(&select_sql(&self.table, T::COLUMNS))?;
        let rows = stmt
            .query_map([], |row| {
                let timestamp: i64 = row.get(0)?;
                let values = (1..=reals)
                    .map(|i| row.get::<_, Option<f64>>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(T::from_columns(timestamp, &values))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl<T: SqlRecord> SeriesSink<T> for SqliteSink<T> {
    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.path.display(), self.table)
    }

    fn last_timestamp(&self) -> Result<Option<i64>, SinkError> {
        let ts = self
            .conn
            .query_row(&format!("SELECT MAX(timestamp) FROM {}", self.table), [], |r| {
                r.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(ts)
    }

    fn write(&mut self, batch: &[T]) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&self.upsert_sql)?;
            for record in batch {
                let mut values = Vec::with_capacity(T::COLUMNS.len() + 1);
                values.push(Value::Integer(record.timestamp()));
                values.extend(record.values().into_iter().map(to_sqlite));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OhlcBar, PricePoint};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn pt(ts: i64, price: &str) -> PricePoint {
        PricePoint::new(ts, Decimal::from_str(price).unwrap(), Decimal::from(30))
    }

    #[test]
    fn upsert_is_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::<PricePoint>::open(dir.path().join("p.db"), "pyth_btc_usd_1sec")
            .unwrap();
        assert_eq!(sink.last_timestamp().unwrap(), None);

        sink.write(&[pt(1738169460, "100")]).unwrap();
        sink.write(&[pt(1738169460, "102071.60"), pt(1738169520, "102037.70")])
            .unwrap();

        assert_eq!(sink.row_count().unwrap(), 2);
        assert_eq!(sink.last_timestamp().unwrap(), Some(1738169520));
        let rows = sink.load_all().unwrap();
        assert_eq!(rows[0].price, Decimal::from_str("102071.6").unwrap());
        assert_eq!(rows[0].datetime_utc, "2025-01-29T16:51:00+00:00");
    }

    #[test]
    fn reopening_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.db");
        {
            let mut sink = SqliteSink::<OhlcBar>::open(&path, "bars").unwrap();
            sink.write(&[OhlcBar {
                timestamp: 86_400,
                datetime_utc: iso_utc(86_400),
                open: Some(1.0),
                high: None,
                low: None,
                close: Some(2.0),
                volume: None,
            }])
            .unwrap();
        }
        let sink = SqliteSink::<OhlcBar>::open(&path, "bars").unwrap();
        let rows = sink.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, Some(2.0));
        assert_eq!(rows[0].high, None);
    }
}
