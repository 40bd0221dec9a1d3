//! Row mapping and SQL text shared by the SQLite and Postgres sinks.

use super::SinkError;
use crate::domain::{OhlcBar, PricePoint, SeriesRecord};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// The row's timestamp rendered as a UTC instant.
    UtcTime,
    Real,
    NullableReal,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

/// A bound value for one non-key column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    UtcTime(i64),
    Real(Option<f64>),
}

/// Record types that map onto a table row keyed by `timestamp`.
pub trait SqlRecord: SeriesRecord {
    /// Non-key columns, in bind order.
    const COLUMNS: &'static [Column];

    /// Values for [`Self::COLUMNS`].
    fn values(&self) -> Vec<SqlValue>;

    /// Rebuild from the key and the real-valued columns, in column order.
    fn from_columns(timestamp: i64, reals: &[Option<f64>]) -> Self;
}

impl SqlRecord for PricePoint {
    const COLUMNS: &'static [Column] = &[
        col("datetime_utc", ColumnKind::UtcTime),
        col("price", ColumnKind::Real),
        col("conf", ColumnKind::NullableReal),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::UtcTime(self.timestamp),
            SqlValue::Real(self.price.to_f64()),
            SqlValue::Real(self.conf.to_f64()),
        ]
    }

    fn from_columns(timestamp: i64, reals: &[Option<f64>]) -> Self {
        let dec = |i: usize| {
            reals
                .get(i)
                .copied()
                .flatten()
                .and_then(Decimal::from_f64)
                .unwrap_or_default()
        };
        PricePoint::new(timestamp, dec(0), dec(1))
    }
}

impl SqlRecord for OhlcBar {
    const COLUMNS: &'static [Column] = &[
        col("datetime_utc", ColumnKind::UtcTime),
        col("open", ColumnKind::NullableReal),
        col("high", ColumnKind::NullableReal),
        col("low", ColumnKind::NullableReal),
        col("close", ColumnKind::NullableReal),
        col("volume", ColumnKind::NullableReal),
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::UtcTime(self.timestamp),
            SqlValue::Real(self.open),
            SqlValue::Real(self.high),
            SqlValue::Real(self.low),
            SqlValue::Real(self.close),
            SqlValue::Real(self.volume),
        ]
    }

    fn from_columns(timestamp: i64, reals: &[Option<f64>]) -> Self {
        let at = |i: usize| reals.get(i).copied().flatten();
        OhlcBar {
            timestamp,
            datetime_utc: crate::domain::iso_utc(timestamp),
            open: at(0),
            high: at(1),
            low: at(2),
            close: at(3),
            volume: at(4),
        }
    }
}

// ── Dialects ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn key_type(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY",
            Dialect::Postgres => "BIGINT PRIMARY KEY",
        }
    }

    fn column_type(self, kind: ColumnKind) -> &'static str {
        match (self, kind) {
            (Dialect::Sqlite, ColumnKind::UtcTime) => "TEXT NOT NULL",
            (Dialect::Sqlite, ColumnKind::Real) => "REAL NOT NULL",
            (Dialect::Sqlite, ColumnKind::NullableReal) => "REAL",
            (Dialect::Postgres, ColumnKind::UtcTime) => "TIMESTAMPTZ NOT NULL",
            (Dialect::Postgres, ColumnKind::Real) => "DOUBLE PRECISION NOT NULL",
            (Dialect::Postgres, ColumnKind::NullableReal) => "DOUBLE PRECISION",
        }
    }

    fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{n}"),
            Dialect::Postgres => format!("${n}"),
        }
    }
}

pub(crate) fn create_table_sql(dialect: Dialect, table: &str, columns: &[Column]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", c.name, dialect.column_type(c.kind)))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (timestamp {}, {})",
        dialect.key_type(),
        defs.join(", ")
    )
}

/// Single-row upsert where the newest write replaces every non-key column.
pub(crate) fn upsert_sql(dialect: Dialect, table: &str, columns: &[Column]) -> String {
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=names.len() + 1).map(|i| dialect.placeholder(i)).collect();
    format!(
        "INSERT INTO {table} (timestamp, {}) VALUES ({}) {}",
        names.join(", "),
        placeholders.join(", "),
        conflict_clause(columns)
    )
}

pub(crate) fn conflict_clause(columns: &[Column]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .map(|c| format!("{0} = EXCLUDED.{0}", c.name))
        .collect();
    format!("ON CONFLICT (timestamp) DO UPDATE SET {}", updates.join(", "))
}

/// `SELECT timestamp, <real columns>` in ascending key order.
pub(crate) fn select_sql(table: &str, columns: &[Column]) -> String {
    let reals: Vec<&str> = columns
        .iter()
        .filter(|c| c.kind != ColumnKind::UtcTime)
        .map(|c| c.name)
        .collect();
    format!("SELECT timestamp, {} FROM {table} ORDER BY timestamp ASC", reals.join(", "))
}

pub(crate) fn real_column_count(columns: &[Column]) -> usize {
    columns.iter().filter(|c| c.kind != ColumnKind::UtcTime).count()
}

pub(crate) fn validate_table_name(name: &str) -> Result<(), SinkError> {
    let mut chars = name.chars();
    let ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(SinkError::TableName(name.to_string()))
    }
}

// ── Database URLs ───────────────────────────────────────────────────

/// Where the database sink lives, decided by the URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Sqlite(PathBuf),
    Postgres {
        /// Connection URL with the `schema` parameter removed.
        url: String,
        schema: Option<String>,
    },
}

impl DatabaseUrl {
    /// `table` qualified by the Postgres schema, if one was given.
    pub fn qualify(&self, table: &str) -> String {
        match self {
            DatabaseUrl::Postgres { schema: Some(schema), .. } => format!("{schema}.{table}"),
            _ => table.to_string(),
        }
    }
}

/// Parse a `DATABASE_URL`.
///
/// `postgres://` and `postgresql://` go to Postgres; a `schema=` query
/// parameter is lifted out and used to qualify table names. `sqlite://path`,
/// `sqlite:path` or a bare path go to SQLite, where query parameters are
/// ignored.
pub fn parse_database_url(url: &str) -> Result<DatabaseUrl, SinkError> {
    let url = url.trim();
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    if base.starts_with("postgres://") || base.starts_with("postgresql://") {
        let mut schema = None;
        let mut kept = Vec::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("schema", value)) => {
                    validate_table_name(value)
                        .map_err(|_| SinkError::Dsn(format!("invalid schema name '{value}'")))?;
                    schema = Some(value.to_string());
                }
                _ => kept.push(pair),
            }
        }
        let url = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{}", kept.join("&"))
        };
        return Ok(DatabaseUrl::Postgres { url, schema });
    }

    let path = if let Some(rest) = base.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = base.strip_prefix("sqlite:") {
        rest
    } else if let Some((scheme, _)) = base.split_once("://") {
        return Err(SinkError::Dsn(format!(
            "scheme '{scheme}' is not supported; use sqlite://<path> or postgres://..."
        )));
    } else {
        base
    };
    if path.is_empty() {
        return Err(SinkError::Dsn(format!("no database path in '{url}'")));
    }
    Ok(DatabaseUrl::Sqlite(PathBuf::from(path)))
}
