//! CSV and JSON file sinks.
//!
//! The existing file is loaded once into a [`Series`] snapshot. Each write
//! merges into the snapshot, then:
//! - CSV appends when every new timestamp is newer than the file's last row,
//!   otherwise the whole merged series is rewritten atomically.
//! - JSON is always rewritten atomically (a pretty-printed array).

use super::{SeriesSink, SinkError};
use crate::atomic::write_atomic;
use crate::domain::SeriesRecord;
use crate::merge::{strictly_after, Series};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    /// Guess from the file extension; anything other than `.json` is CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::Json,
            _ => FileFormat::Csv,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Csv => f.write_str("csv"),
            FileFormat::Json => f.write_str("json"),
        }
    }
}

/// One output file plus its in-memory snapshot.
pub struct FileSink<T> {
    path: PathBuf,
    format: FileFormat,
    series: Series<T>,
    /// Last timestamp physically present in the file.
    file_last: Option<i64>,
    /// Set when the file on disk no longer matches the snapshot (e.g. a torn
    /// trailing CSV row was dropped at load); the next write rewrites it.
    needs_rewrite: bool,
}

impl<T: SeriesRecord> FileSink<T> {
    /// Open (or prepare to create) `path`, loading any existing rows.
    pub fn open(path: impl Into<PathBuf>, format: FileFormat) -> Result<Self, SinkError> {
        let path = path.into();
        let (series, needs_rewrite) = if path.exists() {
            match format {
                FileFormat::Csv => load_csv(&path)?,
                FileFormat::Json => (load_json(&path)?, false),
            }
        } else {
            (Series::new(), false)
        };
        if !series.is_empty() {
            tracing::debug!(
                path = %path.display(),
                rows = series.len(),
                last = ?series.last_timestamp(),
                "loaded existing output"
            );
        }
        let file_last = series.last_timestamp();
        Ok(Self {
            path,
            format,
            series,
            file_last,
            needs_rewrite,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// The merged series as currently persisted.
    pub fn series(&self) -> &Series<T> {
        &self.series
    }

    fn io_err(&self, source: io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn rewrite(&mut self) -> Result<(), SinkError> {
        let result = match self.format {
            FileFormat::Csv => write_atomic(&self.path, |w| {
                let mut wtr = csv::Writer::from_writer(w);
                for record in &self.series {
                    wtr.serialize(record).map_err(io::Error::other)?;
                }
                wtr.flush()
            }),
            FileFormat::Json => write_atomic(&self.path, |w| {
                let rows: Vec<&T> = self.series.iter().collect();
                serde_json::to_writer_pretty(&mut *w, &rows).map_err(io::Error::other)?;
                w.write_all(b"\n")
            }),
        };
        result.map_err(|e| self.io_err(e))?;
        self.file_last = self.series.last_timestamp();
        self.needs_rewrite = false;
        Ok(())
    }

    fn append_csv(&mut self, batch: &Series<T>) -> Result<(), SinkError> {
        let write_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        for record in batch {
            wtr.serialize(record).map_err(|source| SinkError::Csv {
                path: self.path.clone(),
                source,
            })?;
        }
        wtr.flush().map_err(|e| self.io_err(e))?;
        let file = wtr.into_inner().map_err(|e| self.io_err(e.into_error()))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        self.file_last = batch.last_timestamp().max(self.file_last);
        Ok(())
    }
}

impl<T: SeriesRecord> SeriesSink<T> for FileSink<T> {
    fn describe(&self) -> String {
        format!("{}:{}", self.format, self.path.display())
    }

    fn last_timestamp(&self) -> Result<Option<i64>, SinkError> {
        Ok(self.series.last_timestamp())
    }

    fn write(&mut self, batch: &[T]) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let stats = self.series.merge_in(batch.iter().cloned());
        if stats.is_noop() && !self.needs_rewrite && self.path.exists() {
            return Ok(0);
        }

        let appendable = self.format == FileFormat::Csv
            && !self.needs_rewrite
            && stats.replaced == 0
            && strictly_after(batch, self.file_last);
        if appendable {
            let ordered: Series<T> = batch.iter().cloned().collect();
            self.append_csv(&ordered)?;
        } else {
            tracing::debug!(path = %self.path.display(), rows = self.series.len(), "rewriting output");
            self.rewrite()?;
        }
        Ok(stats.inserted + stats.replaced)
    }
}

fn load_csv<T: SeriesRecord>(path: &Path) -> Result<(Series<T>, bool), SinkError> {
    let file = File::open(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rdr = csv::Reader::from_reader(BufReader::new(file));
    let mut series = Series::new();
    let mut pending_error: Option<csv::Error> = None;

    for row in rdr.deserialize::<T>() {
        if let Some(source) = pending_error.take() {
            // A bad row followed by good rows is real corruption.
            return Err(SinkError::Csv {
                path: path.to_path_buf(),
                source,
            });
        }
        match row {
            Ok(record) => {
                series.merge_in(std::iter::once(record));
            }
            Err(e) => pending_error = Some(e),
        }
    }

    let torn_tail = pending_error.is_some();
    if let Some(e) = pending_error {
        tracing::warn!(path = %path.display(), error = %e, "dropping torn trailing CSV row");
    }
    Ok((series, torn_tail))
}

fn load_json<T: SeriesRecord>(path: &Path) -> Result<Series<T>, SinkError> {
    let text = fs::read_to_string(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(Series::new());
    }
    let rows: Vec<T> = serde_json::from_str(&text).map_err(|source| SinkError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OhlcBar, PricePoint};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn pt(ts: i64, price: &str) -> PricePoint {
        PricePoint::new(ts, Decimal::from_str(price).unwrap(), Decimal::from_str("1.5").unwrap())
    }

    #[test]
    fn csv_has_header_and_appends_newer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let mut sink = FileSink::<PricePoint>::open(&path, FileFormat::Csv).unwrap();

        sink.write(&[pt(1738169460, "102071.60")]).unwrap();
        sink.write(&[pt(1738169520, "102037.70")]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,datetime_utc,price,conf");
        assert_eq!(lines[1], "1738169460,2025-01-29T16:51:00+00:00,102071.60,1.5");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn csv_rewrites_on_overlap_and_stays_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let mut sink = FileSink::<PricePoint>::open(&path, FileFormat::Csv).unwrap();
        sink.write(&[pt(60, "1"), pt(180, "3")]).unwrap();
        sink.write(&[pt(120, "2"), pt(180, "3.5")]).unwrap();

        let reopened = FileSink::<PricePoint>::open(&path, FileFormat::Csv).unwrap();
        let prices: Vec<String> = reopened.series().iter().map(|p| p.price.to_string()).collect();
        assert_eq!(prices, vec!["1", "2", "3.5"]);
    }

    #[test]
    fn rewriting_same_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let mut sink = FileSink::<PricePoint>::open(&path, FileFormat::Csv).unwrap();
        sink.write(&[pt(60, "1")]).unwrap();
        let before = fs::read_to_string(&path).unwrap();
        assert_eq!(sink.write(&[pt(60, "1")]).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn json_is_pretty_array_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.json");
        let mut sink = FileSink::<PricePoint>::open(&path, FileFormat::Json).unwrap();
        sink.write(&[pt(120, "2"), pt(60, "1")]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n"));
        let reopened = FileSink::<PricePoint>::open(&path, FileFormat::Json).unwrap();
        assert_eq!(reopened.last_timestamp().unwrap(), Some(120));
        assert_eq!(reopened.series().len(), 2);
    }

    #[test]
    fn torn_trailing_row_is_dropped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        fs::write(
            &path,
            "timestamp,datetime_utc,price,conf\n60,1970-01-01T00:01:00+00:00,1,0\n120,1970-01-01T00:0",
        )
        .unwrap();

        let mut sink = FileSink::<PricePoint>::open(&path, FileFormat::Csv).unwrap();
        assert_eq!(sink.last_timestamp().unwrap(), Some(60));
        sink.write(&[pt(120, "2")]).unwrap();

        let reopened = FileSink::<PricePoint>::open(&path, FileFormat::Csv).unwrap();
        assert_eq!(reopened.series().len(), 2);
    }

    #[test]
    fn corrupt_middle_row_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        fs::write(
            &path,
            "timestamp,datetime_utc,price,conf\nxx,y,z,w\n60,1970-01-01T00:01:00+00:00,1,0\n",
        )
        .unwrap();
        assert!(matches!(
            FileSink::<PricePoint>::open(&path, FileFormat::Csv),
            Err(SinkError::Csv { .. })
        ));
    }

    #[test]
    fn ohlc_bars_use_their_own_header_and_blank_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily.csv");
        let mut sink = FileSink::<OhlcBar>::open(&path, FileFormat::Csv).unwrap();
        sink.write(&[OhlcBar {
            timestamp: 86_400,
            datetime_utc: crate::domain::iso_utc(86_400),
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: Some(1.5),
            volume: None,
        }])
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("timestamp,datetime_utc,open,high,low,close,volume\n"));
        assert!(text.contains(",1.5,\n"));
        let reopened = FileSink::<OhlcBar>::open(&path, FileFormat::Csv).unwrap();
        assert_eq!(reopened.series().iter().next().unwrap().volume, None);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("a.JSON")), FileFormat::Json);
        assert_eq!(FileFormat::from_path(Path::new("a.csv")), FileFormat::Csv);
        assert_eq!(FileFormat::from_path(Path::new("a")), FileFormat::Csv);
    }
}
