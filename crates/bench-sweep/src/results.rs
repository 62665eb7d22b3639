//! Result log: one CSV row per sweep cell
//!
//! Rows are flushed as they are written so a partial sweep stays
//! readable after a crash.

use bench_core::{BatchResult, OutputConfig, Result, SweepCell};
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Column names of the result file
pub const CSV_HEADER: [&str; 10] = [
    "instances",
    "parallel",
    "batch",
    "ubatch",
    "max_tokens",
    "concurrency",
    "throughput_tps",
    "total_tokens",
    "elapsed_s",
    "errors",
];

/// A measured (or zero-valued) cell
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub cell: SweepCell,
    pub result: BatchResult,
}

impl ResultRow {
    pub fn new(cell: SweepCell, result: BatchResult) -> Self {
        Self { cell, result }
    }

    pub fn throughput(&self) -> f64 {
        self.result.throughput_tokens_per_sec
    }

    /// Fields in [`CSV_HEADER`] order
    pub fn to_record(&self) -> [String; 10] {
        let cell = &self.cell;
        let result = &self.result;
        [
            cell.instances.to_string(),
            cell.parallel.to_string(),
            cell.batch_label(),
            cell.ubatch_label(),
            cell.max_tokens.to_string(),
            cell.concurrency.to_string(),
            format!("{:.1}", result.throughput_tokens_per_sec),
            result.total_tokens.to_string(),
            format!("{:.2}", result.elapsed_seconds),
            result.error_count.to_string(),
        ]
    }
}

/// Destination of result rows
pub trait ResultSink: Send {
    fn record(&mut self, row: &ResultRow) -> Result<()>;
}

/// CSV writer that flushes after every row
pub struct CsvResultLog<W: Write> {
    writer: csv::Writer<W>,
    path: Option<PathBuf>,
    rows: usize,
}

impl CsvResultLog<File> {
    /// Create the file (and missing parent directories) and write the header
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log = Self::from_writer(File::create(path)?)?;
        log.path = Some(path.to_path_buf());
        info!(path = %path.display(), "Writing results");
        Ok(log)
    }
}

impl<W: Write> CsvResultLog<W> {
    pub fn from_writer(inner: W) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        Ok(Self {
            writer,
            path: None,
            rows: 0,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| bench_core::Error::Io(e.into_error()))
    }
}

impl<W: Write + Send> ResultSink for CsvResultLog<W> {
    fn record(&mut self, row: &ResultRow) -> Result<()> {
        self.writer.write_record(row.to_record())?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}

/// Keeps rows in memory, for tests and callers that post-process
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<ResultRow>,
}

impl ResultSink for MemorySink {
    fn record(&mut self, row: &ResultRow) -> Result<()> {
        self.rows.push(row.clone());
        Ok(())
    }
}

/// `<results_dir>/<subdir>/<prefix>_<YYYYmmdd_HHMMSS>.csv`
pub fn results_path(output: &OutputConfig, now: DateTime<Local>) -> PathBuf {
    output.results_dir.join(&output.subdir).join(format!(
        "{}_{}.csv",
        output.prefix,
        now.format("%Y%m%d_%H%M%S")
    ))
}
