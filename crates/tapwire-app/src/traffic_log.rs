//! CSV log of relayed traffic.
//!
//! One record per dump line: direction tag, offset, eight hex cells and the
//! display characters.

use std::fs::File;
use std::path::{Path, PathBuf};

use directories::UserDirs;
use tapwire_core::Side;

use crate::error::{AppError, Result};
use crate::hexdump;

/// File name of the traffic log in the documents directory.
pub const DEFAULT_LOG_NAME: &str = "FS_Data_Stream.csv";

/// Returns the default traffic log path.
pub fn default_path() -> Result<PathBuf> {
    UserDirs::new()
        .and_then(|dirs| dirs.document_dir().map(|d| d.join(DEFAULT_LOG_NAME)))
        .ok_or(AppError::NoDocumentsDir)
}

/// Direction tag for chunks received on `side`.
pub fn direction_tag(side: Side) -> &'static str {
    match side {
        Side::Local => "L",
        Side::Remote => "R",
    }
}

/// Writer for the traffic log. The file is truncated when opened.
pub struct TrafficLog<W: std::io::Write = File> {
    writer: csv::Writer<W>,
    records: u64,
}

impl TrafficLog<File> {
    /// Creates (or truncates) the log at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| AppError::LogFile(path.to_path_buf(), e))?;
        tracing::info!("Writing traffic log to {:?}", path);
        Ok(Self::from_writer(file))
    }
}

impl<W: std::io::Write> TrafficLog<W> {
    /// Wraps an arbitrary writer.
    pub fn from_writer(inner: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        Self { writer, records: 0 }
    }

    /// Appends one chunk received on `side`.
    pub fn record(&mut self, side: Side, data: &[u8]) -> Result<()> {
        let tag = direction_tag(side);
        for line in hexdump::lines(data) {
            let mut row = Vec::with_capacity(hexdump::BYTES_PER_LINE + 3);
            row.push(tag.to_string());
            row.push(line.offset_label());
            row.extend(line.hex_cells());
            row.push(line.chars());
            self.writer.write_record(&row)?;
            self.records += 1;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flushes and returns the inner writer.
    #[cfg(test)]
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| AppError::Io(std::io::Error::new(e.error().kind(), e.error().to_string())))
    }
}

impl<W: std::io::Write> std::fmt::Debug for TrafficLog<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficLog")
            .field("records", &self.records)
            .finish()
    }
}
