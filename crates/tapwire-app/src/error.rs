//! Error types for the console front end.

use std::path::PathBuf;

use thiserror::Error;

/// Front end errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// Relay configuration error.
    #[error("config error: {0}")]
    Relay(#[from] tapwire_core::RelayError),

    /// Traffic log could not be created.
    #[error("cannot create traffic log {0}: {1}")]
    LogFile(PathBuf, std::io::Error),

    /// No documents directory to put the default traffic log in.
    #[error("no documents directory available for the traffic log")]
    NoDocumentsDir,

    /// CSV error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for front end operations.
pub type Result<T> = std::result::Result<T, AppError>;
