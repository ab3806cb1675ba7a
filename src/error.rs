//! Crate-wide error type for persistence and configuration failures.
//!
//! Network and per-source lookup failures are not represented here: they are
//! row-level outcomes that get recorded and never abort a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("registry database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("checkpoint {path} is unreadable: {message}")]
    Checkpoint { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("table {path} is missing required column '{column}'")]
    MissingColumn { path: String, column: String },
}

impl HarvestError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
