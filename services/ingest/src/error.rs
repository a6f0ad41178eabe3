//! Error taxonomy for the ingestion pipeline.
//!
//! Cell-level problems (unparseable dates, bad numbers) and unknown columns
//! never show up here: they are absorbed as nulls or dropped columns by the
//! normalizer. What remains are the failures that stop a file or a run.

use std::path::PathBuf;

use thiserror::Error;

use crate::coordinator::FileState;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The column or country alias table is malformed. Fatal at startup.
    #[error("alias table error: {0}")]
    AliasTable(String),

    /// A snapshot file name does not carry an `MM-DD-YYYY` reporting date.
    #[error("cannot derive reporting date from file name '{0}'")]
    FileName(String),

    /// The snapshot could not be read or decoded.
    #[error("failed to read {path}: {message}")]
    Source { path: PathBuf, message: String },

    /// A store call failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Migrations could not be applied.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Loading a file failed. `stage` is the last state the file reached.
    #[error("ingestion of {file} failed after {stage}: {source}")]
    Ingestion {
        file: String,
        stage: FileState,
        #[source]
        source: Box<IngestError>,
    },

    /// A store implementation reported a failure that is not a driver error.
    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Wraps `source` as the failure of `file` at `stage`.
    pub fn ingestion(file: impl Into<String>, stage: FileState, source: IngestError) -> Self {
        IngestError::Ingestion {
            file: file.into(),
            stage,
            source: Box::new(source),
        }
    }

    pub fn unreadable(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        IngestError::Source {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
