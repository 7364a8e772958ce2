//! Failures of the progress ledger.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Cannot open progress ledger {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Creating or upgrading the ledger tables failed.
    #[error("Cannot prepare progress ledger tables: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A read or write against an open ledger failed. A failed save leaves
    /// the previously saved state in place.
    #[error("Progress ledger statement failed: {0}")]
    Statement(#[source] rusqlite::Error),

    /// A thread panicked while holding the ledger connection.
    #[error("Progress ledger connection is poisoned")]
    Poisoned,

    #[error("Progress ledger worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// The ledger was written by a newer release.
    #[error("Progress ledger schema v{found} is newer than this release understands (v{expected})")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Statement(source)
    }
}
