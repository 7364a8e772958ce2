//! Durable progress ledger.
//!
//! One SQLite file per backup root records, for each resumable task, which
//! filenames were processed, which failed and why, and from what position
//! an interrupted pass resumes. Saves replace a task's ledger wholesale
//! inside one transaction, so a reader never observes a half-written
//! checkpoint.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{ProgressStore, SqliteProgressStore};
pub use error::StateError;
pub use types::{ProgressState, SyncRunRecord, SyncRunStats, TaskKind};
