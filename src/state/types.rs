//! Types for the progress ledger.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

/// Which resumable task a ledger belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Download,
    Delete,
    Index,
}

impl TaskKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Delete => "delete",
            Self::Index => "index",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "download" => Some(Self::Download),
            "delete" => Some(Self::Delete),
            "index" => Some(Self::Index),
            _ => None,
        }
    }

    pub const ALL: [TaskKind; 3] = [TaskKind::Download, TaskKind::Delete, TaskKind::Index];
}

/// Terminal outcome of one filename within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed,
    Failed,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable progress of one task.
///
/// `processed` and `failed` are kept disjoint by the recording methods.
/// `skipped` is a tally only: skipped items are not stored by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub processed: BTreeSet<String>,
    /// Failed filename to the last error message.
    pub failed: BTreeMap<String, String>,
    pub last_position: u64,
    pub skipped: u64,
}

/// Counter view derived from a [`ProgressState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ProgressState {
    pub fn is_processed(&self, filename: &str) -> bool {
        self.processed.contains(filename)
    }

    pub fn is_failed(&self, filename: &str) -> bool {
        self.failed.contains_key(filename)
    }

    /// Move `filename` into the processed set.
    pub fn record_processed(&mut self, filename: &str) {
        self.failed.remove(filename);
        self.processed.insert(filename.to_string());
    }

    /// Move `filename` into the failed set. A processed item stays processed.
    pub fn record_failed(&mut self, filename: &str, error: &str) {
        if self.processed.contains(filename) {
            return;
        }
        self.failed.insert(filename.to_string(), error.to_string());
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Advance the resume cursor. Never moves backwards.
    pub fn advance_cursor(&mut self, position: u64) {
        self.last_position = self.last_position.max(position);
    }

    pub fn counters(&self) -> ProgressCounters {
        ProgressCounters {
            processed: self.processed.len() as u64,
            failed: self.failed.len() as u64,
            skipped: self.skipped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
            && self.failed.is_empty()
            && self.last_position == 0
            && self.skipped == 0
    }
}

/// Statistics written when a sync run completes.
#[derive(Debug, Clone, Default)]
pub struct SyncRunStats {
    pub items_mutated: u64,
    pub items_skipped: u64,
    pub items_failed: u64,
    /// Whether the run was interrupted (shutdown, transport failure, auth).
    pub interrupted: bool,
}

/// A persisted sync run row.
#[derive(Debug, Clone)]
pub struct SyncRunRecord {
    pub id: i64,
    pub task: TaskKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: SyncRunStats,
}
