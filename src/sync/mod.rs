//! Resumable synchronization engine.
//!
//! [`enumerator`] turns the unstable remote listing into a finite pass of
//! new items; [`mutator`] applies downloads or deletes to them in
//! rate-limited batches while keeping the progress ledger checkpointed.
//! [`download`] and [`delete`] wire the two together for each task.

pub mod delete;
pub mod download;
pub mod enumerator;
pub mod mutator;

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::index::IndexError;
use crate::remote::RemoteError;
use crate::retry::RetryConfig;
use crate::state::{StateError, SyncRunStats};

pub use enumerator::EndReason;

/// Tunables shared by every pass.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub batch_delay_secs: u64,
    /// Retry policy for downloads. Deletes never retry.
    pub retry: RetryConfig,
    /// Save the ledger at least this often (in scanned positions).
    pub checkpoint_every: u64,
    pub repeat_threshold: u64,
    pub old_threshold: u64,
    /// Upper bound on positions scanned by the delete locate phase.
    pub max_scan: u64,
    pub no_progress_bar: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_secs: 2,
            retry: RetryConfig::default(),
            checkpoint_every: 50,
            repeat_threshold: 500,
            old_threshold: 100,
            max_scan: 15_000,
            no_progress_bar: false,
        }
    }
}

impl SyncSettings {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_secs)
    }
}

/// Failures that abort a pass. Per-item failures are recorded in the
/// ledger instead and never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote listing failed, progress saved: {0}")]
    Transport(RemoteError),

    #[error("Session rejected by the service (HTTP {status}); re-authenticate and run again")]
    Unauthenticated { status: u16 },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unauthenticated { status } => Self::Unauthenticated { status },
            other => Self::Transport(other),
        }
    }
}

/// Outcome of one task run, as reported to the user.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Past-tense verb for the mutation ("downloaded", "deleted").
    pub verb: &'static str,
    pub scanned: u64,
    pub mutated: u64,
    /// Already done before this run (valid local file or recorded earlier).
    pub already_present: u64,
    /// Absent from the remote collection.
    pub not_found: u64,
    pub failed: Vec<(String, String)>,
    pub interrupted: bool,
    pub dry_run: bool,
    pub end: Option<EndReason>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn stats(&self) -> SyncRunStats {
        SyncRunStats {
            items_mutated: self.mutated,
            items_skipped: self.already_present + self.not_found,
            items_failed: self.failed.len() as u64,
            interrupted: self.interrupted,
        }
    }

    pub fn log_summary(&self) {
        if self.dry_run {
            tracing::info!("── Dry Run Summary ──");
            tracing::info!("  {} items would be {}", self.mutated, self.verb);
        } else {
            tracing::info!("── Summary ──");
            tracing::info!(
                "  {} {}, {} skipped, {} not found, {} failed",
                self.mutated,
                self.verb,
                self.already_present,
                self.not_found,
                self.failed.len()
            );
        }
        tracing::info!("  scanned: {}", self.scanned);
        if let Some(end) = self.end {
            tracing::info!("  pass ended: {}", end);
        }
        if self.interrupted {
            tracing::info!("  interrupted; progress saved, run again to resume");
        }
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
        for (filename, error) in &self.failed {
            tracing::error!("  failed: {}: {}", filename, error);
        }
    }
}

/// Progress display for a pass. Hidden when disabled or stdout is not a
/// TTY. `total` of `None` gives a spinner, as listings have no count.
pub fn create_progress_bar(no_progress_bar: bool, total: Option<u64>) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let (pb, template) = match total {
        Some(total) => (
            ProgressBar::new(total),
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ),
        None => (
            ProgressBar::new_spinner(),
            "{spinner} [{elapsed_precise}] {pos} scanned {msg}",
        ),
    };
    match ProgressStyle::with_template(template) {
        Ok(style) => pb.set_style(style.progress_chars("=> ")),
        Err(e) => tracing::debug!("Invalid progress template: {}", e),
    }
    pb
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = SyncSettings::default();
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.batch_delay(), Duration::from_secs(2));
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.checkpoint_every, 50);
        assert_eq!(s.repeat_threshold, 500);
        assert_eq!(s.old_threshold, 100);
        assert_eq!(s.max_scan, 15_000);
    }

    #[test]
    fn test_unauthenticated_remote_error_maps_to_fatal() {
        let e: SyncError = RemoteError::Unauthenticated { status: 421 }.into();
        assert!(matches!(e, SyncError::Unauthenticated { status: 421 }));
        let e: SyncError = RemoteError::Transient("reset".into()).into();
        assert!(matches!(e, SyncError::Transport(_)));
    }

    #[test]
    fn test_report_stats() {
        let report = RunReport {
            verb: "downloaded",
            mutated: 4,
            already_present: 2,
            not_found: 1,
            failed: vec![("a.jpg".into(), "timed out".into())],
            ..Default::default()
        };
        let stats = report.stats();
        assert_eq!(stats.items_mutated, 4);
        assert_eq!(stats.items_skipped, 3);
        assert_eq!(stats.items_failed, 1);
        assert!(!stats.interrupted);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 00s");
        assert_eq!(format_duration(Duration::from_secs(754)), "12m 34s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        assert!(create_progress_bar(true, Some(100)).is_hidden());
        assert!(create_progress_bar(true, None).is_hidden());
    }

    #[test]
    fn test_create_progress_bar_with_total() {
        let pb = create_progress_bar(false, Some(42));
        if std::io::stdout().is_terminal() {
            assert_eq!(pb.length(), Some(42));
        } else {
            assert!(pb.is_hidden());
        }
    }
}
