//! Index passes over the remote collection.
//!
//! `build` records every newly seen filename and resumes from the `index`
//! ledger cursor after an interruption. `refresh` only fills in records
//! that still have unknown fields and stops once none are left.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::remote::{RemoteCollection, RemoteError};
use crate::state::{ProgressStore, TaskKind};
use crate::sync::enumerator::{CheckpointedEnumerator, EnumeratorOptions, Sighting};
use crate::sync::{create_progress_bar, format_duration, EndReason, SyncError, SyncSettings};

use super::{Index, IndexRecord};

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub scanned: u64,
    pub replayed: u64,
    pub added: u64,
    pub updated: u64,
    /// Records still missing fields after the pass.
    pub incomplete: usize,
    pub total: usize,
    pub end: Option<EndReason>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl IndexReport {
    pub fn log_summary(&self) {
        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} added, {} updated, {} total in index",
            self.added,
            self.updated,
            self.total
        );
        if self.incomplete > 0 {
            tracing::info!("  {} records still missing metadata", self.incomplete);
        }
        tracing::info!("  scanned: {}", self.scanned);
        if let Some(end) = self.end {
            tracing::info!("  pass ended: {}", end);
        }
        if self.interrupted {
            tracing::info!("  interrupted; progress saved, run again to resume");
        }
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
    }
}

enum Step {
    Item(Sighting),
    Done,
    Cancelled,
    Failed(RemoteError),
}

async fn next_step(
    enumerator: &mut CheckpointedEnumerator<'_>,
    shutdown: &CancellationToken,
) -> Step {
    if shutdown.is_cancelled() {
        return Step::Cancelled;
    }
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Step::Cancelled,
        r = enumerator.next() => match r {
            Ok(Some(s)) => Step::Item(s),
            Ok(None) => Step::Done,
            Err(e) => Step::Failed(e),
        },
    }
}

/// Full pass: capture a record for every filename not yet in the index.
pub async fn build(
    remote: &dyn RemoteCollection,
    store: &dyn ProgressStore,
    index: &mut Index,
    index_path: &Path,
    settings: &SyncSettings,
    shutdown: CancellationToken,
) -> Result<IndexReport, SyncError> {
    let started = Instant::now();
    let mut state = store.load(TaskKind::Index).await?;
    if state.last_position > 0 {
        tracing::info!(cursor = state.last_position, "Resuming index build");
    }
    let options = EnumeratorOptions::new(settings).resume_after(state.last_position);
    let mut enumerator = CheckpointedEnumerator::new(remote, options);
    let pb = create_progress_bar(settings.no_progress_bar, None);
    let every = settings.checkpoint_every.max(1);

    let mut report = IndexReport::default();
    let mut since_save = 0u64;

    let failure = loop {
        match next_step(&mut enumerator, &shutdown).await {
            Step::Item(sighting) => {
                pb.set_position(enumerator.position());
                let record = IndexRecord::from_asset(&sighting.asset);
                if index.contains(&record.filename) {
                    if index.merge(record) {
                        report.updated += 1;
                        since_save += 1;
                    }
                } else {
                    index.insert_new(record);
                    report.added += 1;
                    since_save += 1;
                }
                if since_save >= every {
                    index.save(index_path).await?;
                    state.advance_cursor(enumerator.position());
                    store.save(TaskKind::Index, &state).await?;
                    pb.suspend(|| {
                        tracing::info!(
                            position = enumerator.position(),
                            indexed = index.len(),
                            "Checkpoint"
                        )
                    });
                    since_save = 0;
                }
            }
            Step::Done => break None,
            Step::Cancelled => {
                report.interrupted = true;
                break None;
            }
            Step::Failed(e) => break Some(e),
        }
    };
    pb.finish_and_clear();

    index.save(index_path).await?;
    if report.interrupted || failure.is_some() {
        state.advance_cursor(enumerator.position());
    } else {
        state.last_position = 0;
    }
    store.save(TaskKind::Index, &state).await?;

    if let Some(e) = failure {
        return Err(e.into());
    }

    let stats = enumerator.stats();
    report.scanned = stats.scanned;
    report.replayed = stats.replayed;
    report.end = enumerator.end_reason();
    report.total = index.len();
    report.incomplete = index.needs_refresh_count();
    report.elapsed = started.elapsed();
    Ok(report)
}

/// Refresh pass: fill unknown fields of existing records. Complete records
/// are left untouched and no new records are added.
pub async fn refresh(
    remote: &dyn RemoteCollection,
    index: &mut Index,
    index_path: &Path,
    settings: &SyncSettings,
    shutdown: CancellationToken,
) -> Result<IndexReport, SyncError> {
    let started = Instant::now();
    let mut report = IndexReport {
        total: index.len(),
        ..Default::default()
    };
    let mut remaining = index.needs_refresh_count();
    if remaining == 0 {
        tracing::info!("All index records are complete");
        report.elapsed = started.elapsed();
        return Ok(report);
    }
    tracing::info!(incomplete = remaining, "Refreshing index records");

    let mut enumerator =
        CheckpointedEnumerator::new(remote, EnumeratorOptions::new(settings));
    let pb = create_progress_bar(settings.no_progress_bar, Some(remaining as u64));
    let every = settings.checkpoint_every.max(1);

    let failure = loop {
        if remaining == 0 {
            break None;
        }
        match next_step(&mut enumerator, &shutdown).await {
            Step::Item(sighting) => {
                let name = &sighting.asset.filename;
                let incomplete = index.get(name).is_some_and(IndexRecord::needs_refresh);
                if !incomplete {
                    continue;
                }
                if !index.merge(IndexRecord::from_asset(&sighting.asset)) {
                    continue;
                }
                report.updated += 1;
                pb.inc(1);
                if !index.get(name).is_some_and(IndexRecord::needs_refresh) {
                    remaining -= 1;
                }
                if report.updated % every == 0 {
                    index.save(index_path).await?;
                    pb.suspend(|| tracing::info!(updated = report.updated, "Checkpoint"));
                }
            }
            Step::Done => break None,
            Step::Cancelled => {
                report.interrupted = true;
                break None;
            }
            Step::Failed(e) => break Some(e),
        }
    };
    pb.finish_and_clear();

    index.save(index_path).await?;
    if let Some(e) = failure {
        return Err(e.into());
    }

    report.scanned = enumerator.stats().scanned;
    report.end = enumerator.end_reason();
    report.incomplete = index.needs_refresh_count();
    report.elapsed = started.elapsed();
    Ok(report)
}
