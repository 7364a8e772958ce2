//! Delete task: locate each target in the live listing, then remove the
//! located items in rate-limited batches.
//!
//! Locating always scans from the newest item with an empty seen set:
//! deletes shift the listing, so a saved position would be meaningless.
//! Idempotence comes from the ledger instead, which remembers every
//! filename already deleted.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::remote::{RemoteCollection, RemoteError};
use crate::retry::RetryConfig;
use crate::state::{ProgressStore, TaskKind};

use super::enumerator::{CheckpointedEnumerator, EnumeratorOptions, Sighting};
use super::mutator::{BatchMutator, Mutation};
use super::{create_progress_bar, RunReport, SyncError, SyncSettings};

/// An item selected for remote deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteTarget {
    pub filename: String,
    /// Remote id from the index. When known, a sighting must match it too.
    pub id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DeleteReport {
    pub run: RunReport,
    /// Targets deleted by this run, in order.
    pub deleted: Vec<DeleteTarget>,
}

struct DeleteMutation;

#[async_trait]
impl Mutation for DeleteMutation {
    fn verb(&self) -> &'static str {
        "deleted"
    }

    fn retry(&self) -> RetryConfig {
        RetryConfig::no_retry()
    }

    async fn apply(&self, sighting: &Sighting) -> Result<(), RemoteError> {
        sighting.handle.delete().await
    }
}

enum Located {
    All,
    Partial,
    Interrupted,
}

/// Delete `targets` from the remote collection.
pub async fn run_delete(
    remote: &dyn RemoteCollection,
    store: &dyn ProgressStore,
    targets: &[DeleteTarget],
    settings: &SyncSettings,
    shutdown: CancellationToken,
) -> Result<DeleteReport, SyncError> {
    let started = Instant::now();
    let mutation = DeleteMutation;
    let mut mutator =
        BatchMutator::load(store, TaskKind::Delete, &mutation, settings, shutdown.clone()).await?;
    // Positions of this pass are target ordinals, not listing positions.
    mutator.rewind();

    let mut wanted: HashMap<&str, usize> = HashMap::new();
    for (i, target) in targets.iter().enumerate() {
        if mutator.is_done(&target.filename) {
            mutator.note_already_done();
        } else {
            wanted.entry(target.filename.as_str()).or_insert(i);
        }
    }
    let mut located: Vec<Option<Sighting>> = targets.iter().map(|_| None).collect();
    let mut report = DeleteReport::default();
    report.run.verb = mutation.verb();

    if wanted.is_empty() {
        tracing::info!("Nothing left to delete");
        report.run.already_present = mutator.summary().already_present;
        mutator.finish(true).await?;
        report.run.elapsed = started.elapsed();
        return Ok(report);
    }

    tracing::info!(
        targets = wanted.len(),
        max_scan = settings.max_scan,
        "Locating items in the remote collection"
    );
    let options = EnumeratorOptions::new(settings).with_max_scan(settings.max_scan);
    let mut enumerator = CheckpointedEnumerator::new(remote, options);
    let pb = create_progress_bar(settings.no_progress_bar, None);

    let phase = loop {
        if wanted.is_empty() {
            break Located::All;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Located::Interrupted,
            r = enumerator.next() => r,
        };
        let sighting = match next {
            Ok(Some(s)) => s,
            Ok(None) => break Located::Partial,
            Err(e) => {
                pb.finish_and_clear();
                mutator.interrupt().await?;
                return Err(e.into());
            }
        };
        pb.set_position(enumerator.position());
        let Some(&slot) = wanted.get(sighting.asset.filename.as_str()) else {
            continue;
        };
        let target = &targets[slot];
        if let Some(id) = &target.id {
            if *id != sighting.asset.id {
                pb.suspend(|| {
                    tracing::debug!(
                        filename = %target.filename,
                        "Same filename, different remote id; not a match"
                    )
                });
                continue;
            }
        }
        wanted.remove(target.filename.as_str());
        located[slot] = Some(sighting);
    };
    pb.finish_and_clear();
    report.run.scanned = enumerator.stats().scanned;
    report.run.end = enumerator.end_reason();

    if matches!(phase, Located::Interrupted) {
        let summary = mutator.interrupt().await?;
        report.run.already_present = summary.already_present;
        report.run.interrupted = true;
        report.run.elapsed = started.elapsed();
        return Ok(report);
    }
    if matches!(phase, Located::Partial) {
        tracing::info!(
            missing = wanted.len(),
            "Some items were not found in the remote collection"
        );
    }

    let found = located.iter().filter(|s| s.is_some()).count() as u64;
    let pb = create_progress_bar(settings.no_progress_bar, Some(found));
    let mut mutator = mutator.with_progress(pb.clone());
    let mut interrupted = false;

    for (ordinal, (target, slot)) in targets.iter().zip(located).enumerate() {
        let position = ordinal as u64 + 1;
        if shutdown.is_cancelled() {
            interrupted = true;
            break;
        }
        match slot {
            Some(mut sighting) => {
                sighting.position = position;
                pb.set_message(target.filename.clone());
                mutator.push(sighting).await?;
                pb.inc(1);
            }
            None if wanted.contains_key(target.filename.as_str()) => {
                pb.suspend(|| {
                    tracing::warn!(filename = %target.filename, "Not found remotely, skipping")
                });
                mutator.tally_not_found();
                wanted.remove(target.filename.as_str());
            }
            None => {}
        }
        mutator.observe(position).await?;
    }
    pb.finish_and_clear();

    let summary = if interrupted {
        mutator.interrupt().await?
    } else {
        mutator.finish(true).await?
    };

    let applied: HashSet<&str> = summary.applied.iter().map(String::as_str).collect();
    report.deleted = targets
        .iter()
        .filter(|t| applied.contains(t.filename.as_str()))
        .cloned()
        .collect();

    report.run.mutated = summary.mutated;
    report.run.already_present = summary.already_present;
    report.run.not_found = summary.not_found;
    report.run.failed = summary.failed;
    report.run.interrupted = summary.interrupted;
    report.run.elapsed = started.elapsed();
    Ok(report)
}
