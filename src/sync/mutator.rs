//! Batched, checkpointed application of a per-item mutation.
//!
//! Items are applied one at a time, in the order they were pushed. After
//! every batch the ledger is saved and the mutator pauses before accepting
//! more work. The saved cursor never passes an item that is still pending
//! or that failed during this run, so a resumed run replays only what was
//! settled.

use async_trait::async_trait;
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use crate::remote::RemoteError;
use crate::retry::{retry_with_delay, RetryAction, RetryConfig};
use crate::state::{ProgressState, ProgressStore, TaskKind};

use super::enumerator::Sighting;
use super::{SyncError, SyncSettings};

/// A mutating operation on one remote item.
#[async_trait]
pub trait Mutation: Send + Sync {
    /// Past tense, for log lines and summaries.
    fn verb(&self) -> &'static str;

    /// Retry policy for transient failures.
    fn retry(&self) -> RetryConfig;

    async fn apply(&self, sighting: &Sighting) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Default)]
pub struct MutationSummary {
    pub mutated: u64,
    /// Filenames mutated by this run, in order.
    pub applied: Vec<String>,
    pub already_present: u64,
    pub not_found: u64,
    /// Filename and error of every item that failed during this run.
    pub failed: Vec<(String, String)>,
    /// Size of each flushed batch, in order.
    pub flushes: Vec<usize>,
    pub checkpoints: u64,
    pub interrupted: bool,
}

pub struct BatchMutator<'a> {
    store: &'a dyn ProgressStore,
    task: TaskKind,
    mutation: &'a dyn Mutation,
    settings: &'a SyncSettings,
    shutdown: CancellationToken,
    state: ProgressState,
    pending: Vec<Sighting>,
    /// Highest position the caller has finished looking at.
    observed: u64,
    last_checkpoint_at: u64,
    lowest_failed: Option<u64>,
    summary: MutationSummary,
    pb: ProgressBar,
}

impl<'a> BatchMutator<'a> {
    /// Load the ledger of `task` and prepare to mutate.
    pub async fn load(
        store: &'a dyn ProgressStore,
        task: TaskKind,
        mutation: &'a dyn Mutation,
        settings: &'a SyncSettings,
        shutdown: CancellationToken,
    ) -> Result<BatchMutator<'a>, SyncError> {
        let state = store.load(task).await?;
        let counters = state.counters();
        if !state.is_empty() {
            tracing::info!(
                task = task.as_str(),
                processed = counters.processed,
                failed = counters.failed,
                skipped = counters.skipped,
                cursor = state.last_position,
                "Resuming from saved progress"
            );
        }
        let observed = state.last_position;
        Ok(Self {
            store,
            task,
            mutation,
            settings,
            shutdown,
            state,
            pending: Vec::new(),
            observed,
            last_checkpoint_at: observed,
            lowest_failed: None,
            summary: MutationSummary::default(),
            pb: ProgressBar::hidden(),
        })
    }

    /// Count positions from zero again, discarding the saved cursor. For
    /// passes whose positions are not listing positions.
    pub fn rewind(&mut self) {
        self.state.last_position = 0;
        self.observed = 0;
        self.last_checkpoint_at = 0;
    }

    /// Route log lines through `pb` so they don't garble the bar.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.pb = pb;
        self
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn summary(&self) -> &MutationSummary {
        &self.summary
    }

    /// Whether the ledger already settled `filename` successfully.
    pub fn is_done(&self, filename: &str) -> bool {
        self.state.is_processed(filename)
    }

    /// Count an item the ledger already holds as processed.
    pub fn note_already_done(&mut self) {
        self.summary.already_present += 1;
    }

    /// Record an item whose effect is already in place without applying
    /// the mutation (e.g. a valid local copy exists).
    pub fn record_present(&mut self, filename: &str) {
        self.state.record_processed(filename);
        self.state.record_skipped();
        self.summary.already_present += 1;
    }

    /// Tally an item that no longer exists remotely.
    pub fn tally_not_found(&mut self) {
        self.state.record_skipped();
        self.summary.not_found += 1;
    }

    /// Queue an item. Flushes when the batch is full; returns whether a
    /// checkpoint was written.
    pub async fn push(&mut self, sighting: Sighting) -> Result<bool, SyncError> {
        self.observed = self.observed.max(sighting.position);
        self.pending.push(sighting);
        if self.pending.len() >= self.settings.batch_size.max(1) {
            self.flush(false).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether the next [`push`](Self::push) fills the batch and flushes it.
    pub fn flush_due(&self) -> bool {
        self.pending.len() + 1 >= self.settings.batch_size.max(1)
    }

    /// Whether [`observe`](Self::observe) at `position` writes a checkpoint.
    pub fn checkpoint_due(&self, position: u64) -> bool {
        let every = self.settings.checkpoint_every.max(1);
        self.observed.max(position).saturating_sub(self.last_checkpoint_at) >= every
    }

    /// Mark every position up to `position` as looked at. Saves the ledger
    /// every `checkpoint_every` positions; returns whether it did.
    pub async fn observe(&mut self, position: u64) -> Result<bool, SyncError> {
        let due = self.checkpoint_due(position);
        self.observed = self.observed.max(position);
        if due {
            self.checkpoint().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flush what is left and write the final checkpoint. A completed pass
    /// resets the cursor so the next run starts from the newest item.
    pub async fn finish(mut self, completed: bool) -> Result<MutationSummary, SyncError> {
        if !self.pending.is_empty() {
            self.flush(true).await?;
        }
        if completed && !self.summary.interrupted && self.pending.is_empty() {
            self.state.last_position = 0;
            self.save().await?;
        } else {
            self.checkpoint().await?;
        }
        Ok(self.summary)
    }

    /// Save progress without applying anything still pending.
    pub async fn interrupt(mut self) -> Result<MutationSummary, SyncError> {
        self.summary.interrupted = true;
        if !self.pending.is_empty() {
            tracing::info!(
                pending = self.pending.len(),
                "Leaving pending items for the next run"
            );
        }
        self.checkpoint().await?;
        Ok(self.summary)
    }

    async fn flush(&mut self, last: bool) -> Result<(), SyncError> {
        let batch = std::mem::take(&mut self.pending);
        let size = batch.len();
        let mut items = batch.into_iter();

        while let Some(sighting) = items.next() {
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                r = self.apply_with_retry(&sighting) => Some(r),
            };
            let filename = sighting.asset.filename.clone();
            match outcome {
                None => {
                    self.pending = std::iter::once(sighting).chain(items).collect();
                    self.summary.interrupted = true;
                    self.checkpoint().await?;
                    return Ok(());
                }
                Some(Ok(())) => {
                    self.state.record_processed(&filename);
                    self.summary.mutated += 1;
                    self.summary.applied.push(filename.clone());
                    self.pb.suspend(|| {
                        tracing::info!(
                            position = sighting.position,
                            "{} {}",
                            capitalize(self.mutation.verb()),
                            filename
                        )
                    });
                }
                Some(Err(e)) if e.is_not_found() => {
                    self.pb.suspend(|| {
                        tracing::warn!(filename = %filename, "Item no longer exists remotely")
                    });
                    self.tally_not_found();
                }
                Some(Err(e)) if e.is_fatal() => {
                    self.pending = std::iter::once(sighting).chain(items).collect();
                    self.checkpoint().await?;
                    return Err(e.into());
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    self.pb.suspend(|| {
                        tracing::error!(filename = %filename, error = %message, "Item failed")
                    });
                    self.state.record_failed(&filename, &message);
                    self.summary.failed.push((filename, message));
                    self.lowest_failed = Some(
                        self.lowest_failed
                            .map_or(sighting.position, |p| p.min(sighting.position)),
                    );
                }
            }
        }

        self.summary.flushes.push(size);
        self.checkpoint().await?;

        if !last && self.settings.batch_delay_secs > 0 {
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.settings.batch_delay()) => {}
            }
        }
        Ok(())
    }

    async fn apply_with_retry(&self, sighting: &Sighting) -> Result<(), RemoteError> {
        let retry = self.mutation.retry();
        retry_with_delay(
            &retry,
            |e: &RemoteError| {
                if e.is_transient() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.mutation.apply(sighting),
        )
        .await
    }

    /// Highest position such that nothing at or before it is still pending
    /// or failed during this run.
    fn safe_cursor(&self) -> u64 {
        let mut safe = self.observed;
        if let Some(first) = self.pending.iter().map(|s| s.position).min() {
            safe = safe.min(first.saturating_sub(1));
        }
        if let Some(failed) = self.lowest_failed {
            safe = safe.min(failed.saturating_sub(1));
        }
        safe
    }

    async fn checkpoint(&mut self) -> Result<(), SyncError> {
        let safe = self.safe_cursor();
        self.state.advance_cursor(safe);
        self.last_checkpoint_at = self.observed;
        self.save().await
    }

    async fn save(&mut self) -> Result<(), SyncError> {
        self.store.save(self.task, &self.state).await?;
        self.summary.checkpoints += 1;
        tracing::debug!(
            task = self.task.as_str(),
            cursor = self.state.last_position,
            processed = self.state.processed.len(),
            "Checkpoint saved"
        );
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
