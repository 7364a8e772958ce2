//! Download task: mirror new remote items into the local year/month tree
//! while capturing their metadata into the index.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::index::{Index, IndexRecord};
use crate::paths::{is_valid_local_file, local_download_path, part_path, set_file_mtime};
use crate::remote::{Asset, RemoteCollection, RemoteError};
use crate::retry::RetryConfig;
use crate::state::{ProgressStore, TaskKind};

use super::enumerator::{CheckpointedEnumerator, EnumeratorOptions, Sighting};
use super::mutator::{BatchMutator, Mutation};
use super::{create_progress_bar, RunReport, SyncError, SyncSettings};

pub struct DownloadOptions<'a> {
    pub directory: &'a Path,
    pub index_path: &'a Path,
    /// Only items added after this instant are considered.
    pub cutoff: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub run: RunReport,
    /// Metadata of every item downloaded by this run.
    pub downloaded: Vec<Asset>,
}

/// Streams an item into `<name>.part`, then renames it into place.
struct DownloadMutation {
    directory: PathBuf,
    retry: RetryConfig,
    completed: Mutex<Vec<Asset>>,
}

impl DownloadMutation {
    fn take_completed(&self) -> Vec<Asset> {
        self.completed
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Mutation for DownloadMutation {
    fn verb(&self) -> &'static str {
        "downloaded"
    }

    fn retry(&self) -> RetryConfig {
        self.retry
    }

    async fn apply(&self, sighting: &Sighting) -> Result<(), RemoteError> {
        let asset = &sighting.asset;
        let date = asset.placement_date();
        let path = local_download_path(&self.directory, date, &asset.filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(&path);

        tracing::debug!(size_bytes = asset.size, path = %path.display(), "downloading");

        let mut file = tokio::fs::File::create(&part).await?;
        let written = match sighting.handle.download(&mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        file.flush().await?;
        drop(file);

        if asset.size > 0 && written != asset.size {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(RemoteError::Transient(format!(
                "size mismatch for {}: expected {} bytes, got {}",
                asset.filename, asset.size, written
            )));
        }
        tokio::fs::rename(&part, &path).await?;

        if let Some(date) = date {
            let mtime_path = path.clone();
            let ts = date.timestamp();
            match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, ts)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Could not set mtime on {}: {}", path.display(), e),
                Err(e) => tracing::warn!("mtime task failed: {}", e),
            }
        }

        if let Ok(mut completed) = self.completed.lock() {
            completed.push(asset.clone());
        }
        Ok(())
    }
}

/// Run one download pass.
///
/// Already-recorded items and valid local copies are skipped; everything
/// else goes through the batch mutator. The index is saved alongside each
/// ledger checkpoint and once more at the end, whatever the outcome.
pub async fn run_download(
    remote: &dyn RemoteCollection,
    store: &dyn ProgressStore,
    index: &mut Index,
    options: &DownloadOptions<'_>,
    settings: &SyncSettings,
    shutdown: CancellationToken,
) -> Result<DownloadReport, SyncError> {
    let started = Instant::now();
    let mutation = DownloadMutation {
        directory: options.directory.to_path_buf(),
        retry: settings.retry,
        completed: Mutex::new(Vec::new()),
    };
    let pb = create_progress_bar(settings.no_progress_bar, None);
    let mut mutator = BatchMutator::load(
        store,
        TaskKind::Download,
        &mutation,
        settings,
        shutdown.clone(),
    )
    .await?
    .with_progress(pb.clone());

    let state = mutator.state();
    let mut enum_options = EnumeratorOptions::new(settings)
        .resume_after(state.last_position)
        .with_cutoff(options.cutoff);
    if state.failed.is_empty() {
        enum_options = enum_options.seeded(state.processed.iter().cloned());
    } else {
        tracing::info!(
            failed = state.failed.len(),
            "Previous failures pending, scanning the whole collection to retry them"
        );
    }
    if let Some(cutoff) = options.cutoff {
        tracing::info!("Only considering items added since {}", cutoff.format("%Y-%m-%d"));
    }
    let mut enumerator = CheckpointedEnumerator::new(remote, enum_options);

    let mut scan = Scan {
        enumerator: &mut enumerator,
        mutator: &mut mutator,
        index: &mut *index,
        options,
        pb: &pb,
        shutdown: &shutdown,
        would_download: 0,
    };
    let outcome = scan.run().await;
    let would_download = scan.would_download;
    pb.finish_and_clear();

    if !options.dry_run {
        index.save(options.index_path).await?;
    }

    let stats = enumerator.stats();
    let end = enumerator.end_reason();
    let stopped_early = matches!(outcome, Ok(false));
    let summary = if options.dry_run {
        outcome?;
        mutator.summary().clone()
    } else {
        match outcome {
            Ok(true) => mutator.finish(true).await?,
            Ok(false) => mutator.interrupt().await?,
            Err(e) => {
                mutator.interrupt().await?;
                return Err(e);
            }
        }
    };

    let run = RunReport {
        verb: mutation.verb(),
        scanned: stats.scanned,
        mutated: if options.dry_run {
            would_download
        } else {
            summary.mutated
        },
        already_present: summary.already_present,
        not_found: summary.not_found,
        failed: summary.failed,
        interrupted: summary.interrupted || stopped_early,
        dry_run: options.dry_run,
        end,
        elapsed: started.elapsed(),
    };
    Ok(DownloadReport {
        run,
        downloaded: mutation.take_completed(),
    })
}

struct Scan<'s, 'e, 'm> {
    enumerator: &'s mut CheckpointedEnumerator<'e>,
    mutator: &'s mut BatchMutator<'m>,
    index: &'s mut Index,
    options: &'s DownloadOptions<'s>,
    pb: &'s ProgressBar,
    shutdown: &'s CancellationToken,
    would_download: u64,
}

impl Scan<'_, '_, '_> {
    /// Returns whether the pass ran to its end (as opposed to being
    /// interrupted).
    async fn run(&mut self) -> Result<bool, SyncError> {
        let mut index_dirty = false;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(false),
                r = self.enumerator.next() => r?,
            };
            let Some(sighting) = next else {
                return Ok(true);
            };
            self.pb.set_position(self.enumerator.position());
            self.pb.set_message(sighting.asset.filename.clone());

            index_dirty |= self.index.merge(IndexRecord::from_asset(&sighting.asset));

            let filename = sighting.asset.filename.clone();
            if self.mutator.is_done(&filename) {
                self.mutator.note_already_done();
            } else {
                let path = local_download_path(
                    self.options.directory,
                    sighting.asset.placement_date(),
                    &filename,
                );
                if is_valid_local_file(&path).await {
                    self.mutator.record_present(&filename);
                } else if self.options.dry_run {
                    self.pb.suspend(|| {
                        tracing::info!("[DRY RUN] Would download {}", path.display())
                    });
                    self.would_download += 1;
                } else {
                    // The index reaches disk before the ledger names the file.
                    if index_dirty && self.mutator.flush_due() {
                        self.index.save(self.options.index_path).await?;
                        index_dirty = false;
                    }
                    self.mutator.push(sighting).await?;
                }
            }

            if !self.options.dry_run {
                let position = self.enumerator.position();
                if index_dirty && self.mutator.checkpoint_due(position) {
                    self.index.save(self.options.index_path).await?;
                    index_dirty = false;
                }
                self.mutator.observe(position).await?;
            }
        }
    }
}
