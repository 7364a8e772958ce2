//! Position-tracking wrapper over the remote listing.
//!
//! The listing has no end marker that can be trusted: once exhausted it may
//! silently start over from the newest item. The enumerator yields every
//! filename at most once per pass and decides heuristically when the
//! collection has been covered.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use crate::remote::{Asset, AssetHandle, AssetStream, RemoteCollection, RemoteError};

use super::SyncSettings;

/// Why a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The underlying listing returned no more items.
    Exhausted,
    /// Too many consecutive already-seen filenames: the listing wrapped.
    RepeatThreshold,
    /// Too many consecutive items older than the cutoff.
    CutoffReached,
    /// The per-pass scan limit was hit.
    ScanLimit,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exhausted => "listing exhausted",
            Self::RepeatThreshold => "end of collection detected",
            Self::CutoffReached => "reached cutoff date",
            Self::ScanLimit => "scan limit reached",
        };
        f.write_str(s)
    }
}

/// One new item, with its position in the underlying listing.
pub struct Sighting {
    pub position: u64,
    pub asset: Asset,
    pub handle: Box<dyn AssetHandle>,
}

impl std::fmt::Debug for Sighting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sighting")
            .field("position", &self.position)
            .field("filename", &self.asset.filename)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnumeratorOptions {
    /// Items at or before this position are replayed silently.
    pub resume_after: u64,
    /// Filenames treated as already seen.
    pub seed: HashSet<String>,
    pub repeat_threshold: u64,
    pub cutoff: Option<DateTime<Utc>>,
    pub old_threshold: u64,
    pub max_scan: Option<u64>,
}

impl EnumeratorOptions {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            resume_after: 0,
            seed: HashSet::new(),
            repeat_threshold: settings.repeat_threshold,
            cutoff: None,
            old_threshold: settings.old_threshold,
            max_scan: None,
        }
    }

    pub fn resume_after(mut self, position: u64) -> Self {
        self.resume_after = position;
        self
    }

    pub fn seeded<I: IntoIterator<Item = String>>(mut self, filenames: I) -> Self {
        self.seed.extend(filenames);
        self
    }

    pub fn with_cutoff(mut self, cutoff: Option<DateTime<Utc>>) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_max_scan(mut self, max_scan: u64) -> Self {
        self.max_scan = Some(max_scan);
        self
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: u64,
    pub yielded: u64,
    pub replayed: u64,
    pub field_errors: u64,
    pub repeats: u64,
    pub old: u64,
}

pub struct CheckpointedEnumerator<'a> {
    stream: AssetStream<'a>,
    options: EnumeratorOptions,
    seen: HashSet<String>,
    position: u64,
    consecutive_repeats: u64,
    consecutive_old: u64,
    stats: ScanStats,
    end: Option<EndReason>,
}

impl<'a> CheckpointedEnumerator<'a> {
    /// Start a new pass over `remote`.
    pub fn new(remote: &'a dyn RemoteCollection, mut options: EnumeratorOptions) -> Self {
        let seen = std::mem::take(&mut options.seed);
        Self {
            stream: remote.assets(),
            options,
            seen,
            position: 0,
            consecutive_repeats: 0,
            consecutive_old: 0,
            stats: ScanStats::default(),
            end: None,
        }
    }

    /// Position of the last item pulled from the listing (1-based).
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn seen(&self) -> &HashSet<String> {
        &self.seen
    }

    /// Pull the next new item. `Ok(None)` once the pass has ended; a
    /// transport error ends the pass as well.
    pub async fn next(&mut self) -> Result<Option<Sighting>, RemoteError> {
        if self.end.is_some() {
            return Ok(None);
        }

        loop {
            if let Some(limit) = self.options.max_scan {
                if self.position >= limit {
                    return Ok(self.finish(EndReason::ScanLimit));
                }
            }

            let handle = match self.stream.next().await {
                None => return Ok(self.finish(EndReason::Exhausted)),
                Some(Err(e)) => {
                    self.end = Some(EndReason::Exhausted);
                    return Err(e);
                }
                Some(Ok(handle)) => handle,
            };
            self.position += 1;
            self.stats.scanned += 1;

            let asset = match handle.describe() {
                Ok(asset) => asset,
                Err(e) => {
                    self.stats.field_errors += 1;
                    tracing::warn!(position = self.position, error = %e, "Skipping unreadable item");
                    continue;
                }
            };

            if self.position <= self.options.resume_after {
                self.seen.insert(asset.filename);
                self.stats.replayed += 1;
                continue;
            }

            if let Some(cutoff) = self.options.cutoff {
                match asset.recency_date() {
                    Some(date) if date < cutoff => {
                        self.stats.old += 1;
                        self.consecutive_old += 1;
                        if self.consecutive_old >= self.options.old_threshold {
                            return Ok(self.finish(EndReason::CutoffReached));
                        }
                        continue;
                    }
                    _ => self.consecutive_old = 0,
                }
            }

            if !self.seen.insert(asset.filename.clone()) {
                self.stats.repeats += 1;
                self.consecutive_repeats += 1;
                if self.consecutive_repeats >= self.options.repeat_threshold {
                    return Ok(self.finish(EndReason::RepeatThreshold));
                }
                continue;
            }
            self.consecutive_repeats = 0;

            self.stats.yielded += 1;
            return Ok(Some(Sighting {
                position: self.position,
                asset,
                handle,
            }));
        }
    }

    fn finish(&mut self, reason: EndReason) -> Option<Sighting> {
        tracing::debug!(
            position = self.position,
            yielded = self.stats.yielded,
            "Enumeration ended: {}",
            reason
        );
        self.end = Some(reason);
        None
    }
}
