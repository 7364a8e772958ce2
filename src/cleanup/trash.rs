//! Local trash directory.
//!
//! Files are moved to `<trash>/<path relative to the backup root>`. The
//! trash is also a deletion source: whatever is in it can be removed from
//! the remote library with `delete --from-trash`.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::index::Index;

/// Extensions considered when collecting filenames from the trash.
const TRASH_EXTENSIONS: &[&str] = &["heic", "jpeg", "jpg", "png", "mov", "mp4"];

/// Destination of `source` inside the trash. When a file with that name is
/// already there, a timestamp suffix is added to the stem.
pub fn trash_destination(
    backup_dir: &Path,
    trash_dir: &Path,
    source: &Path,
    now: DateTime<Local>,
) -> PathBuf {
    let relative = source
        .strip_prefix(backup_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| source.file_name().map(PathBuf::from).unwrap_or_default());
    let dest = trash_dir.join(relative);
    if !dest.exists() {
        return dest;
    }
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    dest.with_file_name(format!("{}_{}{}", stem, now.format("%Y%m%d_%H%M%S"), ext))
}

/// Move one file into the trash. Returns `Ok(None)` if the source no
/// longer exists.
pub async fn move_to_trash(
    backup_dir: &Path,
    trash_dir: &Path,
    source: &Path,
) -> io::Result<Option<PathBuf>> {
    if !tokio::fs::try_exists(source).await? {
        return Ok(None);
    }
    let dest = trash_destination(backup_dir, trash_dir, source, Local::now());
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(source, &dest).await.is_err() {
        // Different filesystem: copy, then remove the original.
        tokio::fs::copy(source, &dest).await?;
        tokio::fs::remove_file(source).await?;
    }
    tracing::debug!(from = %source.display(), to = %dest.display(), "Moved to trash");
    Ok(Some(dest))
}

/// Media filenames currently in the trash.
pub fn trash_filenames(trash_dir: &Path) -> BTreeSet<String> {
    WalkDir::new(trash_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| {
            Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| TRASH_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect()
}

/// Split trashed filenames into those the index knows and those it does
/// not. Only indexed names can be deleted remotely.
pub fn partition_by_index(names: BTreeSet<String>, index: &Index) -> (Vec<String>, Vec<String>) {
    names.into_iter().partition(|n| index.contains(n))
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlurryImage {
    pub path: PathBuf,
    #[serde(default)]
    pub blur_score: Option<f64>,
}

/// Report written by an external quality classifier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupReport {
    /// Original path to the paths of its duplicates. Originals are kept.
    #[serde(default)]
    pub duplicates: BTreeMap<PathBuf, Vec<PathBuf>>,
    #[serde(default)]
    pub blurry_images: Vec<BlurryImage>,
}

impl CleanupReport {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Every path the report flags for the trash, duplicates first.
    pub fn flagged_paths(&self) -> Vec<PathBuf> {
        self.duplicates
            .values()
            .flatten()
            .cloned()
            .chain(self.blurry_images.iter().map(|b| b.path.clone()))
            .collect()
    }
}
