//! Rebuild index records from files already on disk.
//!
//! Local files carry no remote id and no asset or added date, so the
//! records produced here always need a later refresh pass.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use walkdir::{DirEntry, WalkDir};

use crate::remote::AssetKind;

use super::{Index, IndexRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalScanReport {
    pub files: usize,
    pub added: usize,
    pub updated: usize,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|s| s.starts_with('.') && entry.depth() > 0)
}

/// Walk `directory` (skipping `trash_dir` and hidden entries) and return a
/// record for every media file found.
pub fn scan_local_files(directory: &Path, trash_dir: &Path) -> Vec<(PathBuf, IndexRecord)> {
    let mut found = Vec::new();
    let walker = WalkDir::new(directory)
        .into_iter()
        .filter_entry(|e| !is_hidden(e) && e.path() != trash_dir);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Error reading {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(filename) = entry.file_name().to_str() else {
            continue;
        };
        let Some(kind) = AssetKind::from_filename(filename) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let created = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.as_secs() as i64, 0));

        let mut record = IndexRecord::unknown(filename);
        record.size = Some(meta.len());
        record.created = created;
        record.kind = Some(kind);
        found.push((entry.path().to_path_buf(), record));
    }
    found
}

/// Merge records for local files into `index`. Existing records only get
/// their unknown fields filled.
pub async fn rebuild_from_local(
    index: &mut Index,
    directory: &Path,
    trash_dir: &Path,
) -> Result<LocalScanReport, tokio::task::JoinError> {
    let dir = directory.to_path_buf();
    let trash = trash_dir.to_path_buf();
    tracing::info!("Scanning {}", dir.display());
    let found = tokio::task::spawn_blocking(move || scan_local_files(&dir, &trash)).await?;

    let mut report = LocalScanReport {
        files: found.len(),
        ..Default::default()
    };
    for (_, record) in found {
        if index.contains(&record.filename) {
            if index.merge(record) {
                report.updated += 1;
            }
        } else {
            index.insert_new(record);
            report.added += 1;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::photo;

    fn touch(root: &Path, rel: &str, bytes: usize) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, vec![1u8; bytes]).unwrap();
    }

    #[test]
    fn test_scan_finds_media_and_skips_trash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "2023/07/IMG_0001.HEIC", 10);
        touch(root, "2023/07/IMG_0002.MOV", 20);
        touch(root, "unknown/IMG_0003.jpg", 5);
        touch(root, "trash/2022/01/OLD.HEIC", 5);
        touch(root, "2023/07/notes.txt", 5);
        touch(root, ".icloud-backup.db", 5);

        let mut found: Vec<_> = scan_local_files(root, &root.join("trash"))
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        found.sort_by(|a, b| a.filename.cmp(&b.filename));

        let names: Vec<_> = found.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["IMG_0001.HEIC", "IMG_0002.MOV", "IMG_0003.jpg"]);
        assert_eq!(found[1].kind, Some(AssetKind::Video));
        assert_eq!(found[1].size, Some(20));
        assert!(found[0].created.is_some());
        assert!(found.iter().all(IndexRecord::needs_refresh));
    }

    #[tokio::test]
    async fn test_rebuild_merges_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "2023/07/IMG_0001.HEIC", 10);
        touch(root, "2023/07/IMG_0002.HEIC", 10);

        let mut index = Index::default();
        index.insert_new(IndexRecord::from_asset(&photo("IMG_0001.HEIC", 3)));

        let report = rebuild_from_local(&mut index, root, &root.join("trash"))
            .await
            .unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.added, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(index.get("IMG_0001.HEIC").unwrap().size, Some(16));
        assert_eq!(index.get("IMG_0002.HEIC").unwrap().size, Some(10));
    }
}
