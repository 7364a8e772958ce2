//! Local filesystem layout of the backup root.

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Local, Utc};

/// Folder for assets whose dates are all unknown.
pub const UNKNOWN_DATE_DIR: &str = "unknown";

/// Build the local path for an asset: `<directory>/<YYYY>/<MM>/<filename>`.
///
/// The year and month are taken in local time. Without any date the asset
/// lands in `<directory>/unknown/`.
pub fn local_download_path(
    directory: &Path,
    date: Option<DateTime<Utc>>,
    filename: &str,
) -> PathBuf {
    let clean = clean_filename(filename);
    match date {
        Some(date) => {
            let local = date.with_timezone(&Local);
            directory
                .join(format!("{:04}", local.year()))
                .join(format!("{:02}", local.month()))
                .join(clean)
        }
        None => directory.join(UNKNOWN_DATE_DIR).join(clean),
    }
}

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect()
}

/// Temporary sibling a download streams into before being renamed.
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// A local copy counts as valid when it exists and is non-empty. Truncated
/// downloads never reach their final name, so size zero only comes from an
/// interrupted copy outside this tool.
pub async fn is_valid_local_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Set the modification and access times of a file to the given Unix
/// timestamp. Dates before 1970 are handled by subtracting from the epoch.
pub fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}
