//! Run summaries for `--notify`.
//!
//! A sink failure is logged and never fails the run that produced the
//! summary.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::remote::{Asset, AssetKind, GeoLocation};
use crate::sync::delete::DeleteTarget;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Writes the message to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        tracing::info!("{}", subject);
        for line in body.lines() {
            tracing::info!("  {}", line);
        }
        Ok(())
    }
}

/// How long a notification command may run before it is killed.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs an external program with the subject appended as its last
/// argument and the body on stdin.
pub struct CommandSink {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    /// Parse a whitespace-separated command line such as
    /// `~/bin/mail-me --to me@example.com`.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = crate::config::expand_tilde(parts.next()?);
        Some(Self {
            program,
            args: parts.map(str::to_string).collect(),
            timeout: COMMAND_TIMEOUT,
        })
    }
}

#[async_trait]
impl NotificationSink for CommandSink {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(subject)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(body.as_bytes()).await?;
                // Dropping stdin closes the pipe so the program sees EOF.
            }
            child.wait().await
        };
        let finished = tokio::time::timeout(self.timeout, run).await;
        let status = match finished {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Failed to kill notification command");
                }
                anyhow::bail!(
                    "{} did not finish within {}s",
                    self.program.display(),
                    self.timeout.as_secs_f64()
                );
            }
        };
        if !status.success() {
            anyhow::bail!("{} exited with {}", self.program.display(), status);
        }
        Ok(())
    }
}

/// Deliver a message, logging instead of failing.
pub async fn deliver(sink: &dyn NotificationSink, subject: &str, body: &str) {
    match sink.send(subject, body).await {
        Ok(()) => tracing::info!("Notification sent"),
        Err(e) => tracing::warn!(error = %e, "Failed to send notification"),
    }
}

/// Coarse location bucket: coordinates rounded to one decimal place.
fn location_bucket(location: Option<&GeoLocation>) -> String {
    match location {
        Some(l) => format!("{:.1}, {:.1}", l.latitude, l.longitude),
        None => "Unknown Location".to_string(),
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{} {}", count, word)
    } else {
        format!("{} {}s", count, word)
    }
}

pub fn download_summary(downloaded: &[Asset], backup_dir: &Path) -> (String, String) {
    let total_bytes: u64 = downloaded.iter().map(|a| a.size).sum();
    let videos = downloaded
        .iter()
        .filter(|a| a.kind == AssetKind::Video)
        .count();
    let photos = downloaded.len() - videos;

    let mut locations: BTreeMap<String, usize> = BTreeMap::new();
    for asset in downloaded {
        *locations
            .entry(location_bucket(asset.location.as_ref()))
            .or_default() += 1;
    }
    let mut by_count: Vec<_> = locations.into_iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let subject = format!("iCloud Backup Complete - {} new items", downloaded.len());
    let mut body = String::new();
    let _ = writeln!(body, "New items backed up: {}", downloaded.len());
    let _ = writeln!(body, "  Photos: {}", photos);
    let _ = writeln!(body, "  Videos: {}", videos);
    let _ = writeln!(
        body,
        "Total size: {:.2} MB",
        total_bytes as f64 / (1024.0 * 1024.0)
    );
    let _ = writeln!(body, "Backup location: {}", backup_dir.display());
    if !by_count.is_empty() {
        let _ = writeln!(body, "\nBy location:");
        for (place, count) in by_count {
            let _ = writeln!(body, "  {}: {}", place, plural(count, "item"));
        }
    }
    (subject, body)
}

pub fn deletion_summary(deleted: &[DeleteTarget], failed: usize) -> (String, String) {
    let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
    for target in deleted {
        *reasons.entry(target.reason.as_str()).or_default() += 1;
    }
    let mut by_count: Vec<_> = reasons.into_iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let subject = format!("iCloud Cleanup Complete - {} deleted", deleted.len());
    let mut body = String::new();
    let _ = writeln!(body, "Deleted from iCloud: {}", deleted.len());
    if failed > 0 {
        let _ = writeln!(body, "Failed: {}", failed);
    }
    if !by_count.is_empty() {
        let _ = writeln!(body, "\nReasons:");
        for (reason, count) in by_count {
            let _ = writeln!(body, "  {}: {}", reason, plural(count, "item"));
        }
    }
    (subject, body)
}
