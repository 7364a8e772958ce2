use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::cleanup::SelectionCriteria;
use crate::cli::{GlobalArgs, Thresholds};
use crate::sync::SyncSettings;
use crate::types::Domain;

pub const DEFAULT_CONFIG_PATH: &str = "~/.icloud-backup/config.json";
pub const DEFAULT_COOKIE_DIRECTORY: &str = "~/.icloud-backup";

const INDEX_FILE: &str = "icloud_index.json";
const TRASH_DIR: &str = "trash";
const STATE_DB_FILE: &str = ".icloud-backup.db";

/// Contents of the optional JSON config file. Every key is optional and
/// command-line flags take precedence.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub backup_directory: Option<String>,
    #[serde(default, alias = "username")]
    pub apple_id: Option<String>,
    #[serde(default)]
    pub cookie_directory: Option<String>,
    #[serde(default)]
    pub domain: Option<Domain>,
    #[serde(default)]
    pub notify_command: Option<String>,
    #[serde(default)]
    pub criteria: Option<SelectionCriteria>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl FileConfig {
    /// Read the config file. An explicit `--config` path must exist; the
    /// default location is optional.
    pub async fn load(explicit: Option<&str>) -> anyhow::Result<Self> {
        let path = expand_tilde(explicit.unwrap_or(DEFAULT_CONFIG_PATH));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                tracing::debug!("No config file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}

/// Where a backup keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub backup_dir: PathBuf,
    pub index_path: PathBuf,
    pub trash_dir: PathBuf,
    pub state_db_path: PathBuf,
}

impl Layout {
    pub fn new(backup_dir: PathBuf) -> Self {
        Self {
            index_path: backup_dir.join(INDEX_FILE),
            trash_dir: backup_dir.join(TRASH_DIR),
            state_db_path: backup_dir.join(STATE_DB_FILE),
            backup_dir,
        }
    }
}

/// Application configuration, built once in `main` from the command line
/// and the config file.
pub struct Config {
    pub username: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub cookie_directory: PathBuf,
    pub notify_command: Option<String>,
    pub criteria: SelectionCriteria,
    pub settings: SyncSettings,
    pub domain: Domain,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("backup_dir", &self.backup_dir)
            .field("cookie_directory", &self.cookie_directory)
            .field("domain", &self.domain)
            .field("rules", &self.criteria.rule_count())
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn build(global: &GlobalArgs, file: FileConfig) -> anyhow::Result<Self> {
        let username = global.username.clone().or(file.apple_id);
        let backup_dir = global
            .directory
            .as_deref()
            .or(file.backup_directory.as_deref())
            .map(expand_tilde);
        let cookie_directory = expand_tilde(
            global
                .cookie_directory
                .as_deref()
                .or(file.cookie_directory.as_deref())
                .unwrap_or(DEFAULT_COOKIE_DIRECTORY),
        );
        let domain = global.domain.or(file.domain).unwrap_or_default();

        let thresholds = global.thresholds.clone().or(file.thresholds);
        let mut settings = SyncSettings {
            no_progress_bar: global.no_progress_bar,
            ..SyncSettings::default()
        };
        thresholds.apply(&mut settings)?;

        Ok(Self {
            username,
            backup_dir,
            cookie_directory,
            notify_command: file.notify_command.filter(|c| !c.trim().is_empty()),
            criteria: file.criteria.unwrap_or_default(),
            settings,
            domain,
        })
    }

    pub fn layout(&self) -> anyhow::Result<Layout> {
        let dir = self.backup_dir.clone().ok_or_else(|| {
            anyhow::anyhow!(
                "No backup directory. Pass --directory, set ICLOUD_BACKUP_DIR, \
                 or add backup_directory to the config file"
            )
        })?;
        Ok(Layout::new(dir))
    }

    pub fn username(&self) -> anyhow::Result<&str> {
        self.username.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No Apple ID. Pass --username, set ICLOUD_USERNAME, \
                 or add apple_id to the config file"
            )
        })
    }
}

impl Thresholds {
    /// Fill unset values from `fallback`.
    pub fn or(self, fallback: Thresholds) -> Thresholds {
        Thresholds {
            repeat_threshold: self.repeat_threshold.or(fallback.repeat_threshold),
            old_threshold: self.old_threshold.or(fallback.old_threshold),
            max_scan: self.max_scan.or(fallback.max_scan),
            batch_size: self.batch_size.or(fallback.batch_size),
            batch_delay_secs: self.batch_delay_secs.or(fallback.batch_delay_secs),
            retry_attempts: self.retry_attempts.or(fallback.retry_attempts),
            retry_delay_secs: self.retry_delay_secs.or(fallback.retry_delay_secs),
            checkpoint_every: self.checkpoint_every.or(fallback.checkpoint_every),
        }
    }

    pub fn apply(&self, settings: &mut SyncSettings) -> anyhow::Result<()> {
        if let Some(v) = self.repeat_threshold {
            anyhow::ensure!(v > 0, "repeat_threshold must be at least 1");
            settings.repeat_threshold = v;
        }
        if let Some(v) = self.old_threshold {
            anyhow::ensure!(v > 0, "old_threshold must be at least 1");
            settings.old_threshold = v;
        }
        if let Some(v) = self.max_scan {
            settings.max_scan = v;
        }
        if let Some(v) = self.batch_size {
            anyhow::ensure!(v > 0, "batch_size must be at least 1");
            settings.batch_size = v;
        }
        if let Some(v) = self.batch_delay_secs {
            settings.batch_delay_secs = v;
        }
        if let Some(v) = self.retry_attempts {
            anyhow::ensure!(v > 0, "retry_attempts must be at least 1");
            settings.retry.max_attempts = v;
        }
        if let Some(v) = self.retry_delay_secs {
            settings.retry.delay_secs = v;
        }
        if let Some(v) = self.checkpoint_every {
            anyhow::ensure!(v > 0, "checkpoint_every must be at least 1");
            settings.checkpoint_every = v;
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// True if `path` is inside `dir` (both taken as given, no canonicalizing).
pub fn is_within(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir)
}

/// Parse a human-friendly date or interval into a concrete timestamp.
///
/// Supports three formats:
/// - Relative interval: `"20d"` (20 days ago from now)
/// - ISO date: `"2025-01-02"` (midnight local time)
/// - ISO datetime: `"2025-01-02T14:30:00"` (local time)
pub(crate) fn parse_date_or_interval(s: &str) -> anyhow::Result<DateTime<Local>> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            return Ok(Local::now() - chrono::Duration::days(days));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            if let Some(dt) = naive_dt.and_local_timezone(Local).single() {
                return Ok(dt);
            }
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        if let Some(local) = dt.and_local_timezone(Local).single() {
            return Ok(local);
        }
    }
    anyhow::bail!(
        "Cannot parse '{}' as a date. Expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), or interval (20d)",
        s
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::Rule;

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_parse_date_iso() {
        let dt = parse_date_or_interval("2025-01-15").unwrap();
        assert_eq!(
            dt.date_naive(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_parse_datetime_iso() {
        let dt = parse_date_or_interval("2025-06-15T14:30:00").unwrap();
        let naive = dt.naive_local();
        assert_eq!(naive.date(), NaiveDate::from_ymd_opt(2025, 6, 15).unwrap());
        assert_eq!(
            naive.time(),
            chrono::NaiveTime::from_hms_opt(14, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_interval_days() {
        let before = chrono::Local::now();
        let dt = parse_date_or_interval("10d").unwrap();
        let after = chrono::Local::now();
        let expected = before - chrono::Duration::days(10);
        assert!(dt >= expected - chrono::Duration::seconds(1));
        assert!(dt <= after - chrono::Duration::days(10) + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_parse_invalid_date() {
        assert!(parse_date_or_interval("not-a-date").is_err());
        assert!(parse_date_or_interval("").is_err());
    }

    fn global(args: &[&str]) -> GlobalArgs {
        use clap::Parser;
        let mut argv = vec!["icloud-backup"];
        argv.extend_from_slice(args);
        argv.push("status");
        crate::cli::Cli::try_parse_from(argv).unwrap().global
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new(PathBuf::from("/photos"));
        assert_eq!(layout.index_path, PathBuf::from("/photos/icloud_index.json"));
        assert_eq!(layout.trash_dir, PathBuf::from("/photos/trash"));
        assert_eq!(layout.state_db_path, PathBuf::from("/photos/.icloud-backup.db"));
        assert!(is_within(&layout.trash_dir, &layout.backup_dir));
    }

    #[test]
    fn test_file_config_keys() {
        let json = r#"{
            "backup_directory": "/photos",
            "username": "me@example.com",
            "domain": "cn",
            "notify_command": "mail-me",
            "criteria": {
                "videos": {"rules": [{"type": "age-and-size", "min_age_years": 3, "min_size_mb": 50}]}
            },
            "thresholds": {"batch_size": 25, "retry_attempts": 5}
        }"#;
        let file: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(file.apple_id.as_deref(), Some("me@example.com"));
        assert_eq!(file.domain, Some(Domain::Cn));

        let config = Config::build(&global(&[]), file).unwrap();
        assert_eq!(config.backup_dir, Some(PathBuf::from("/photos")));
        assert_eq!(config.domain, Domain::Cn);
        assert_eq!(config.settings.batch_size, 25);
        assert_eq!(config.settings.retry.max_attempts, 5);
        assert_eq!(config.settings.repeat_threshold, 500);
        assert_eq!(
            config.criteria.videos.rules,
            vec![Rule::AgeAndSize {
                min_age_years: 3.0,
                min_size_mb: 50.0
            }]
        );
        assert!(config.criteria.photos.rules.is_empty());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig {
            backup_directory: Some("/from-file".into()),
            apple_id: Some("file@example.com".into()),
            thresholds: Thresholds {
                batch_size: Some(25),
                max_scan: Some(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let args = global(&[
            "--directory",
            "/from-cli",
            "--username",
            "cli@example.com",
            "--batch-size",
            "3",
        ]);
        let config = Config::build(&args, file).unwrap();
        assert_eq!(config.backup_dir, Some(PathBuf::from("/from-cli")));
        assert_eq!(config.username().unwrap(), "cli@example.com");
        assert_eq!(config.settings.batch_size, 3);
        assert_eq!(config.settings.max_scan, 100);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::build(&global(&[]), FileConfig::default()).unwrap();
        assert_eq!(config.criteria, SelectionCriteria::default());
        assert_eq!(config.settings.batch_size, 10);
        assert_eq!(config.settings.retry.delay_secs, 5);
        assert!(config.notify_command.is_none());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let file = FileConfig {
            thresholds: Thresholds {
                batch_size: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Config::build(&global(&[]), file).is_err());
    }

    #[tokio::test]
    async fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(FileConfig::load(missing.to_str()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"apple_id": "a@b.c", "unknown_key": 1}"#).unwrap();
        let file = FileConfig::load(path.to_str()).await.unwrap();
        assert_eq!(file.apple_id.as_deref(), Some("a@b.c"));
    }
}
