use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::types::{Domain, LogLevel, TaskArg};

#[derive(Parser, Debug)]
#[command(
    name = "icloud-backup",
    version,
    about = "Resumable iCloud Photos backup, index, and cleanup"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// JSON config file (default: ~/.icloud-backup/config.json)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Apple ID email address
    #[arg(short = 'u', long, env = "ICLOUD_USERNAME", global = true)]
    pub username: Option<String>,

    /// Local backup directory
    #[arg(short = 'd', long, env = "ICLOUD_BACKUP_DIR", global = true)]
    pub directory: Option<String>,

    /// Directory holding the cookie jar and session file written at login
    #[arg(long, global = true)]
    pub cookie_directory: Option<String>,

    /// iCloud domain (com or cn)
    #[arg(long, value_enum, global = true)]
    pub domain: Option<Domain>,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,

    #[command(flatten)]
    pub thresholds: Thresholds,
}

/// Engine tunables. Also the `thresholds` object of the config file.
#[derive(Args, Debug, Clone, Default, Deserialize)]
pub struct Thresholds {
    /// Consecutive already-seen items that end a pass
    #[arg(long, global = true)]
    #[serde(default)]
    pub repeat_threshold: Option<u64>,

    /// Consecutive items older than the cutoff that end a pass
    #[arg(long, global = true)]
    #[serde(default)]
    pub old_threshold: Option<u64>,

    /// Positions scanned at most while locating delete targets
    #[arg(long, global = true)]
    #[serde(default)]
    pub max_scan: Option<u64>,

    /// Items per batch
    #[arg(long, global = true)]
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Seconds to wait between batches
    #[arg(long, global = true)]
    #[serde(default)]
    pub batch_delay_secs: Option<u64>,

    /// Total download attempts per item
    #[arg(long, global = true)]
    #[serde(default)]
    pub retry_attempts: Option<u32>,

    /// Seconds to wait between download attempts
    #[arg(long, global = true)]
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,

    /// Save progress at least every N scanned positions
    #[arg(long, global = true)]
    #[serde(default)]
    pub checkpoint_every: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download new items into the backup directory
    Download(DownloadArgs),

    /// Build and maintain the local metadata index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// List deletion candidates selected by the configured rules
    Candidates,

    /// Delete items from iCloud
    Delete(DeleteArgs),

    /// Read-only reports over the index
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },

    /// Move local files into the trash directory
    Trash(TrashArgs),

    /// Show progress ledgers and the last run of each task
    Status(StatusArgs),

    /// Clear a progress ledger
    ResetState(ResetStateArgs),

    /// Check whether the saved iCloud session is usable
    CheckAuth,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Only consider items added in the last N days
    #[arg(long, conflicts_with = "since")]
    pub recent: Option<u32>,

    /// Only consider items added after this date (2025-01-02, 2025-01-02T14:30:00, or 20d)
    #[arg(long)]
    pub since: Option<String>,

    /// Report what would be downloaded without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Send a summary when the run finishes
    #[arg(long)]
    pub notify: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAction {
    /// Capture a record for every remote item not yet indexed
    Build,
    /// Fill unknown fields of existing records
    Refresh,
    /// Rebuild records from files already in the backup directory
    RebuildLocal,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub source: DeleteSource,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// List what would be deleted without deleting
    #[arg(long)]
    pub dry_run: bool,

    /// Send a summary when the run finishes
    #[arg(long)]
    pub notify: bool,
}

#[derive(Args, Debug, Clone, Copy)]
#[group(required = true, multiple = false)]
pub struct DeleteSource {
    /// Delete the candidates selected by the configured rules
    #[arg(long)]
    pub criteria: bool,

    /// Delete the indexed items whose files are in the trash directory
    #[arg(long)]
    pub from_trash: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum QueryAction {
    /// Totals by kind
    Stats,
    /// Case-insensitive filename search
    Search { text: String },
    /// Item count per year
    Years,
    /// Largest items
    Largest {
        #[arg(default_value_t = crate::index::query::DEFAULT_LARGEST)]
        count: usize,
    },
    /// Video age breakdown
    Videos,
}

#[derive(Args, Debug)]
pub struct TrashArgs {
    /// Files to move
    #[arg(required_unless_present = "report", conflicts_with = "report")]
    pub paths: Vec<PathBuf>,

    /// Cleanup report listing duplicates and blurry images
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// List failed items
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Task to reset (default: all)
    #[arg(long, value_enum)]
    pub task: Option<TaskArg>,

    /// Only forget failures so they are retried
    #[arg(long)]
    pub failed_only: bool,

    /// Skip confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec!["icloud-backup"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn test_download_flags() {
        let cli = parse(&["download", "--recent", "7", "--dry-run", "--notify"]).unwrap();
        match cli.command {
            Command::Download(args) => {
                assert_eq!(args.recent, Some(7));
                assert!(args.dry_run);
                assert!(args.notify);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_recent_conflicts_with_since() {
        assert!(parse(&["download", "--recent", "7", "--since", "2025-01-01"]).is_err());
    }

    #[test]
    fn test_delete_requires_exactly_one_source() {
        assert!(parse(&["delete"]).is_err());
        assert!(parse(&["delete", "--criteria", "--from-trash"]).is_err());
        let cli = parse(&["delete", "--from-trash", "--yes"]).unwrap();
        match cli.command {
            Command::Delete(args) => {
                assert!(args.source.from_trash);
                assert!(!args.source.criteria);
                assert!(args.yes);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_query_largest_default() {
        let cli = parse(&["query", "largest"]).unwrap();
        match cli.command {
            Command::Query { action } => {
                assert_eq!(action, QueryAction::Largest { count: 20 })
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_index_subcommands() {
        let cli = parse(&["index", "rebuild-local"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Index {
                action: IndexAction::RebuildLocal
            }
        ));
    }

    #[test]
    fn test_trash_needs_paths_or_report() {
        assert!(parse(&["trash"]).is_err());
        assert!(parse(&["trash", "a.jpg", "--report", "r.json"]).is_err());
        assert!(parse(&["trash", "--report", "r.json"]).is_ok());
        assert!(parse(&["trash", "a.jpg", "b.jpg"]).is_ok());
    }

    #[test]
    fn test_global_args_after_subcommand() {
        let cli = parse(&["status", "--directory", "/photos", "--batch-size", "4"]).unwrap();
        assert_eq!(cli.global.directory.as_deref(), Some("/photos"));
        assert_eq!(cli.global.thresholds.batch_size, Some(4));
        assert_eq!(cli.global.log_level, LogLevel::Info);
    }

    #[test]
    fn test_reset_state_task() {
        let cli = parse(&["reset-state", "--task", "delete", "--failed-only"]).unwrap();
        match cli.command {
            Command::ResetState(args) => {
                assert_eq!(args.task, Some(TaskArg::Delete));
                assert!(args.failed_only);
                assert!(!args.yes);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
