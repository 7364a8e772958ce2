//! icloud-backup: resumable iCloud Photos backup, index, and cleanup.
//!
//! Every pass over the photo library is driven by a checkpointed
//! enumerator and a batch mutator that record progress in SQLite, so an
//! interrupted download or delete resumes where it stopped. Login itself
//! is out of scope: the CloudKit adapter reuses the cookie jar and session
//! file an external login tool leaves behind.

#![warn(clippy::all)]

mod cleanup;
mod cli;
mod config;
mod index;
mod notify;
mod paths;
mod remote;
pub mod retry;
mod shutdown;
mod state;
mod sync;
mod types;

use std::future::Future;
use std::io::{IsTerminal, Write};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cleanup::trash::{self, CleanupReport};
use cli::{
    Command, DeleteArgs, DownloadArgs, IndexAction, QueryAction, ResetStateArgs, StatusArgs,
    TrashArgs,
};
use config::{Config, FileConfig, Layout};
use index::Index;
use notify::{CommandSink, LogSink, NotificationSink};
use remote::cloudkit::CloudKitCollection;
use remote::{AuthenticationState, RemoteCollection};
use state::{ProgressStore, SqliteProgressStore, SyncRunStats, TaskKind};
use sync::delete::DeleteTarget;
use sync::SyncError;

/// Reason recorded for deletions sourced from the local trash.
const TRASH_REASON: &str = "in-trash";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.global.log_level.as_filter())),
        )
        .init();

    let file = FileConfig::load(cli.global.config.as_deref()).await?;
    let config = Config::build(&cli.global, file)?;
    tracing::debug!(?config, "Configuration loaded");

    match cli.command {
        Command::Download(args) => run_download(&config, args).await,
        Command::Index { action } => run_index(&config, action).await,
        Command::Candidates => run_candidates(&config).await,
        Command::Delete(args) => run_delete(&config, args).await,
        Command::Query { action } => run_query(&config, action).await,
        Command::Trash(args) => run_trash(&config, args).await,
        Command::Status(args) => run_status(&config, args).await,
        Command::ResetState(args) => run_reset_state(&config, args).await,
        Command::CheckAuth => run_check_auth(&config).await,
    }
}

/// Open the CloudKit session and make sure it is usable before any
/// progress is touched.
async fn connect(config: &Config) -> anyhow::Result<CloudKitCollection> {
    let username = config.username()?;
    let remote = CloudKitCollection::connect(&config.cookie_directory, username, config.domain)
        .await
        .context("Failed to load iCloud session")?;
    match remote.probe().await? {
        AuthenticationState::Valid => {
            tracing::debug!("iCloud session is valid");
            Ok(remote)
        }
        state => anyhow::bail!(
            "iCloud session is {} for {}.\n\
             Log in again with your iCloud login tool so it refreshes the cookies in {},\n\
             then rerun this command.",
            state,
            username,
            config.cookie_directory.display()
        ),
    }
}

async fn open_store(layout: &Layout) -> anyhow::Result<SqliteProgressStore> {
    tokio::fs::create_dir_all(&layout.backup_dir)
        .await
        .with_context(|| format!("Failed to create {}", layout.backup_dir.display()))?;
    Ok(SqliteProgressStore::open(&layout.state_db_path).await?)
}

/// Record a sync run around `run`. A pass that aborts is recorded as
/// interrupted.
async fn tracked<T, F>(
    store: &dyn ProgressStore,
    task: TaskKind,
    run: F,
    stats: impl FnOnce(&T) -> SyncRunStats,
) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, SyncError>>,
{
    let run_id = store.start_sync_run(task).await?;
    match run.await {
        Ok(report) => {
            store.complete_sync_run(run_id, &stats(&report)).await?;
            Ok(report)
        }
        Err(e) => {
            let aborted = SyncRunStats {
                interrupted: true,
                ..SyncRunStats::default()
            };
            if let Err(db_err) = store.complete_sync_run(run_id, &aborted).await {
                tracing::warn!(error = %db_err, "Failed to record aborted sync run");
            }
            Err(e.into())
        }
    }
}

fn notification_sink(config: &Config) -> Box<dyn NotificationSink> {
    match config
        .notify_command
        .as_deref()
        .and_then(CommandSink::from_command_line)
    {
        Some(sink) => Box::new(sink),
        None => Box::new(LogSink),
    }
}

async fn run_download(config: &Config, args: DownloadArgs) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let cutoff = match (args.recent, args.since.as_deref()) {
        (Some(days), _) => Some(Utc::now() - chrono::Duration::days(i64::from(days))),
        (None, Some(since)) => Some(config::parse_date_or_interval(since)?.with_timezone(&Utc)),
        (None, None) => None,
    };

    let remote = connect(config).await?;
    let store = open_store(&layout).await?;
    let mut index = Index::load(&layout.index_path).await?;
    let shutdown = shutdown::install_signal_handler()?;

    let options = sync::download::DownloadOptions {
        directory: &layout.backup_dir,
        index_path: &layout.index_path,
        cutoff,
        dry_run: args.dry_run,
    };
    tracing::info!(directory = %layout.backup_dir.display(), "Starting download");
    let pass = sync::download::run_download(
        &remote,
        &store,
        &mut index,
        &options,
        &config.settings,
        shutdown,
    );
    let report = if args.dry_run {
        pass.await?
    } else {
        let stats = |r: &sync::download::DownloadReport| r.run.stats();
        tracked(&store, TaskKind::Download, pass, stats).await?
    };
    report.run.log_summary();

    if args.notify && !args.dry_run && !report.downloaded.is_empty() {
        let (subject, body) = notify::download_summary(&report.downloaded, &layout.backup_dir);
        notify::deliver(notification_sink(config).as_ref(), &subject, &body).await;
    }
    if !report.run.failed.is_empty() {
        anyhow::bail!(
            "{} downloads failed; run again to retry them",
            report.run.failed.len()
        );
    }
    Ok(())
}

async fn run_index(config: &Config, action: IndexAction) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let mut index = Index::load(&layout.index_path).await?;

    match action {
        IndexAction::Build => {
            let remote = connect(config).await?;
            let store = open_store(&layout).await?;
            let shutdown = shutdown::install_signal_handler()?;
            let pass = index::builder::build(
                &remote,
                &store,
                &mut index,
                &layout.index_path,
                &config.settings,
                shutdown,
            );
            let stats = |r: &index::builder::IndexReport| SyncRunStats {
                items_mutated: r.added + r.updated,
                items_skipped: r.replayed,
                items_failed: 0,
                interrupted: r.interrupted,
            };
            let report = tracked(&store, TaskKind::Index, pass, stats).await?;
            report.log_summary();
        }
        IndexAction::Refresh => {
            let remote = connect(config).await?;
            let shutdown = shutdown::install_signal_handler()?;
            let report = index::builder::refresh(
                &remote,
                &mut index,
                &layout.index_path,
                &config.settings,
                shutdown,
            )
            .await?;
            report.log_summary();
        }
        IndexAction::RebuildLocal => {
            let report =
                index::local::rebuild_from_local(&mut index, &layout.backup_dir, &layout.trash_dir)
                    .await
                    .context("Local scan failed")?;
            index.save(&layout.index_path).await?;
            tracing::info!("── Summary ──");
            tracing::info!(
                "  {} files found, {} added, {} updated, {} total in index",
                report.files,
                report.added,
                report.updated,
                index.len()
            );
            let incomplete = index.needs_refresh_count();
            if incomplete > 0 {
                tracing::info!(
                    "  {} records lack remote metadata; run `index refresh` to fill them",
                    incomplete
                );
            }
        }
    }
    Ok(())
}

fn print_candidate_groups(candidates: &[cleanup::Candidate]) {
    for (reason, (count, bytes)) in cleanup::group_by_reason(candidates) {
        println!(
            "  {}: {} items, {:.1} MB",
            reason,
            count,
            bytes as f64 / (1024.0 * 1024.0)
        );
    }
}

async fn run_candidates(config: &Config) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let index = Index::load(&layout.index_path).await?;
    if index.is_empty() {
        println!("Index is empty. Run `index build` first.");
        return Ok(());
    }

    let candidates = cleanup::select_candidates(&index, &config.criteria, Utc::now());
    let total_mb: f64 = candidates.iter().map(cleanup::Candidate::size_mb).sum();
    println!(
        "{} candidates ({:.1} MB) from {} rules over {} indexed items",
        candidates.len(),
        total_mb,
        config.criteria.rule_count(),
        index.len()
    );
    print_candidate_groups(&candidates);
    if !candidates.is_empty() {
        println!();
        for c in &candidates {
            println!("  {} ({:.1} MB) [{}: {}]", c.filename, c.size_mb(), c.reason, c.detail);
        }
    }
    Ok(())
}

fn trash_targets(index: &Index, trash_dir: &Path) -> Vec<DeleteTarget> {
    let names = trash::trash_filenames(trash_dir);
    let (known, unknown) = trash::partition_by_index(names, index);
    if !unknown.is_empty() {
        tracing::warn!(
            count = unknown.len(),
            "Trashed files not in the index are skipped; run `index build` to include them"
        );
        for name in &unknown {
            tracing::debug!(filename = %name, "Not in index");
        }
    }
    known
        .into_iter()
        .map(|filename| DeleteTarget {
            id: index.get(&filename).and_then(|r| r.id.clone()),
            filename,
            reason: TRASH_REASON.to_string(),
        })
        .collect()
}

fn confirm_deletion(count: usize) -> anyhow::Result<bool> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("Refusing to delete without confirmation; pass --yes to proceed");
    }
    println!();
    println!("This will permanently delete {} items from iCloud.", count);
    print!("Type 'yes' to continue: ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "yes")
}

async fn run_delete(config: &Config, args: DeleteArgs) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let index = Index::load(&layout.index_path).await?;

    let targets: Vec<DeleteTarget> = if args.source.criteria {
        let candidates = cleanup::select_candidates(&index, &config.criteria, Utc::now());
        println!("{} candidates selected:", candidates.len());
        print_candidate_groups(&candidates);
        candidates.iter().map(cleanup::Candidate::to_target).collect()
    } else {
        let targets = trash_targets(&index, &layout.trash_dir);
        println!(
            "{} trashed items found in {}",
            targets.len(),
            layout.trash_dir.display()
        );
        targets
    };

    if targets.is_empty() {
        println!("Nothing to delete.");
        return Ok(());
    }
    if args.dry_run {
        println!();
        for target in &targets {
            println!("  would delete {} [{}]", target.filename, target.reason);
        }
        return Ok(());
    }
    if !args.yes && !confirm_deletion(targets.len())? {
        println!("Cancelled.");
        return Ok(());
    }

    let remote = connect(config).await?;
    let store = open_store(&layout).await?;
    let shutdown = shutdown::install_signal_handler()?;
    let pass = sync::delete::run_delete(&remote, &store, &targets, &config.settings, shutdown);
    let stats = |r: &sync::delete::DeleteReport| r.run.stats();
    let report = tracked(&store, TaskKind::Delete, pass, stats).await?;
    report.run.log_summary();

    if args.notify && !report.deleted.is_empty() {
        let (subject, body) = notify::deletion_summary(&report.deleted, report.run.failed.len());
        notify::deliver(notification_sink(config).as_ref(), &subject, &body).await;
    }
    if !report.run.failed.is_empty() {
        anyhow::bail!("{} deletions failed", report.run.failed.len());
    }
    Ok(())
}

async fn run_query(config: &Config, action: QueryAction) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let index = Index::load(&layout.index_path).await?;
    if index.is_empty() {
        println!("Index is empty. Run `index build` first.");
        return Ok(());
    }
    let out = match action {
        QueryAction::Stats => index::query::render_stats(&index),
        QueryAction::Search { text } => index::query::render_search(&index, &text),
        QueryAction::Years => index::query::render_years(&index),
        QueryAction::Largest { count } => index::query::render_largest(&index, count),
        QueryAction::Videos => index::query::render_videos(&index, Utc::now()),
    };
    print!("{}", out);
    Ok(())
}

async fn run_trash(config: &Config, args: TrashArgs) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let sources = match &args.report {
        Some(report) => {
            let report = CleanupReport::load(report)
                .await
                .with_context(|| format!("Failed to read cleanup report {}", report.display()))?;
            tracing::info!(
                duplicates = report.duplicates.values().map(Vec::len).sum::<usize>(),
                blurry = report.blurry_images.len(),
                "Loaded cleanup report"
            );
            report.flagged_paths()
        }
        None => args.paths.clone(),
    };

    let (mut moved, mut missing, mut failed) = (0usize, 0usize, 0usize);
    for source in &sources {
        if config::is_within(source, &layout.trash_dir) {
            tracing::debug!(path = %source.display(), "Already in trash");
            continue;
        }
        match trash::move_to_trash(&layout.backup_dir, &layout.trash_dir, source).await {
            Ok(Some(_)) => moved += 1,
            Ok(None) => {
                tracing::warn!(path = %source.display(), "File not found");
                missing += 1;
            }
            Err(e) => {
                tracing::error!(path = %source.display(), error = %e, "Failed to move to trash");
                failed += 1;
            }
        }
    }
    println!(
        "{} moved to {}, {} not found, {} failed",
        moved,
        layout.trash_dir.display(),
        missing,
        failed
    );
    if moved > 0 {
        println!("Run `delete --from-trash` to remove them from iCloud.");
    }
    if failed > 0 {
        anyhow::bail!("{} files could not be moved", failed);
    }
    Ok(())
}

async fn run_status(config: &Config, args: StatusArgs) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let db_path = &layout.state_db_path;

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        println!("Run a download, delete, or index build first to create it.");
        return Ok(());
    }

    let store = SqliteProgressStore::open(db_path).await?;
    println!("State Database: {}", store.path().display());

    for task in TaskKind::ALL {
        let state = store.load(task).await?;
        let counters = state.counters();
        println!();
        println!("{}:", task.as_str());
        println!("  Processed: {}", counters.processed);
        println!("  Failed:    {}", counters.failed);
        println!("  Skipped:   {}", counters.skipped);
        println!("  Cursor:    {}", state.last_position);

        if let Some(run) = store.last_sync_run(task).await? {
            println!(
                "  Last run started:   {}",
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            match run.completed_at {
                Some(completed) => println!(
                    "  Last run completed: {}{}",
                    completed.format("%Y-%m-%d %H:%M:%S UTC"),
                    if run.stats.interrupted { " (interrupted)" } else { "" }
                ),
                None => println!("  Last run completed: never (still running or killed)"),
            }
            println!(
                "  Last run items:     {} mutated, {} skipped, {} failed",
                run.stats.items_mutated, run.stats.items_skipped, run.stats.items_failed
            );
        }

        if args.failed && !state.failed.is_empty() {
            println!("  Failed items:");
            for (filename, error) in &state.failed {
                println!("    {} - {}", filename, error);
            }
        }
    }

    Ok(())
}

async fn run_reset_state(config: &Config, args: ResetStateArgs) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let db_path = &layout.state_db_path;

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        return Ok(());
    }

    let tasks: Vec<TaskKind> = match args.task {
        Some(task) => vec![task.into()],
        None => TaskKind::ALL.to_vec(),
    };
    let names: Vec<&str> = tasks.iter().map(TaskKind::as_str).collect();
    let what = if args.failed_only {
        "failed items"
    } else {
        "all progress"
    };

    if !args.yes {
        println!("This will forget {} of: {}", what, names.join(", "));
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let store = SqliteProgressStore::open(db_path).await?;
    for task in tasks {
        if args.failed_only {
            let removed = store.clear_failed(task).await?;
            println!("{}: {} failed items cleared.", task.as_str(), removed);
        } else {
            store.clear(task).await?;
            println!("{}: progress cleared.", task.as_str());
        }
    }

    Ok(())
}

async fn run_check_auth(config: &Config) -> anyhow::Result<()> {
    let username = config.username()?;
    let remote = CloudKitCollection::connect(&config.cookie_directory, username, config.domain)
        .await
        .context("Failed to load iCloud session")?;
    let state = remote.probe().await?;
    println!("{}", state);
    if state != AuthenticationState::Valid {
        eprintln!(
            "Log in again with your iCloud login tool so it refreshes the cookies in {}.",
            config.cookie_directory.display()
        );
        std::process::exit(1);
    }
    Ok(())
}
