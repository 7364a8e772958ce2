//! Progress store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{ItemOutcome, ProgressState, SyncRunRecord, SyncRunStats, TaskKind};

/// Durable progress ledger.
///
/// Object-safe so engines can hold `&dyn ProgressStore`. There is no
/// partial-update API: `save` replaces the whole ledger of a task.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Return the last saved state of `task`, or an empty one.
    async fn load(&self, task: TaskKind) -> Result<ProgressState, StateError>;

    /// Replace the saved state of `task` with `state`.
    async fn save(&self, task: TaskKind, state: &ProgressState) -> Result<(), StateError>;

    /// Forget everything recorded for `task`.
    async fn clear(&self, task: TaskKind) -> Result<(), StateError>;

    /// Forget only the failed set of `task`. Returns the number removed.
    async fn clear_failed(&self, task: TaskKind) -> Result<u64, StateError>;

    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self, task: TaskKind) -> Result<i64, StateError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;

    /// Most recent sync run of `task`, if any.
    async fn last_sync_run(&self, task: TaskKind) -> Result<Option<SyncRunRecord>, StateError>;
}

/// SQLite implementation of the progress store.
pub struct SqliteProgressStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProgressStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteProgressStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            // Still crash-safe with WAL.
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|_| StateError::Poisoned)
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn load(&self, task: TaskKind) -> Result<ProgressState, StateError> {
        let conn = self.lock()?;
        let mut state = ProgressState::default();

        let cursor: Option<(i64, i64)> = conn
            .query_row(
                "SELECT last_position, skipped FROM progress_cursor WHERE task = ?1",
                [task.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;
        if let Some((last_position, skipped)) = cursor {
            state.last_position = last_position.max(0) as u64;
            state.skipped = skipped.max(0) as u64;
        }

        let mut stmt = conn
            .prepare_cached(
                "SELECT filename, outcome, error FROM progress_items WHERE task = ?1",
            )
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([task.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(StateError::query)?;

        for row in rows {
            let (filename, outcome, error) = row.map_err(StateError::query)?;
            match ItemOutcome::from_str(&outcome) {
                Some(ItemOutcome::Processed) => {
                    state.processed.insert(filename);
                }
                Some(ItemOutcome::Failed) => {
                    state
                        .failed
                        .insert(filename, error.unwrap_or_else(|| "unknown error".into()));
                }
                None => {
                    tracing::warn!(
                        task = task.as_str(),
                        filename = %filename,
                        outcome = %outcome,
                        "Ignoring progress row with unknown outcome"
                    );
                }
            }
        }

        Ok(state)
    }

    async fn save(&self, task: TaskKind, state: &ProgressState) -> Result<(), StateError> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp();

        conn.execute("BEGIN IMMEDIATE TRANSACTION", [])
            .map_err(StateError::query)?;

        let result = (|| {
            conn.execute("DELETE FROM progress_items WHERE task = ?1", [task.as_str()])
                .map_err(StateError::query)?;

            let mut stmt = conn
                .prepare_cached(
                    "INSERT INTO progress_items (task, filename, outcome, error, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(StateError::query)?;

            for filename in &state.processed {
                stmt.execute(rusqlite::params![
                    task.as_str(),
                    filename,
                    ItemOutcome::Processed.as_str(),
                    Option::<&str>::None,
                    now,
                ])
                .map_err(StateError::query)?;
            }
            for (filename, error) in &state.failed {
                if state.processed.contains(filename) {
                    continue;
                }
                stmt.execute(rusqlite::params![
                    task.as_str(),
                    filename,
                    ItemOutcome::Failed.as_str(),
                    error,
                    now,
                ])
                .map_err(StateError::query)?;
            }

            conn.execute(
                r#"
                INSERT INTO progress_cursor (task, last_position, skipped, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(task) DO UPDATE SET
                    last_position = excluded.last_position,
                    skipped = excluded.skipped,
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    task.as_str(),
                    state.last_position as i64,
                    state.skipped as i64,
                    now
                ],
            )
            .map_err(StateError::query)?;

            Ok::<_, StateError>(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", []).map_err(StateError::query)?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    async fn clear(&self, task: TaskKind) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM progress_items WHERE task = ?1", [task.as_str()])
            .map_err(StateError::query)?;
        conn.execute("DELETE FROM progress_cursor WHERE task = ?1", [task.as_str()])
            .map_err(StateError::query)?;
        Ok(())
    }

    async fn clear_failed(&self, task: TaskKind) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "DELETE FROM progress_items WHERE task = ?1 AND outcome = ?2",
                [task.as_str(), ItemOutcome::Failed.as_str()],
            )
            .map_err(StateError::query)?;
        Ok(rows as u64)
    }

    async fn start_sync_run(&self, task: TaskKind) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO sync_runs (task, started_at) VALUES (?1, ?2)",
            rusqlite::params![task.as_str(), started_at],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let interrupted = if stats.interrupted { 1 } else { 0 };
        let conn = self.lock()?;

        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, items_mutated = ?2, items_skipped = ?3, items_failed = ?4, interrupted = ?5 WHERE id = ?6",
            rusqlite::params![
                completed_at,
                stats.items_mutated as i64,
                stats.items_skipped as i64,
                stats.items_failed as i64,
                interrupted,
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn last_sync_run(&self, task: TaskKind) -> Result<Option<SyncRunRecord>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, started_at, completed_at, items_mutated, items_skipped, items_failed, interrupted FROM sync_runs WHERE task = ?1 ORDER BY id DESC LIMIT 1",
            [task.as_str()],
            |row| {
                let started_at: i64 = row.get(1)?;
                let completed_at: Option<i64> = row.get(2)?;
                Ok(SyncRunRecord {
                    id: row.get(0)?,
                    task,
                    started_at: Utc
                        .timestamp_opt(started_at, 0)
                        .single()
                        .unwrap_or_default(),
                    completed_at: completed_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                    stats: SyncRunStats {
                        items_mutated: row.get::<_, i64>(3)? as u64,
                        items_skipped: row.get::<_, i64>(4)? as u64,
                        items_failed: row.get::<_, i64>(5)? as u64,
                        interrupted: row.get::<_, i64>(6)? != 0,
                    },
                })
            },
        )
        .optional()
        .map_err(StateError::query)
    }
}
