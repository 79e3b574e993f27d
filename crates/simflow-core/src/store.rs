//! Durable task table backed by SQLite.
//!
//! # Tables
//!
//! - `tasks`: one row per `(run_name, process_type)`; `seq` records the
//!   order rows were installed and drives submission order.
//! - `transitions`: append-only audit of every applied update.
//! - `meta`: activity timestamps (`last_update_at`, `last_poll_at`).
//! - `collection_errors`: persisted stale-data conditions.
//!
//! The database runs in WAL mode, so monitoring readers in other processes
//! never block the single writer. Every [`TaskStore::apply`] is one
//! `IMMEDIATE` transaction: read row, compute transition, write row and audit
//! entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use crate::error::{Result, SimflowError};
use crate::mailbox::Update;
use crate::paths;
use crate::retry::RetryPolicy;
use crate::selection::{LikePattern, TaskSelection};
use crate::task::{Task, Transition};
use crate::types::{ProcessType, Status};

const TASK_COLUMNS: &str = "seq, run_name, process_type, status, job_id, retries, start_time, \
     end_time, n_cores, run_time, last_error, created_at, updated_at";

const META_LAST_UPDATE: &str = "last_update_at";
const META_LAST_POLL: &str = "last_poll_at";

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// One applied transition, as recorded in the audit table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub run_name: String,
    pub process_type: ProcessType,
    pub from: Status,
    pub to: Status,
    pub job_id: Option<u64>,
    pub retries: u32,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub applied_at: DateTime<Utc>,
}

/// Completion of one realisation across all its stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub run_name: String,
    pub total: usize,
    pub completed: usize,
    pub active: usize,
    pub failed: usize,
}

impl RunProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// A persisted "the pipeline has stalled" condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionError {
    pub reason: String,
    pub detail: String,
    pub since: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn ts_from_sql(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn required_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    ts_from_sql(idx, Some(raw)).map(|t| t.unwrap_or_default())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let process_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Task {
        seq: row.get(0)?,
        run_name: row.get(1)?,
        process_type: process_type.parse().map_err(|e| conversion_err(2, e))?,
        status: status.parse().map_err(|e| conversion_err(3, e))?,
        job_id: row.get(4)?,
        retries: row.get(5)?,
        start_time: ts_from_sql(6, row.get(6)?)?,
        end_time: ts_from_sql(7, row.get(7)?)?,
        cores_used: row.get(8)?,
        run_time_seconds: row.get(9)?,
        last_error: row.get(10)?,
        created_at: required_ts(11, row.get(11)?)?,
        updated_at: required_ts(12, row.get(12)?)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TransitionRecord> {
    let process_type: String = row.get(1)?;
    let from: String = row.get(2)?;
    let to: String = row.get(3)?;
    Ok(TransitionRecord {
        run_name: row.get(0)?,
        process_type: process_type.parse().map_err(|e| conversion_err(1, e))?,
        from: from.parse().map_err(|e| conversion_err(2, e))?,
        to: to.parse().map_err(|e| conversion_err(3, e))?,
        job_id: row.get(4)?,
        retries: row.get(5)?,
        error: row.get(6)?,
        requested_at: required_ts(7, row.get(7)?)?,
        applied_at: required_ts(8, row.get(8)?)?,
    })
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

pub struct TaskStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    policy: RetryPolicy,
}

impl TaskStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, policy: RetryPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            policy,
        })
    }

    /// Open the store of an initialised simflow root.
    pub fn open_root(root: &Path, policy: RetryPolicy) -> Result<Self> {
        let path = paths::store_path(root);
        if !path.exists() {
            return Err(SimflowError::NotInitialized);
        }
        Self::open(&path, policy)
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_name TEXT NOT NULL,
                process_type TEXT NOT NULL,
                status TEXT NOT NULL,
                job_id INTEGER,
                retries INTEGER NOT NULL DEFAULT 0,
                start_time TEXT,
                end_time TEXT,
                n_cores INTEGER,
                run_time INTEGER,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (run_name, process_type)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);

            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_name TEXT NOT NULL,
                process_type TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                job_id INTEGER,
                retries INTEGER NOT NULL,
                error TEXT,
                requested_at TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_task
            ON transitions (run_name, process_type);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS collection_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reason TEXT NOT NULL,
                detail TEXT NOT NULL,
                since TEXT NOT NULL,
                cleared_at TEXT
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SimflowError::Store("connection lock poisoned".into()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Install
    // -----------------------------------------------------------------------

    /// Create `NotStarted` rows for the given stages of a realisation.
    ///
    /// Existing rows are left untouched. Returns how many rows were created.
    pub fn install(&self, run_name: &str, stages: &[ProcessType]) -> Result<usize> {
        paths::validate_run_name(run_name)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();
        let mut created = 0;
        for stage in stages {
            created += tx.execute(
                "INSERT OR IGNORE INTO tasks
                 (run_name, process_type, status, retries, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![run_name, stage.as_str(), Status::NotStarted.as_str(), now],
            )?;
        }
        tx.commit()?;
        Ok(created)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn query_tasks(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks {where_clause} ORDER BY seq ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn find(&self, run_name: &str, process_type: ProcessType) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let sql =
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_name = ?1 AND process_type = ?2");
        Ok(conn
            .query_row(&sql, params![run_name, process_type.as_str()], task_from_row)
            .optional()?)
    }

    pub fn get(&self, run_name: &str, process_type: ProcessType) -> Result<Task> {
        self.find(run_name, process_type)?
            .ok_or_else(|| SimflowError::TaskNotFound {
                run_name: run_name.to_string(),
                process_type: process_type.to_string(),
            })
    }

    /// Every task, in discovery order.
    pub fn list(&self) -> Result<Vec<Task>> {
        self.query_tasks("", &[])
    }

    pub fn list_for_run(&self, run_name: &str) -> Result<Vec<Task>> {
        self.query_tasks("WHERE run_name = ?1", &[&run_name])
    }

    /// Tasks of one process type whose run name matches a SQL-LIKE pattern.
    pub fn list_by_process(
        &self,
        process_type: ProcessType,
        pattern: Option<&str>,
    ) -> Result<Vec<Task>> {
        let tasks = self.query_tasks("WHERE process_type = ?1", &[&process_type.as_str()])?;
        Ok(match pattern {
            Some(p) => {
                let like = LikePattern::new(p);
                tasks.into_iter().filter(|t| like.matches(&t.run_name)).collect()
            }
            None => tasks,
        })
    }

    /// Queued or Running tasks.
    pub fn active(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            "WHERE status IN (?1, ?2)",
            &[&Status::Queued.as_str(), &Status::Running.as_str()],
        )
    }

    /// Counts for every status, zeros included, in `Status::all()` order.
    pub fn status_counts(&self) -> Result<Vec<(Status, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let (status, n) = row?;
            counts.insert(status, n as usize);
        }
        Ok(Status::all()
            .iter()
            .map(|s| (*s, counts.get(s.as_str()).copied().unwrap_or(0)))
            .collect())
    }

    /// Tasks that may be submitted now, in discovery order.
    ///
    /// A task is runnable when it is `NotStarted` (or `Failed` with retry
    /// budget left), every upstream stage of the same realisation is
    /// `Completed`, and `selection` picks it. A missing upstream row counts
    /// as not completed.
    pub fn list_runnable(&self, selection: &TaskSelection) -> Result<Vec<Task>> {
        let all = self.list()?;
        let statuses: HashMap<(&str, ProcessType), Status> = all
            .iter()
            .map(|t| ((t.run_name.as_str(), t.process_type), t.status))
            .collect();

        let runnable = all
            .iter()
            .filter(|t| t.status == Status::NotStarted || self.policy.can_retry(t))
            .filter(|t| {
                t.process_type.dependencies().iter().all(|dep| {
                    statuses.get(&(t.run_name.as_str(), *dep)) == Some(&Status::Completed)
                })
            })
            .filter(|t| selection.selects(&t.run_name, t.process_type))
            .cloned()
            .collect();
        Ok(runnable)
    }

    /// Failed tasks with no retry budget left.
    pub fn failures(&self) -> Result<Vec<Task>> {
        let failed = self.query_tasks("WHERE status = ?1", &[&Status::Failed.as_str()])?;
        Ok(failed
            .into_iter()
            .filter(|t| self.policy.is_exhausted(t))
            .collect())
    }

    /// Per-realisation completion, in discovery order of each realisation.
    pub fn run_progress(&self) -> Result<Vec<RunProgress>> {
        let mut order: Vec<String> = Vec::new();
        let mut by_run: HashMap<String, RunProgress> = HashMap::new();
        for task in self.list()? {
            let entry = by_run.entry(task.run_name.clone()).or_insert_with(|| {
                order.push(task.run_name.clone());
                RunProgress {
                    run_name: task.run_name.clone(),
                    total: 0,
                    completed: 0,
                    active: 0,
                    failed: 0,
                }
            });
            entry.total += 1;
            match task.status {
                Status::Completed => entry.completed += 1,
                s if s.is_active() => entry.active += 1,
                Status::Failed if self.policy.is_exhausted(&task) => entry.failed += 1,
                _ => {}
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|run| by_run.remove(&run))
            .collect())
    }

    /// Audit trail of one task, oldest first.
    pub fn history(&self, run_name: &str, process_type: ProcessType) -> Result<Vec<TransitionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_name, process_type, from_status, to_status, job_id, retries, error,
                    requested_at, applied_at
             FROM transitions
             WHERE run_name = ?1 AND process_type = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_name, process_type.as_str()], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Apply `update` now. See [`TaskStore::apply_at`].
    pub fn apply(&self, update: &Update) -> Result<Transition> {
        self.apply_at(update, Utc::now())
    }

    /// Apply `update`, recording `requested_at` as the time it was issued.
    ///
    /// Illegal transitions return [`SimflowError::InvalidTransition`] and
    /// leave the row untouched. Applying an update the row already reflects
    /// is a no-op.
    pub fn apply_at(&self, update: &Update, requested_at: DateTime<Utc>) -> Result<Transition> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql =
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_name = ?1 AND process_type = ?2");
        let current = tx
            .query_row(
                &sql,
                params![update.run_name, update.process_type.as_str()],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| SimflowError::TaskNotFound {
                run_name: update.run_name.clone(),
                process_type: update.process_type.to_string(),
            })?;

        let now = Utc::now();
        let transition = current.transition(update, &self.policy, now)?;

        if let Transition::Applied(next) = &transition {
            tx.execute(
                "UPDATE tasks SET status = ?1, job_id = ?2, retries = ?3, start_time = ?4,
                        end_time = ?5, n_cores = ?6, run_time = ?7, last_error = ?8,
                        updated_at = ?9
                 WHERE seq = ?10",
                params![
                    next.status.as_str(),
                    next.job_id,
                    next.retries,
                    ts_to_sql(next.start_time),
                    ts_to_sql(next.end_time),
                    next.cores_used,
                    next.run_time_seconds,
                    next.last_error,
                    next.updated_at.to_rfc3339(),
                    next.seq,
                ],
            )?;
            tx.execute(
                "INSERT INTO transitions
                 (run_name, process_type, from_status, to_status, job_id, retries, error,
                  requested_at, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    next.run_name,
                    next.process_type.as_str(),
                    current.status.as_str(),
                    next.status.as_str(),
                    next.job_id,
                    next.retries,
                    update.error,
                    requested_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
        }
        set_meta(&tx, META_LAST_UPDATE, now)?;
        tx.commit()?;
        Ok(transition)
    }

    // -----------------------------------------------------------------------
    // Activity & collection errors
    // -----------------------------------------------------------------------

    /// Record a successful scheduler poll.
    pub fn record_poll(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        set_meta(&conn, META_LAST_POLL, at)
    }

    /// Newest of the last applied update and the last successful poll.
    pub fn last_activity(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let update = get_meta(&conn, META_LAST_UPDATE)?;
        let poll = get_meta(&conn, META_LAST_POLL)?;
        Ok(update.max(poll))
    }

    pub fn active_collection_error(&self) -> Result<Option<CollectionError>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT reason, detail, since FROM collection_errors
                 WHERE cleared_at IS NULL ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(CollectionError {
                        reason: row.get(0)?,
                        detail: row.get(1)?,
                        since: required_ts(2, row.get(2)?)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Persist a stalled-pipeline condition unless one is already open.
    ///
    /// Returns the open condition (new or existing).
    pub fn record_collection_error(
        &self,
        reason: &str,
        detail: &str,
        since: DateTime<Utc>,
    ) -> Result<CollectionError> {
        if let Some(existing) = self.active_collection_error()? {
            return Ok(existing);
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO collection_errors (reason, detail, since) VALUES (?1, ?2, ?3)",
            params![reason, detail, since.to_rfc3339()],
        )?;
        Ok(CollectionError {
            reason: reason.to_string(),
            detail: detail.to_string(),
            since,
        })
    }

    /// Close any open condition. Returns how many were cleared.
    pub fn clear_collection_errors(&self, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE collection_errors SET cleared_at = ?1 WHERE cleared_at IS NULL",
            params![at.to_rfc3339()],
        )?)
    }
}

fn set_meta(conn: &Connection, key: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, at.to_rfc3339()],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(ts_from_sql(0, raw)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Selector;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp(max_retries: u32) -> (TempDir, TaskStore) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(&dir.path().join("tasks.db"), RetryPolicy::new(max_retries))
            .unwrap();
        (dir, store)
    }

    fn upd(run: &str, pt: ProcessType, status: Status, job: Option<u64>) -> Update {
        Update::new(run, pt, status).with_job_id(job)
    }

    fn complete(store: &TaskStore, run: &str, pt: ProcessType, job: u64) {
        store.apply(&upd(run, pt, Status::Queued, Some(job))).unwrap();
        store.apply(&upd(run, pt, Status::Running, Some(job))).unwrap();
        store.apply(&upd(run, pt, Status::Completed, Some(job))).unwrap();
    }

    #[test]
    fn install_is_idempotent_and_ordered() {
        let (_dir, store) = open_tmp(2);
        assert_eq!(store.install("A_REL01", ProcessType::all()).unwrap(), 6);
        assert_eq!(store.install("A_REL01", ProcessType::all()).unwrap(), 0);
        store.install("B_REL01", &[ProcessType::Emod3d]).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 7);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(all[6].run_name, "B_REL01");
        assert!(all.iter().all(|t| t.status == Status::NotStarted));
    }

    #[test]
    fn get_missing_task_is_not_found() {
        let (_dir, store) = open_tmp(2);
        assert!(matches!(
            store.get("nope", ProcessType::Hf).unwrap_err(),
            SimflowError::TaskNotFound { .. }
        ));
    }

    #[test]
    fn apply_persists_and_audits() {
        let (_dir, store) = open_tmp(2);
        store.install("A", ProcessType::all()).unwrap();
        complete(&store, "A", ProcessType::Emod3d, 100);

        let t = store.get("A", ProcessType::Emod3d).unwrap();
        assert_eq!(t.status, Status::Completed);
        assert_eq!(t.job_id, Some(100));

        let history = store.history("A", ProcessType::Emod3d).unwrap();
        let edges: Vec<(Status, Status)> = history.iter().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            edges,
            vec![
                (Status::NotStarted, Status::Queued),
                (Status::Queued, Status::Running),
                (Status::Running, Status::Completed),
            ]
        );
    }

    #[test]
    fn apply_twice_equals_apply_once() {
        let (_dir, store) = open_tmp(2);
        store.install("A", &[ProcessType::Emod3d]).unwrap();
        let u = upd("A", ProcessType::Emod3d, Status::Queued, Some(9));
        store.apply(&u).unwrap();
        let once = store.get("A", ProcessType::Emod3d).unwrap();
        let second = store.apply(&u).unwrap();
        assert!(matches!(second, Transition::Unchanged(_)));
        assert_eq!(store.get("A", ProcessType::Emod3d).unwrap(), once);
        assert_eq!(store.history("A", ProcessType::Emod3d).unwrap().len(), 1);
    }

    #[test]
    fn rejected_transition_leaves_row_untouched() {
        let (_dir, store) = open_tmp(2);
        store.install("A", &[ProcessType::Emod3d]).unwrap();
        let before = store.get("A", ProcessType::Emod3d).unwrap();
        let err = store
            .apply(&upd("A", ProcessType::Emod3d, Status::Completed, Some(1)))
            .unwrap_err();
        assert!(matches!(err, SimflowError::InvalidTransition { .. }));
        assert_eq!(store.get("A", ProcessType::Emod3d).unwrap(), before);
    }

    #[test]
    fn runnable_respects_dependencies() {
        let (_dir, store) = open_tmp(2);
        store.install("A", ProcessType::all()).unwrap();
        let sel = TaskSelection::default();

        let runnable = store.list_runnable(&sel).unwrap();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].process_type, ProcessType::Emod3d);

        complete(&store, "A", ProcessType::Emod3d, 1);
        let stages: Vec<ProcessType> = store
            .list_runnable(&sel)
            .unwrap()
            .into_iter()
            .map(|t| t.process_type)
            .collect();
        assert_eq!(stages, vec![ProcessType::MergeTs, ProcessType::WinbinAio]);

        // hf needs both merge_ts and winbin_aio
        complete(&store, "A", ProcessType::MergeTs, 2);
        assert!(store
            .list_runnable(&sel)
            .unwrap()
            .iter()
            .all(|t| t.process_type != ProcessType::Hf));
        complete(&store, "A", ProcessType::WinbinAio, 3);
        assert_eq!(
            store.list_runnable(&sel).unwrap()[0].process_type,
            ProcessType::Hf
        );
    }

    #[test]
    fn runnable_treats_missing_upstream_as_incomplete() {
        let (_dir, store) = open_tmp(2);
        store.install("A", &[ProcessType::Bb]).unwrap();
        assert!(store.list_runnable(&TaskSelection::default()).unwrap().is_empty());
    }

    #[test]
    fn runnable_applies_selection() {
        let (_dir, store) = open_tmp(2);
        store.install("A_REL01", &[ProcessType::Emod3d]).unwrap();
        store.install("A_REL02", &[ProcessType::Emod3d]).unwrap();
        let mut sel = TaskSelection::default();
        sel.set(ProcessType::Emod3d, Selector::Once);
        let runnable = store.list_runnable(&sel).unwrap();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].run_name, "A_REL01");
    }

    #[test]
    fn exhausted_failures_leave_runnable_set() {
        let (_dir, store) = open_tmp(1);
        store.install("A", &[ProcessType::Emod3d]).unwrap();
        let sel = TaskSelection::default();
        for job in [1, 2] {
            store.apply(&upd("A", ProcessType::Emod3d, Status::Queued, Some(job))).unwrap();
            store.apply(&upd("A", ProcessType::Emod3d, Status::Running, Some(job))).unwrap();
            store.apply(&upd("A", ProcessType::Emod3d, Status::Failed, Some(job))).unwrap();
        }
        assert!(store.list_runnable(&sel).unwrap().is_empty());
        let failures = store.failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].retries, 1);
    }

    #[test]
    fn monitoring_queries() {
        let (_dir, store) = open_tmp(2);
        store.install("Hossack_REL01", ProcessType::all()).unwrap();
        store.install("Hossack_REL02", ProcessType::all()).unwrap();
        store.install("Alpine_REL01", ProcessType::all()).unwrap();
        complete(&store, "Hossack_REL01", ProcessType::Emod3d, 1);
        store
            .apply(&upd("Alpine_REL01", ProcessType::Emod3d, Status::Queued, Some(2)))
            .unwrap();

        let counts: HashMap<Status, usize> = store.status_counts().unwrap().into_iter().collect();
        assert_eq!(counts[&Status::Completed], 1);
        assert_eq!(counts[&Status::Queued], 1);
        assert_eq!(counts[&Status::NotStarted], 16);
        assert_eq!(counts[&Status::Killed], 0);

        let hossack = store
            .list_by_process(ProcessType::Emod3d, Some("Hossack%"))
            .unwrap();
        assert_eq!(hossack.len(), 2);
        assert_eq!(store.list_for_run("Alpine_REL01").unwrap().len(), 6);
        assert_eq!(store.active().unwrap().len(), 1);

        let progress = store.run_progress().unwrap();
        assert_eq!(progress[0].run_name, "Hossack_REL01");
        assert_eq!(progress[0].completed, 1);
        assert_eq!(progress[2].active, 1);
        assert!(!progress[0].is_complete());
    }

    #[test]
    fn activity_and_collection_errors() {
        let (_dir, store) = open_tmp(2);
        assert_eq!(store.last_activity().unwrap(), None);

        let poll = Utc::now() - CDur::minutes(10);
        store.record_poll(poll).unwrap();
        let seen = store.last_activity().unwrap().unwrap();
        assert!((seen - poll).num_milliseconds().abs() < 1);

        let first = store
            .record_collection_error("collection_failure", "no poll for 600s", poll)
            .unwrap();
        let again = store
            .record_collection_error("collection_failure", "no poll for 700s", Utc::now())
            .unwrap();
        assert_eq!(first, again, "an open condition is not duplicated");

        assert_eq!(store.clear_collection_errors(Utc::now()).unwrap(), 1);
        assert!(store.active_collection_error().unwrap().is_none());
    }

    #[test]
    fn second_handle_reads_while_first_writes() {
        let (dir, store) = open_tmp(2);
        store.install("A", &[ProcessType::Emod3d]).unwrap();
        let reader = TaskStore::open(&dir.path().join("tasks.db"), RetryPolicy::default()).unwrap();
        store
            .apply(&upd("A", ProcessType::Emod3d, Status::Queued, Some(5)))
            .unwrap();
        assert_eq!(
            reader.get("A", ProcessType::Emod3d).unwrap().status,
            Status::Queued
        );
    }
}
