//! SQLite-backed shared store
//!
//! Timestamps are stored as Unix milliseconds. Lock acquisition relies on the
//! primary key of `cluster_locks` plus a conditional upsert, so any number of
//! processes opening the same database file see one winner per lock id.

use crate::{EvaluationStore, LockStore, ScheduledActionStore};
use chrono::{TimeZone, Utc};
use evalcycle_core::{
    ActionKey, ActionType, ClusterLockRecord, EntityType, EvalError, EvalResult, Evaluation,
    EvaluationId, NodeId, ScheduledAction, StorageError, StoredState, Timestamp, ValidationError,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS evaluations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  start_at_ms INTEGER NULL,
  due_at_ms INTEGER NULL,
  stop_at_ms INTEGER NULL,
  view_at_ms INTEGER NULL,
  instructor_view_at_ms INTEGER NULL,
  student_view_at_ms INTEGER NULL,
  stored_state TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cluster_locks (
  lock_id TEXT PRIMARY KEY,
  holder_id TEXT NOT NULL,
  acquired_at_ms INTEGER NOT NULL,
  expires_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS scheduled_actions (
  evaluation_id INTEGER NOT NULL,
  action_type TEXT NOT NULL,
  fire_at_ms INTEGER NOT NULL,
  queued INTEGER NOT NULL,
  progress TEXT NULL,
  PRIMARY KEY (evaluation_id, action_type)
);
CREATE INDEX IF NOT EXISTS idx_evaluations_state ON evaluations(stored_state);
CREATE INDEX IF NOT EXISTS idx_cluster_locks_expiry ON cluster_locks(expires_at_ms);
"#;

const EVALUATION_COLUMNS: &str = "id, title, start_at_ms, due_at_ms, stop_at_ms, view_at_ms, \
     instructor_view_at_ms, student_view_at_ms, stored_state";

const ACTION_COLUMNS: &str = "evaluation_id, action_type, fire_at_ms, queued, progress";

/// Shared store on a SQLite database.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open (and create if needed) a database file shared by every node.
    pub fn open(path: impl AsRef<Path>) -> EvalResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_err("open sqlite store"))?;
        debug!(path = %path.display(), "Opened SQLite store");
        Self::from_connection(conn)
    }

    /// Private in-memory database, for tests and single-node runs.
    pub fn open_in_memory() -> EvalResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open in-memory store"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> EvalResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(db_err("set busy timeout"))?;
        conn.execute_batch(SCHEMA).map_err(db_err("init schema"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> EvalResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> EvalError {
    move |e| EvalError::unavailable(format!("{}: {}", context, e))
}

fn corrupt(table: &str, reason: impl Into<String>) -> EvalError {
    StorageError::CorruptRow {
        table: table.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn dt_to_ms(dt: Timestamp) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(table: &str, ms: i64) -> EvalResult<Timestamp> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| corrupt(table, format!("timestamp {} out of range", ms)))
}

fn opt_ms_to_dt(table: &str, ms: Option<i64>) -> EvalResult<Option<Timestamp>> {
    ms.map(|ms| ms_to_dt(table, ms)).transpose()
}

// ============================================================================
// ROW MAPPING
// ============================================================================

struct EvaluationRow {
    id: i64,
    title: String,
    start: Option<i64>,
    due: Option<i64>,
    stop: Option<i64>,
    view: Option<i64>,
    instructor_view: Option<i64>,
    student_view: Option<i64>,
    stored_state: String,
}

impl EvaluationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            start: row.get(2)?,
            due: row.get(3)?,
            stop: row.get(4)?,
            view: row.get(5)?,
            instructor_view: row.get(6)?,
            student_view: row.get(7)?,
            stored_state: row.get(8)?,
        })
    }

    fn into_evaluation(self) -> EvalResult<Evaluation> {
        const TABLE: &str = "evaluations";
        let id = EvaluationId::new(self.id)
            .ok_or_else(|| corrupt(TABLE, format!("non-positive id {}", self.id)))?;
        let stored_state = StoredState::from_db_str(&self.stored_state)
            .map_err(|e| corrupt(TABLE, e.to_string()))?;
        Ok(Evaluation {
            id: Some(id),
            title: self.title,
            start_date: opt_ms_to_dt(TABLE, self.start)?,
            due_date: opt_ms_to_dt(TABLE, self.due)?,
            stop_date: opt_ms_to_dt(TABLE, self.stop)?,
            view_date: opt_ms_to_dt(TABLE, self.view)?,
            instructor_view_date: opt_ms_to_dt(TABLE, self.instructor_view)?,
            student_view_date: opt_ms_to_dt(TABLE, self.student_view)?,
            stored_state,
        })
    }
}

struct ActionRow {
    evaluation_id: i64,
    action_type: String,
    fire_at: i64,
    queued: bool,
    progress: Option<String>,
}

impl ActionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            evaluation_id: row.get(0)?,
            action_type: row.get(1)?,
            fire_at: row.get(2)?,
            queued: row.get(3)?,
            progress: row.get(4)?,
        })
    }

    fn into_action(self) -> EvalResult<ScheduledAction> {
        const TABLE: &str = "scheduled_actions";
        let evaluation_id = EvaluationId::new(self.evaluation_id)
            .ok_or_else(|| corrupt(TABLE, format!("non-positive id {}", self.evaluation_id)))?;
        let action_type = ActionType::from_db_str(&self.action_type)
            .map_err(|e| corrupt(TABLE, e.to_string()))?;
        Ok(ScheduledAction {
            key: ActionKey::new(evaluation_id, action_type),
            fire_at: ms_to_dt(TABLE, self.fire_at)?,
            queued: self.queued,
            progress: self.progress,
        })
    }
}

// ============================================================================
// TRAIT IMPLEMENTATIONS
// ============================================================================

impl EvaluationStore for SqliteStorage {
    fn evaluation_insert(&self, eval: &Evaluation) -> EvalResult<EvaluationId> {
        if eval.id.is_some() {
            return Err(EvalError::invalid_argument("id", "already assigned"));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO evaluations (title, start_at_ms, due_at_ms, stop_at_ms, view_at_ms,
                                      instructor_view_at_ms, student_view_at_ms, stored_state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                eval.title,
                eval.start_date.map(dt_to_ms),
                eval.due_date.map(dt_to_ms),
                eval.stop_date.map(dt_to_ms),
                eval.view_date.map(dt_to_ms),
                eval.instructor_view_date.map(dt_to_ms),
                eval.student_view_date.map(dt_to_ms),
                eval.stored_state.as_db_str(),
            ],
        )
        .map_err(db_err("insert evaluation"))?;
        let raw = conn.last_insert_rowid();
        EvaluationId::new(raw).ok_or_else(|| corrupt("evaluations", format!("rowid {}", raw)))
    }

    fn evaluation_get(&self, id: EvaluationId) -> EvalResult<Option<Evaluation>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM evaluations WHERE id = ?1", EVALUATION_COLUMNS),
                params![id.get()],
                EvaluationRow::read,
            )
            .optional()
            .map_err(db_err("get evaluation"))?;
        row.map(EvaluationRow::into_evaluation).transpose()
    }

    fn evaluation_save(&self, eval: &Evaluation) -> EvalResult<()> {
        let id = eval.id.ok_or(ValidationError::Unpersisted)?;
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE evaluations
                 SET title = ?2, start_at_ms = ?3, due_at_ms = ?4, stop_at_ms = ?5, view_at_ms = ?6,
                     instructor_view_at_ms = ?7, student_view_at_ms = ?8, stored_state = ?9
                 WHERE id = ?1",
                params![
                    id.get(),
                    eval.title,
                    eval.start_date.map(dt_to_ms),
                    eval.due_date.map(dt_to_ms),
                    eval.stop_date.map(dt_to_ms),
                    eval.view_date.map(dt_to_ms),
                    eval.instructor_view_date.map(dt_to_ms),
                    eval.student_view_date.map(dt_to_ms),
                    eval.stored_state.as_db_str(),
                ],
            )
            .map_err(db_err("save evaluation"))?;
        if updated == 0 {
            return Err(StorageError::NotFound {
                entity_type: EntityType::Evaluation,
                id: id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn evaluation_list_schedulable(&self) -> EvalResult<Vec<EvaluationId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM evaluations WHERE stored_state = ?1 ORDER BY id")
            .map_err(db_err("prepare list schedulable"))?;
        let raw_ids = stmt
            .query_map(params![StoredState::Normal.as_db_str()], |row| row.get::<_, i64>(0))
            .map_err(db_err("query list schedulable"))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(db_err("scan list schedulable"))?;
        raw_ids
            .into_iter()
            .map(|raw| {
                EvaluationId::new(raw)
                    .ok_or_else(|| corrupt("evaluations", format!("non-positive id {}", raw)))
            })
            .collect()
    }
}

impl LockStore for SqliteStorage {
    fn lock_try_insert(&self, record: &ClusterLockRecord, now: Timestamp) -> EvalResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO cluster_locks (lock_id, holder_id, acquired_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(lock_id) DO UPDATE SET
                   holder_id = excluded.holder_id,
                   acquired_at_ms = excluded.acquired_at_ms,
                   expires_at_ms = excluded.expires_at_ms
                 WHERE cluster_locks.expires_at_ms <= ?5",
                params![
                    record.lock_id,
                    record.holder_id.as_str(),
                    dt_to_ms(record.acquired_at),
                    dt_to_ms(record.expires_at),
                    dt_to_ms(now),
                ],
            )
            .map_err(db_err("try insert lock"))?;
        Ok(changed == 1)
    }

    fn lock_renew(
        &self,
        lock_id: &str,
        holder_id: &NodeId,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> EvalResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE cluster_locks SET expires_at_ms = ?3
                 WHERE lock_id = ?1 AND holder_id = ?2 AND expires_at_ms > ?4",
                params![lock_id, holder_id.as_str(), dt_to_ms(expires_at), dt_to_ms(now)],
            )
            .map_err(db_err("renew lock"))?;
        Ok(changed == 1)
    }

    fn lock_compare_and_delete(&self, lock_id: &str, holder_id: &NodeId) -> EvalResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM cluster_locks WHERE lock_id = ?1 AND holder_id = ?2",
                params![lock_id, holder_id.as_str()],
            )
            .map_err(db_err("release lock"))?;
        Ok(changed == 1)
    }

    fn lock_get(&self, lock_id: &str) -> EvalResult<Option<ClusterLockRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT lock_id, holder_id, acquired_at_ms, expires_at_ms
                 FROM cluster_locks WHERE lock_id = ?1",
                params![lock_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err("get lock"))?;
        row.map(|(lock_id, holder_id, acquired, expires)| {
            Ok(ClusterLockRecord {
                lock_id,
                holder_id: NodeId::new(holder_id),
                acquired_at: ms_to_dt("cluster_locks", acquired)?,
                expires_at: ms_to_dt("cluster_locks", expires)?,
            })
        })
        .transpose()
    }
}

impl ScheduledActionStore for SqliteStorage {
    fn scheduled_action_get(&self, key: ActionKey) -> EvalResult<Option<ScheduledAction>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM scheduled_actions WHERE evaluation_id = ?1 AND action_type = ?2",
                    ACTION_COLUMNS
                ),
                params![key.evaluation_id.get(), key.action_type.as_db_str()],
                ActionRow::read,
            )
            .optional()
            .map_err(db_err("get scheduled action"))?;
        row.map(ActionRow::into_action).transpose()
    }

    fn scheduled_action_put(&self, action: &ScheduledAction) -> EvalResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduled_actions (evaluation_id, action_type, fire_at_ms, queued, progress)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(evaluation_id, action_type) DO UPDATE SET
               fire_at_ms = excluded.fire_at_ms,
               queued = excluded.queued,
               progress = excluded.progress",
            params![
                action.key.evaluation_id.get(),
                action.key.action_type.as_db_str(),
                dt_to_ms(action.fire_at),
                action.queued,
                action.progress,
            ],
        )
        .map_err(db_err("put scheduled action"))?;
        Ok(())
    }

    fn scheduled_action_delete(&self, key: ActionKey) -> EvalResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM scheduled_actions WHERE evaluation_id = ?1 AND action_type = ?2",
                params![key.evaluation_id.get(), key.action_type.as_db_str()],
            )
            .map_err(db_err("delete scheduled action"))?;
        Ok(changed == 1)
    }

    fn scheduled_action_list(&self, evaluation_id: EvaluationId) -> EvalResult<Vec<ScheduledAction>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM scheduled_actions WHERE evaluation_id = ?1",
                ACTION_COLUMNS
            ))
            .map_err(db_err("prepare list scheduled actions"))?;
        let rows = stmt
            .query_map(params![evaluation_id.get()], ActionRow::read)
            .map_err(db_err("query list scheduled actions"))?
            .collect::<rusqlite::Result<Vec<ActionRow>>>()
            .map_err(db_err("scan list scheduled actions"))?;
        sorted_actions(rows)
    }

    fn scheduled_action_list_all(&self) -> EvalResult<Vec<ScheduledAction>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM scheduled_actions", ACTION_COLUMNS))
            .map_err(db_err("prepare list all scheduled actions"))?;
        let rows = stmt
            .query_map([], ActionRow::read)
            .map_err(db_err("query list all scheduled actions"))?
            .collect::<rusqlite::Result<Vec<ActionRow>>>()
            .map_err(db_err("scan list all scheduled actions"))?;
        sorted_actions(rows)
    }
}

/// Sort by key in Rust; the SQL text order of action types differs from the enum order.
fn sorted_actions(rows: Vec<ActionRow>) -> EvalResult<Vec<ScheduledAction>> {
    let mut actions = rows
        .into_iter()
        .map(ActionRow::into_action)
        .collect::<EvalResult<Vec<_>>>()?;
    actions.sort_by_key(|a| a.key);
    Ok(actions)
}
