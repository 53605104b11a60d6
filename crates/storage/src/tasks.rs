use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use voxnav_core::types::{LogEntry, Task, TaskSource, TaskStage, TaskState, TaskSummary, Transcript};
use voxnav_core::{Error, Result};

use crate::TaskRecorder;

/// SQLite-backed history of every task and its step log.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Storage(format!("{}: {}", context, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

/// Raw column values; decoded outside the rusqlite row closure so JSON
/// errors surface as `Error::Json`.
struct TaskRow {
    id: String,
    source: String,
    state: String,
    stage: String,
    transcript: Option<String>,
    plan: Option<String>,
    result: Option<String>,
    failure: Option<String>,
    audio_path: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

const TASK_COLUMNS: &str =
    "id, source, state, stage, transcript, plan, result, failure, audio_path, created_at, started_at, completed_at";

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            source: row.get("source")?,
            state: row.get("state")?,
            stage: row.get("stage")?,
            transcript: row.get("transcript")?,
            plan: row.get("plan")?,
            result: row.get("result")?,
            failure: row.get("failure")?,
            audio_path: row.get("audio_path")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let source = match self.source.as_str() {
            "voice" => TaskSource::Voice,
            "text" => TaskSource::Text,
            other => return Err(Error::Storage(format!("unknown task source '{}'", other))),
        };
        let state = TaskState::from_str(&self.state)
            .ok_or_else(|| Error::Storage(format!("unknown task state '{}'", self.state)))?;
        let stage = TaskStage::from_str(&self.stage)
            .ok_or_else(|| Error::Storage(format!("unknown task stage '{}'", self.stage)))?;
        Ok(Task {
            id: self.id,
            source,
            state,
            stage,
            transcript: parse_opt_json(self.transcript)?,
            plan: parse_opt_json(self.plan)?,
            log: Vec::new(),
            result: parse_opt_json(self.result)?,
            failure: parse_opt_json(self.failure)?,
            audio_path: self.audio_path,
            created_at: parse_time(&self.created_at)?,
            started_at: parse_opt_time(self.started_at)?,
            completed_at: parse_opt_time(self.completed_at)?,
        })
    }
}

impl TaskStore {
    /// Open (or create) the task database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path).map_err(storage_err("Failed to open task db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        info!(path = %db_path.display(), "Task store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                state TEXT NOT NULL,
                stage TEXT NOT NULL,
                transcript TEXT,
                plan TEXT,
                result TEXT,
                failure TEXT,
                failure_kind TEXT,
                audio_path TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

            CREATE TABLE IF NOT EXISTS task_log (
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                step_index INTEGER NOT NULL,
                status TEXT NOT NULL,
                outcome TEXT NOT NULL,
                at TEXT NOT NULL,
                PRIMARY KEY (task_id, seq)
            );
            ",
        )
        .map_err(storage_err("Failed to init task schema"))?;
        debug!("Task store schema initialized");
        Ok(())
    }

    /// Insert or update the task row. The log is written separately through
    /// [`TaskStore::append_log`].
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let transcript = task.transcript.as_ref().map(to_json).transpose()?;
        let plan = task.plan.as_ref().map(to_json).transpose()?;
        let result = task.result.as_ref().map(to_json).transpose()?;
        let failure = task.failure.as_ref().map(to_json).transpose()?;
        let failure_kind = task.failure.as_ref().map(|f| f.kind.as_str());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, source, state, stage, transcript, plan, result, failure, failure_kind,
                                audio_path, created_at, started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                stage = excluded.stage,
                transcript = excluded.transcript,
                plan = excluded.plan,
                result = excluded.result,
                failure = excluded.failure,
                failure_kind = excluded.failure_kind,
                audio_path = excluded.audio_path,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
            params![
                task.id,
                task.source.as_str(),
                task.state.as_str(),
                task.stage.as_str(),
                transcript,
                plan,
                result,
                failure,
                failure_kind,
                task.audio_path,
                task.created_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(storage_err("Save task error"))?;
        Ok(())
    }

    /// Append a log entry. Re-appending an existing `(task_id, seq)` is a no-op.
    pub fn append_log(&self, task_id: &str, seq: usize, entry: &LogEntry) -> Result<()> {
        let outcome = to_json(&entry.outcome)?;
        let status = serde_json::to_value(&entry.outcome)?
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO task_log (task_id, seq, step_index, status, outcome, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                seq as i64,
                entry.step_index as i64,
                status,
                outcome,
                entry.at.to_rfc3339(),
            ],
        )
        .map_err(storage_err("Append log error"))?;
        Ok(())
    }

    /// Load a task together with its full step log.
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                TaskRow::from_row,
            )
            .optional()
            .map_err(storage_err("Get task error"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = row.into_task()?;
        task.log = Self::load_log(&conn, id)?;
        Ok(Some(task))
    }

    fn load_log(conn: &Connection, task_id: &str) -> Result<Vec<LogEntry>> {
        let mut stmt = conn
            .prepare("SELECT step_index, outcome, at FROM task_log WHERE task_id = ?1 ORDER BY seq")
            .map_err(storage_err("Prepare log query"))?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                let step_index: i64 = row.get(0)?;
                let outcome: String = row.get(1)?;
                let at: String = row.get(2)?;
                Ok((step_index, outcome, at))
            })
            .map_err(storage_err("Query log"))?;

        let mut log = Vec::new();
        for row in rows {
            let (step_index, outcome, at) = row.map_err(storage_err("Read log row"))?;
            log.push(LogEntry {
                step_index: step_index.max(0) as usize,
                outcome: serde_json::from_str(&outcome)?,
                at: parse_time(&at)?,
            });
        }
        Ok(log)
    }

    /// Most recent tasks first, without their logs.
    pub fn list_tasks(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
        if state.is_some() {
            sql.push_str(" WHERE state = ?1");
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {}", limit));

        let mut stmt = conn.prepare(&sql).map_err(storage_err("Prepare list query"))?;
        let rows = match state {
            Some(s) => stmt.query_map(params![s.as_str()], TaskRow::from_row),
            None => stmt.query_map([], TaskRow::from_row),
        }
        .map_err(storage_err("List tasks error"))?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(storage_err("Read task row"))?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn summary(&self) -> Result<TaskSummary> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")
            .map_err(storage_err("Prepare summary query"))?;
        let rows = stmt
            .query_map([], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count))
            })
            .map_err(storage_err("Summary error"))?;

        let mut summary = TaskSummary::default();
        for row in rows {
            let (state, count) = row.map_err(storage_err("Read summary row"))?;
            if let Some(state) = TaskState::from_str(&state) {
                summary.add(state, count.max(0) as usize);
            }
        }

        let mut stmt = conn
            .prepare("SELECT transcript FROM tasks WHERE transcript IS NOT NULL")
            .map_err(storage_err("Prepare transcript query"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err("Transcript stats error"))?;
        for row in rows {
            let raw = row.map_err(storage_err("Read transcript row"))?;
            let transcript: Transcript = serde_json::from_str(&raw)?;
            summary.transcripts.record(&transcript);
        }
        Ok(summary)
    }

    /// Tasks left non-terminal by a previous process (crash or kill) are
    /// marked aborted. Returns how many rows changed.
    pub fn abort_interrupted(&self) -> Result<usize> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn
            .execute(
                "UPDATE tasks SET state = 'aborted', stage = 'done', failure_kind = 'cancelled',
                    failure = '{\"kind\":\"cancelled\",\"reason\":\"process exited before the task finished\"}',
                    completed_at = ?1, updated_at = ?1
                 WHERE state IN ('idle', 'executing')",
                params![now],
            )
            .map_err(storage_err("Abort interrupted error"))?;
        if changed > 0 {
            info!(count = changed, "Marked interrupted tasks as aborted");
        }
        Ok(changed)
    }
}

impl TaskRecorder for TaskStore {
    fn record_task(&self, task: &Task) -> Result<()> {
        self.save_task(task)
    }

    fn record_log(&self, task_id: &str, seq: usize, entry: &LogEntry) -> Result<()> {
        self.append_log(task_id, seq, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use voxnav_core::error::FailureKind;
    use voxnav_core::types::{ActionPlan, ActionStep, PlanOrigin, StepOutcome, TaskFailure, Transcript};

    fn test_store() -> (TaskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(&dir.path().join("voxnav.db")).unwrap();
        (store, dir)
    }

    fn failed_task() -> Task {
        let mut task = Task::new(TaskSource::Voice);
        task.transcript = Some(Transcript {
            text: "click submit".into(),
            confidence: 0.9,
            utterance_id: Some("u1".into()),
            language: None,
        });
        task.plan = Some(ActionPlan::new(vec![ActionStep::click("#submit")], PlanOrigin::Grammar));
        task.state = TaskState::Failed;
        task.stage = TaskStage::Done;
        task.failure = Some(TaskFailure::new(FailureKind::StepTimeout, "element '#submit' did not appear").at_step(0));
        task.audio_path = Some("/recordings/utterance_u1.wav".into());
        task.started_at = Some(Utc::now());
        task.completed_at = Some(Utc::now());
        task
    }

    #[test]
    fn test_save_and_get_round_trip() {
        let (store, _dir) = test_store();
        let task = failed_task();
        store.save_task(&task).unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Failed);
        assert_eq!(loaded.plan, task.plan);
        assert_eq!(loaded.failure.as_ref().unwrap().step_index, Some(0));
        assert_eq!(loaded.transcript.unwrap().text, "click submit");
        assert_eq!(loaded.audio_path.as_deref(), Some("/recordings/utterance_u1.wav"));
        assert!(store.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_updates_state() {
        let (store, _dir) = test_store();
        let mut task = Task::new(TaskSource::Text);
        store.save_task(&task).unwrap();
        task.state = TaskState::Executing;
        task.stage = TaskStage::Executing;
        store.save_task(&task).unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Executing);
        assert_eq!(store.summary().unwrap().total, 1);
    }

    #[test]
    fn test_log_is_append_only_and_ordered() {
        let (store, _dir) = test_store();
        let task = failed_task();
        store.save_task(&task).unwrap();

        let retry = LogEntry::now(
            0,
            StepOutcome::Retrying { attempt: 1, kind: FailureKind::StepTimeout, reason: "not yet".into() },
        );
        let failed = LogEntry::now(
            0,
            StepOutcome::Failed { attempts: 4, kind: FailureKind::StepTimeout, reason: "gave up".into() },
        );
        store.append_log(&task.id, 0, &retry).unwrap();
        store.append_log(&task.id, 1, &failed).unwrap();
        // Duplicate seq is ignored.
        store.append_log(&task.id, 1, &retry).unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.log.len(), 2);
        assert_eq!(loaded.log[0].outcome, retry.outcome);
        assert_eq!(loaded.log[1].outcome, failed.outcome);
    }

    #[test]
    fn test_list_and_summary() {
        let (store, _dir) = test_store();
        store.save_task(&failed_task()).unwrap();
        store.save_task(&failed_task()).unwrap();
        let mut ok = Task::new(TaskSource::Text);
        ok.state = TaskState::Succeeded;
        ok.stage = TaskStage::Done;
        store.save_task(&ok).unwrap();

        assert_eq!(store.list_tasks(None, 10).unwrap().len(), 3);
        assert_eq!(store.list_tasks(None, 2).unwrap().len(), 2);
        let failed = store.list_tasks(Some(TaskState::Failed), 10).unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|t| t.state == TaskState::Failed));

        let summary = store.summary().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.transcripts.transcribed, 2);
        assert_eq!(summary.transcripts.words, 4);
        assert!((summary.transcripts.average_confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_abort_interrupted() {
        let (store, _dir) = test_store();
        let pending = Task::new(TaskSource::Text);
        store.save_task(&pending).unwrap();
        store.save_task(&failed_task()).unwrap();

        assert_eq!(store.abort_interrupted().unwrap(), 1);
        let loaded = store.get_task(&pending.id).unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Aborted);
        assert_eq!(loaded.failure.unwrap().kind, FailureKind::Cancelled);
    }
}
