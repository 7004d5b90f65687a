use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use super::Store;
use crate::error::{Error, Result};
use crate::record::{ExecutionRecord, Stage};
use crate::task::{ReleaseTask, TaskStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    space_id       INTEGER NOT NULL,
    project_id     INTEGER NOT NULL,
    environment_id INTEGER NOT NULL,
    name           TEXT    NOT NULL,
    user_id        INTEGER NOT NULL,
    status         INTEGER NOT NULL,
    version        TEXT    NOT NULL DEFAULT '',
    prev_version   TEXT    NOT NULL DEFAULT '',
    server_ids     TEXT    NOT NULL DEFAULT '[]',
    tag            TEXT    NOT NULL DEFAULT '',
    branch         TEXT    NOT NULL DEFAULT '',
    commit_id      TEXT    NOT NULL DEFAULT '',
    is_rollback    INTEGER NOT NULL DEFAULT 0,
    last_error     TEXT    NOT NULL DEFAULT '',
    audit_user_id  INTEGER,
    created_at     TEXT    NOT NULL,
    updated_at     TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    stage       INTEGER NOT NULL,
    task_id     INTEGER NOT NULL,
    server_id   INTEGER,
    user_id     INTEGER NOT NULL,
    command     TEXT    NOT NULL,
    envs        TEXT    NOT NULL DEFAULT '[]',
    status      INTEGER NOT NULL,
    output      TEXT    NOT NULL DEFAULT '',
    run_time_ms INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS records_task_id ON records (task_id, id);
";

const TASK_COLUMNS: &str = "id, space_id, project_id, environment_id, name, user_id, status, \
     version, prev_version, server_ids, tag, branch, commit_id, is_rollback, last_error, \
     audit_user_id, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::store(e.to_string(), Some(format!("open {}", path.display()))))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ReleaseTask> {
    let status: i32 = row.get(6)?;
    let server_ids: String = row.get(9)?;
    Ok(ReleaseTask {
        id: row.get(0)?,
        space_id: row.get(1)?,
        project_id: row.get(2)?,
        environment_id: row.get(3)?,
        name: row.get(4)?,
        user_id: row.get(5)?,
        status: TaskStatus::from_code(status)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, status as i64))?,
        version: row.get(7)?,
        prev_version: row.get(8)?,
        server_ids: serde_json::from_str(&server_ids).map_err(|e| conversion_error(9, e))?,
        tag: row.get(10)?,
        branch: row.get(11)?,
        commit_id: row.get(12)?,
        is_rollback: row.get(13)?,
        last_error: row.get(14)?,
        audit_user_id: row.get(15)?,
        created_at: timestamp(row, 16)?,
        updated_at: timestamp(row, 17)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let stage: i32 = row.get(1)?;
    let envs: String = row.get(6)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        stage: Stage::from_code(stage)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, stage as i64))?,
        task_id: row.get(2)?,
        server_id: row.get(3)?,
        user_id: row.get(4)?,
        command: row.get(5)?,
        envs: serde_json::from_str(&envs).map_err(|e| conversion_error(6, e))?,
        status: row.get(7)?,
        output: row.get(8)?,
        run_time_ms: row.get(9)?,
        created_at: timestamp(row, 10)?,
    })
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::internal_json(e.to_string(), None))
}

impl Store for SqliteStore {
    fn insert_task(&self, task: &ReleaseTask) -> Result<i64> {
        let conn = self.conn.lock();
        let id: Option<i64> = if task.id == 0 { None } else { Some(task.id) };
        conn.execute(
            "INSERT INTO tasks (id, space_id, project_id, environment_id, name, user_id, status, \
             version, prev_version, server_ids, tag, branch, commit_id, is_rollback, last_error, \
             audit_user_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                id,
                task.space_id,
                task.project_id,
                task.environment_id,
                task.name,
                task.user_id,
                task.status.code(),
                task.version,
                task.prev_version,
                json_text(&task.server_ids)?,
                task.tag,
                task.branch,
                task.commit_id,
                task.is_rollback,
                task.last_error,
                task.audit_user_id,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::store(e.to_string(), Some("insert task".to_string())))?;
        Ok(conn.last_insert_rowid())
    }

    fn load_task(&self, id: i64) -> Result<ReleaseTask> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            [id],
            task_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::task_not_found(id))
    }

    fn list_tasks(&self) -> Result<Vec<ReleaseTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY id DESC", TASK_COLUMNS))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn transition_status(
        &self,
        id: i64,
        expected: TaskStatus,
        next: TaskStatus,
        version: Option<&str>,
        auditor: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, version = COALESCE(?2, version), \
             audit_user_id = COALESCE(?3, audit_user_id), updated_at = ?4 \
             WHERE id = ?5 AND status = ?6",
            params![
                next.code(),
                version,
                auditor,
                Utc::now().to_rfc3339(),
                id,
                expected.code(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn update_prev_version(&self, id: i64, prev_version: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET prev_version = ?1, updated_at = ?2 WHERE id = ?3",
            params![prev_version, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(Error::task_not_found(id));
        }
        Ok(())
    }

    fn finish_task(&self, id: i64, status: TaskStatus, last_error: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.code(), last_error, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(Error::task_not_found(id));
        }
        Ok(())
    }

    fn insert_record(&self, record: &ExecutionRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (stage, task_id, server_id, user_id, command, envs, status, \
             output, run_time_ms, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.stage.code(),
                record.task_id,
                record.server_id,
                record.user_id,
                record.command,
                json_text(&record.envs)?,
                record.status,
                record.output,
                record.run_time_ms,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn records_after(&self, task_id: i64, after_id: i64) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, stage, task_id, server_id, user_id, command, envs, status, output, \
             run_time_ms, created_at FROM records WHERE task_id = ?1 AND id > ?2 ORDER BY id",
        )?;
        let records = stmt
            .query_map([task_id, after_id], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
