//! SQLite status store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::StatusStore;
use crate::error::{EngineError, Result};
use crate::workflow::{
    ExecutionMode, ExecutionRecord, ExecutionStatus, TaskDescriptor, TaskStatus, TaskStatusEntry,
    Workflow, WorkflowId,
};

/// Parses an RFC 3339 timestamp inside a row closure without panicking.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

/// Status store on a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        info!("Opening status database at {}", path.as_ref().display());
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        // WAL must be selected before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                task_order INTEGER NOT NULL,
                execution_type TEXT NOT NULL DEFAULT 'sync',
                parameters TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                owner TEXT,
                heartbeat_at TEXT
            );

            CREATE TABLE IF NOT EXISTS task_statuses (
                execution_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                started_at TEXT,
                finished_at TEXT,
                PRIMARY KEY (execution_id, task_id),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id, task_order);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            "#,
        )?;
        Ok(())
    }

    fn read_execution(conn: &Connection, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let row = conn
            .query_row(
                "SELECT id, workflow_id, status, started_at, completed_at, owner, heartbeat_at
                 FROM executions WHERE id = ?1",
                params![execution_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        parse_datetime_utc(&row.get::<_, String>(3)?)?,
                        parse_optional_datetime(row.get(4)?)?,
                        row.get::<_, Option<String>>(5)?,
                        parse_optional_datetime(row.get(6)?)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, workflow_id, status, started_at, completed_at, owner, heartbeat_at)) = row
        else {
            return Ok(None);
        };

        let status = ExecutionStatus::parse(&status).ok_or_else(|| {
            EngineError::Storage(format!("execution {} has unknown status '{}'", id, status))
        })?;

        let mut stmt = conn.prepare(
            "SELECT task_id, status, error, started_at, finished_at
             FROM task_statuses WHERE execution_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    parse_optional_datetime(row.get(3)?)?,
                    parse_optional_datetime(row.get(4)?)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut task_statuses = Vec::with_capacity(rows.len());
        for (task_id, task_status, error, task_started, finished_at) in rows {
            let task_status = TaskStatus::parse(&task_status).ok_or_else(|| {
                EngineError::Storage(format!(
                    "task {} of execution {} has unknown status '{}'",
                    task_id, id, task_status
                ))
            })?;
            task_statuses.push(TaskStatusEntry {
                task_id,
                status: task_status,
                error,
                started_at: task_started,
                finished_at,
            });
        }

        Ok(Some(ExecutionRecord {
            id,
            workflow_id,
            status,
            started_at,
            completed_at,
            task_statuses,
            owner,
            heartbeat_at,
        }))
    }
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO workflows (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![workflow.name, workflow.description, Utc::now().to_rfc3339()],
        )?;
        let workflow_id = tx.last_insert_rowid();

        let mut stored = workflow.clone();
        stored.id = workflow_id;
        stored.sort_tasks();
        for task in &mut stored.tasks {
            tx.execute(
                "INSERT INTO tasks
                 (workflow_id, name, description, task_order, execution_type, parameters)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    workflow_id,
                    task.name,
                    task.description,
                    task.order,
                    task.execution_mode.as_str(),
                    serde_json::to_string(&task.parameters)?,
                ],
            )?;
            task.id = tx.last_insert_rowid();
            task.workflow_id = workflow_id;
        }
        tx.commit()?;

        debug!(
            "Stored workflow '{}' as {} with {} tasks",
            stored.name,
            stored.id,
            stored.tasks.len()
        );
        Ok(stored)
    }

    async fn load_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<TaskDescriptor>> {
        let conn = self.conn.lock().await;

        let exists = conn
            .query_row(
                "SELECT 1 FROM workflows WHERE id = ?1",
                params![workflow_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(EngineError::NotFound(format!("workflow {}", workflow_id)));
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, description, task_order, execution_type, parameters
             FROM tasks WHERE workflow_id = ?1 ORDER BY task_order, id",
        )?;
        let rows = stmt
            .query_map(params![workflow_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, name, description, order, mode, parameters) in rows {
            // Missing or unrecognised modes fall back to sync
            let execution_mode = ExecutionMode::parse(&mode).unwrap_or_default();
            let parameters: Map<String, Value> = serde_json::from_str(&parameters)?;
            tasks.push(TaskDescriptor {
                id,
                workflow_id,
                name,
                description,
                order,
                execution_mode,
                parameters,
            });
        }
        Ok(tasks)
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        // A terminal row only accepts a rewrite with the same status
        let written = tx.execute(
            "INSERT INTO executions
             (id, workflow_id, status, started_at, completed_at, owner, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                owner = excluded.owner,
                heartbeat_at = excluded.heartbeat_at
             WHERE executions.status NOT IN ('completed', 'failed')
                OR executions.status = excluded.status",
            params![
                record.id,
                record.workflow_id,
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.owner,
                record.heartbeat_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if written == 0 {
            let stored: String = tx.query_row(
                "SELECT status FROM executions WHERE id = ?1",
                params![record.id],
                |row| row.get(0),
            )?;
            return Err(EngineError::Conflict(format!(
                "execution {} is already {}",
                record.id, stored
            )));
        }

        for (position, entry) in record.task_statuses.iter().enumerate() {
            tx.execute(
                "INSERT INTO task_statuses
                 (execution_id, position, task_id, status, error, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(execution_id, task_id) DO UPDATE SET
                    status = excluded.status,
                    error = excluded.error,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at",
                params![
                    record.id,
                    position as i64,
                    entry.task_id,
                    entry.status.as_str(),
                    entry.error,
                    entry.started_at.map(|t| t.to_rfc3339()),
                    entry.finished_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn touch_execution(
        &self,
        execution_id: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let touched = conn.execute(
            "UPDATE executions SET heartbeat_at = ?3
             WHERE id = ?1 AND owner = ?2 AND status NOT IN ('completed', 'failed')",
            params![execution_id, owner, at.to_rfc3339()],
        )?;
        Ok(touched > 0)
    }

    async fn load_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let conn = self.conn.lock().await;
        Self::read_execution(&conn, execution_id)?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))
    }

    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().await;
        let ids = {
            let mut stmt = conn
                .prepare("SELECT id FROM executions WHERE status = ?1 ORDER BY started_at, id")?;
            let ids = stmt
                .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = Self::read_execution(&conn, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
