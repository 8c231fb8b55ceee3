//! Task queue persistence: active tasks, the archive, responses, review
//! links and batches.
//!
//! Active (non-terminal) tasks live in `tasks`. A task that reaches a
//! terminal status is moved to `task_archive` in the same transaction that
//! writes its final state, so the queue never holds a settled record.

use crate::{lock_err, storage_err};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use taia_types::agent::AgentId;
use taia_types::error::{TaiaError, TaiaResult};
use taia_types::task::{
    Batch, BatchId, ReviewLink, Task, TaskId, TaskResponse, TaskStatus,
};

/// Task store backed by SQLite.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

/// Per-status counts across the queue and the archive.
#[derive(Debug, Clone, Default)]
pub struct StatusCounts {
    pub by_status: HashMap<TaskStatus, u64>,
    pub archived: u64,
}

fn decode_task(record: &str) -> TaiaResult<Task> {
    Ok(serde_json::from_str(record)?)
}

fn move_to_archive(conn: &Connection, task: &Task, record: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO task_archive (id, target, status, created_us, archived_at, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            task.id.to_string(),
            task.target.as_str(),
            task.status.as_str(),
            task.timestamp.timestamp_micros(),
            Utc::now().to_rfc3339(),
            record,
        ],
    )?;
    conn.execute(
        "DELETE FROM tasks WHERE id = ?1",
        rusqlite::params![task.id.to_string()],
    )?;
    Ok(())
}

impl TaskStore {
    /// Create a new task store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Persist a freshly delegated task.
    pub fn insert_task(&self, task: &Task) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record = serde_json::to_string(task)?;
        conn.execute(
            "INSERT INTO tasks (id, target, status, created_us, record, parent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                task.id.to_string(),
                task.target.as_str(),
                task.status.as_str(),
                task.timestamp.timestamp_micros(),
                record,
                task.parent,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Fetch a task that is still in the queue.
    pub fn get_active(&self, id: TaskId) -> TaiaResult<Option<Task>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM tasks WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        record.as_deref().map(decode_task).transpose()
    }

    /// Fetch a task from the queue or, failing that, the archive.
    pub fn get_task(&self, id: TaskId) -> TaiaResult<Option<Task>> {
        if let Some(task) = self.get_active(id)? {
            return Ok(Some(task));
        }
        let conn = self.conn.lock().map_err(lock_err)?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM task_archive WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        record.as_deref().map(decode_task).transpose()
    }

    /// Whether a task has been moved to the archive.
    pub fn is_archived(&self, id: TaskId) -> TaiaResult<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM task_archive WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(found.is_some())
    }

    /// Read-modify-write one active task under the store lock.
    ///
    /// The closure may reject the change by returning an error, in which
    /// case nothing is written. If the task ends in a terminal status it is
    /// archived in the same transaction.
    pub fn update_task<F>(&self, id: TaskId, mutate: F) -> TaiaResult<Task>
    where
        F: FnOnce(&mut Task) -> TaiaResult<()>,
    {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(storage_err)?;

        let record: Option<String> = tx
            .query_row(
                "SELECT record FROM tasks WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        let mut task = match record {
            Some(r) => decode_task(&r)?,
            None => return Err(TaiaError::TaskNotFound(id.to_string())),
        };

        mutate(&mut task)?;

        let record = serde_json::to_string(&task)?;
        if task.status.is_terminal() {
            move_to_archive(&tx, &task, &record).map_err(storage_err)?;
        } else {
            tx.execute(
                "UPDATE tasks SET status = ?2, record = ?3 WHERE id = ?1",
                rusqlite::params![id.to_string(), task.status.as_str(), record],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(task)
    }

    /// Pending tasks addressed to `target`, oldest first.
    pub fn list_pending_for(&self, target: &AgentId) -> TaiaResult<Vec<Task>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT record FROM tasks WHERE target = ?1 AND status = ?2
                 ORDER BY created_us, rowid",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![target.as_str(), TaskStatus::Pending.as_str()],
                |row| row.get::<_, String>(0),
            )
            .map_err(storage_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(decode_task(&row.map_err(storage_err)?)?);
        }
        Ok(tasks)
    }

    /// All queued tasks, optionally filtered by status, oldest first.
    pub fn list_active(&self, status: Option<TaskStatus>) -> TaiaResult<Vec<Task>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let (sql, params): (&str, Vec<String>) = match status {
            Some(s) => (
                "SELECT record FROM tasks WHERE status = ?1 ORDER BY created_us, rowid",
                vec![s.as_str().to_string()],
            ),
            None => ("SELECT record FROM tasks ORDER BY created_us, rowid", vec![]),
        };
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            let record = row.map_err(storage_err)?;
            match decode_task(&record) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping undecodable task record: {e}"),
            }
        }
        Ok(tasks)
    }

    /// Most recently archived tasks, newest first, optionally only those
    /// that settled in `status`.
    pub fn list_archived(&self, status: Option<TaskStatus>, limit: usize) -> TaiaResult<Vec<Task>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let limit = Value::Integer(limit as i64);
        let (sql, params): (&str, Vec<Value>) = match status {
            Some(s) => (
                "SELECT record FROM task_archive WHERE status = ?1
                 ORDER BY archived_at DESC LIMIT ?2",
                vec![Value::Text(s.as_str().to_string()), limit],
            ),
            None => (
                "SELECT record FROM task_archive ORDER BY archived_at DESC LIMIT ?1",
                vec![limit],
            ),
        };
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(decode_task(&row.map_err(storage_err)?)?);
        }
        Ok(tasks)
    }

    /// Status counts over the queue and the archive.
    pub fn count_by_status(&self) -> TaiaResult<StatusCounts> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut counts = StatusCounts::default();
        for (table, is_archive) in [("tasks", false), ("task_archive", true)] {
            let sql = format!("SELECT status, COUNT(*) FROM {table} GROUP BY status");
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(storage_err)?;
            for row in rows {
                let (status, n) = row.map_err(storage_err)?;
                let Ok(status) = status.parse::<TaskStatus>() else {
                    continue;
                };
                *counts.by_status.entry(status).or_insert(0) += n as u64;
                if is_archive {
                    counts.archived += n as u64;
                }
            }
        }
        Ok(counts)
    }

    /// Write (or overwrite) the response for a task.
    pub fn save_response(&self, response: &TaskResponse) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record = serde_json::to_string(response)?;
        conn.execute(
            "INSERT INTO responses (request_id, status, record, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(request_id) DO UPDATE SET status = ?2, record = ?3, updated_at = ?4",
            rusqlite::params![
                response.request_id.to_string(),
                response.status.as_str(),
                record,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_response(&self, request_id: TaskId) -> TaiaResult<Option<TaskResponse>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM responses WHERE request_id = ?1",
                rusqlite::params![request_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn insert_review_link(&self, link: &ReviewLink) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT INTO review_links (qa_request_id, original_request_id, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                link.qa_request_id.to_string(),
                link.original_request_id.to_string(),
                link.created_at.to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Resolve a review task back to the task under review.
    pub fn get_review_link(&self, qa_request_id: TaskId) -> TaiaResult<Option<ReviewLink>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT original_request_id, created_at FROM review_links WHERE qa_request_id = ?1",
                rusqlite::params![qa_request_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err)?;
        let Some((original, created)) = row else {
            return Ok(None);
        };
        let original_request_id = original
            .parse::<TaskId>()
            .map_err(|e| TaiaError::Serialization(e.to_string()))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(ReviewLink {
            original_request_id,
            qa_request_id,
            created_at,
        }))
    }

    /// Insert or update batch bookkeeping.
    pub fn save_batch(&self, batch: &Batch) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record = serde_json::to_string(batch)?;
        conn.execute(
            "INSERT INTO batches (id, parent, created_at, record) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET record = ?4",
            rusqlite::params![
                batch.id.to_string(),
                batch.parent,
                batch.created_at.to_rfc3339(),
                record,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_batch(&self, id: BatchId) -> TaiaResult<Option<Batch>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM batches WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
    }
}
