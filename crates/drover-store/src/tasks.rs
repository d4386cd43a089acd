use chrono::Utc;
use rusqlite::Row;
use tracing::instrument;

use drover_core::ids::{IdentityId, TaskId};
use drover_core::machine::MachineId;
use drover_core::task::{Subtask, Task, TaskStatus};

use crate::database::Database;
use crate::error::StoreError;

/// Repository for persisted task records.
///
/// Subtasks (with their attempts) are stored as a JSON document column on
/// the task row; the whole record is read, mutated, and written back under
/// the caller's per-task serialization.
pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a newly created task.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let subtasks = serde_json::to_string(&task.subtasks)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, identity_id, machine_id, request, subtasks,
                                    current_subtask_index, status, created_at,
                                    completed_at, error_message, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    task.id.as_str(),
                    task.identity_id.as_str(),
                    task.machine_id.as_str(),
                    task.request,
                    subtasks,
                    task.current_subtask_index as i64,
                    task.status.to_string(),
                    task.created_at,
                    task.completed_at,
                    task.error_message,
                    task.summary,
                ],
            )?;
            Ok(())
        })
    }

    /// Write back every mutable field of a task.
    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status))]
    pub fn save(&self, task: &Task) -> Result<(), StoreError> {
        let subtasks = serde_json::to_string(&task.subtasks)?;
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET subtasks = ?1, current_subtask_index = ?2, status = ?3,
                                  completed_at = ?4, error_message = ?5, summary = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    subtasks,
                    task.current_subtask_index as i64,
                    task.status.to_string(),
                    task.completed_at,
                    task.error_message,
                    task.summary,
                    task.id.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("task {}", task.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    pub fn get(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, identity_id, machine_id, request, subtasks,
                        current_subtask_index, status, created_at,
                        completed_at, error_message, summary
                 FROM tasks WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    /// Get a task only if it belongs to the given identity.
    pub fn get_for_identity(&self, id: &TaskId, identity: &IdentityId) -> Result<Task, StoreError> {
        let task = self.get(id)?;
        if &task.identity_id != identity {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(task)
    }

    /// List an identity's tasks, newest first.
    #[instrument(skip(self), fields(identity = %identity))]
    pub fn list(
        &self,
        identity: &IdentityId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Task>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, identity_id, machine_id, request, subtasks,
                        current_subtask_index, status, created_at,
                        completed_at, error_message, summary
                 FROM tasks WHERE identity_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![identity.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }

    /// Cancel a task if (and only if) it is still pending or running.
    /// Returns false when the task is absent, terminal, or owned by a
    /// different identity.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn cancel(&self, id: &TaskId, identity: &IdentityId) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1
                 WHERE id = ?2 AND identity_id = ?3 AND status IN ('pending', 'running')",
                rusqlite::params![now, id.as_str(), identity.as_str()],
            )?;
            Ok(updated > 0)
        })
    }
}

fn row_to_task(row: &Row<'_>) -> Result<Task, StoreError> {
    let subtasks_json: String = row.get(4)?;
    let subtasks: Vec<Subtask> = serde_json::from_str(&subtasks_json)?;
    let status_str: String = row.get(6)?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e: String| StoreError::Database(e))?;
    let index: i64 = row.get(5)?;

    Ok(Task {
        id: TaskId::from_raw(row.get::<_, String>(0)?),
        identity_id: IdentityId::from_raw(row.get::<_, String>(1)?),
        machine_id: MachineId::from_raw(row.get::<_, String>(2)?),
        request: row.get(3)?,
        subtasks,
        current_subtask_index: index as usize,
        status,
        created_at: row.get(7)?,
        completed_at: row.get(8)?,
        error_message: row.get(9)?,
        summary: row.get(10)?,
    })
}
