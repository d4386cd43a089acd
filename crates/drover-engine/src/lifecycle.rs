use chrono::Utc;
use tracing::{info, instrument, warn};

use drover_core::ids::{IdentityId, SubtaskId, TaskId};
use drover_core::machine::MachineId;
use drover_core::task::{Attempt, Subtask, SubtaskStatus, Task, TaskStatus};
use drover_store::TaskRepo;

use crate::error::EngineError;

/// Result of advancing past a valid attempt.
#[derive(Clone, Debug)]
pub enum Advance {
    /// The finished subtask was the last one; the task is now completed.
    Completed,
    /// Execution moved on to this subtask.
    Next { subtask_id: SubtaskId, command: String },
}

/// Owns task state transitions. Pure state + persistence; dispatching the
/// resulting commands is the dispatcher's concern.
///
/// All mutations here run under the dispatcher's per-task serialization, so
/// read-modify-write on the task document is safe.
pub struct TaskLifecycle {
    tasks: TaskRepo,
}

impl TaskLifecycle {
    pub fn new(tasks: TaskRepo) -> Self {
        Self { tasks }
    }

    pub fn repo(&self) -> &TaskRepo {
        &self.tasks
    }

    /// Persist a new pending task.
    #[instrument(skip(self, subtasks), fields(machine_id = %machine_id))]
    pub fn create(
        &self,
        identity: IdentityId,
        machine_id: MachineId,
        request: &str,
        subtasks: Vec<Subtask>,
    ) -> Result<Task, EngineError> {
        let task = Task::new(identity, machine_id, request, subtasks);
        self.tasks.insert(&task)?;
        info!(task_id = %task.id, steps = task.subtasks.len(), "task created");
        Ok(task)
    }

    /// Transition pending -> running. Rejected once terminal.
    pub fn mark_running(&self, task: &mut Task) -> Result<(), EngineError> {
        if task.is_terminal() {
            return Err(EngineError::Terminal(task.id.to_string()));
        }
        task.status = TaskStatus::Running;
        self.tasks.save(task)?;
        Ok(())
    }

    /// Append an attempt to the task's current subtask. The sole creation
    /// path for attempts.
    pub fn record_attempt(
        &self,
        task: &mut Task,
        subtask_id: &SubtaskId,
        attempt: Attempt,
    ) -> Result<(), EngineError> {
        if task.is_terminal() {
            return Err(EngineError::Terminal(task.id.to_string()));
        }
        if !task.is_current_subtask(subtask_id) {
            return Err(EngineError::Internal(format!(
                "attempt for non-current subtask {subtask_id}"
            )));
        }
        let subtask = task
            .current_subtask_mut()
            .ok_or_else(|| EngineError::Internal("no current subtask".into()))?;
        subtask.attempts.push(attempt);
        self.tasks.save(task)?;
        Ok(())
    }

    /// After a valid attempt: complete the current subtask and either finish
    /// the task or move the index to the next subtask.
    #[instrument(skip(self, task), fields(task_id = %task.id, index = task.current_subtask_index))]
    pub fn advance(&self, task: &mut Task) -> Result<Advance, EngineError> {
        if task.is_terminal() {
            return Err(EngineError::Terminal(task.id.to_string()));
        }
        if let Some(subtask) = task.current_subtask_mut() {
            subtask.status = SubtaskStatus::Completed;
        }

        let outcome = if task.current_subtask_index + 1 >= task.subtasks.len() {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now().to_rfc3339());
            info!(task_id = %task.id, "task completed");
            Advance::Completed
        } else {
            task.current_subtask_index += 1;
            let next = task
                .current_subtask()
                .ok_or_else(|| EngineError::Internal("index advanced past end".into()))?;
            Advance::Next {
                subtask_id: next.id.clone(),
                command: next.command.clone(),
            }
        };

        self.tasks.save(task)?;
        Ok(outcome)
    }

    /// Terminal failure. Irreversible.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub fn fail(&self, task: &mut Task, reason: &str) -> Result<(), EngineError> {
        if task.is_terminal() {
            return Err(EngineError::Terminal(task.id.to_string()));
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now().to_rfc3339());
        task.error_message = Some(reason.to_owned());
        self.tasks.save(task)?;
        warn!(task_id = %task.id, reason, "task failed");
        Ok(())
    }

    /// Cancel a pending/running task. Returns false when the task is absent,
    /// already terminal, or owned by someone else.
    pub fn cancel(&self, task_id: &TaskId, identity: &IdentityId) -> Result<bool, EngineError> {
        let cancelled = self.tasks.cancel(task_id, identity)?;
        if cancelled {
            info!(task_id = %task_id, "task cancelled");
        }
        Ok(cancelled)
    }

    /// Attach the generated summary.
    pub fn set_summary(&self, task: &mut Task, summary: &str) -> Result<(), EngineError> {
        task.summary = Some(summary.to_owned());
        self.tasks.save(task)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::machine::SystemInfo;
    use drover_core::task::Validation;
    use drover_store::{Database, MachineRepo};

    fn subtask(id: &str, command: &str) -> Subtask {
        Subtask {
            id: SubtaskId::from_raw(id),
            description: format!("run {command}"),
            command: command.into(),
            expected_output: "success".into(),
            dependencies: vec![],
            attempts: vec![],
            status: SubtaskStatus::Pending,
        }
    }

    fn setup(subtasks: Vec<Subtask>) -> (TaskLifecycle, Task) {
        let db = Database::in_memory().unwrap();
        let machine_id = MachineId::from_raw("aabb_box_12ab34cd");
        MachineRepo::new(db.clone())
            .upsert(&machine_id, &SystemInfo::default())
            .unwrap();
        let lifecycle = TaskLifecycle::new(TaskRepo::new(db));
        let task = lifecycle
            .create(IdentityId::new(), machine_id, "do things", subtasks)
            .unwrap();
        (lifecycle, task)
    }

    #[test]
    fn create_persists_pending() {
        let (lifecycle, task) = setup(vec![subtask("step_1", "whoami")]);
        let loaded = lifecycle.repo().get(&task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.current_subtask_index, 0);
    }

    #[test]
    fn advance_through_all_subtasks() {
        let (lifecycle, mut task) =
            setup(vec![subtask("step_1", "whoami"), subtask("step_2", "uptime")]);
        lifecycle.mark_running(&mut task).unwrap();

        let first = lifecycle.advance(&mut task).unwrap();
        match first {
            Advance::Next { subtask_id, command } => {
                assert_eq!(subtask_id.as_str(), "step_2");
                assert_eq!(command, "uptime");
            }
            Advance::Completed => panic!("should not complete yet"),
        }
        assert_eq!(task.current_subtask_index, 1);
        assert_eq!(task.subtasks[0].status, SubtaskStatus::Completed);

        let second = lifecycle.advance(&mut task).unwrap();
        assert!(matches!(second, Advance::Completed));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());

        // Index never decreased and never exceeded len
        assert_eq!(task.current_subtask_index, 1);
        assert!(task.current_subtask_index < task.subtasks.len());
    }

    #[test]
    fn record_attempt_appends_to_current() {
        let (lifecycle, mut task) = setup(vec![subtask("step_1", "whoami")]);
        lifecycle.mark_running(&mut task).unwrap();

        let attempt = Attempt::new(1, "whoami", "root\n", 0, Validation::valid(0.9));
        lifecycle
            .record_attempt(&mut task, &SubtaskId::from_raw("step_1"), attempt)
            .unwrap();

        let loaded = lifecycle.repo().get(&task.id).unwrap();
        assert_eq!(loaded.subtasks[0].attempts.len(), 1);
    }

    #[test]
    fn record_attempt_rejects_non_current_subtask() {
        let (lifecycle, mut task) =
            setup(vec![subtask("step_1", "whoami"), subtask("step_2", "uptime")]);
        lifecycle.mark_running(&mut task).unwrap();

        let attempt = Attempt::new(1, "uptime", "", 0, Validation::valid(0.9));
        let err = lifecycle
            .record_attempt(&mut task, &SubtaskId::from_raw("step_2"), attempt)
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn terminal_states_are_final() {
        let (lifecycle, mut task) = setup(vec![subtask("step_1", "whoami")]);
        lifecycle.mark_running(&mut task).unwrap();
        lifecycle.fail(&mut task, "gave up").unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("gave up"));

        assert!(matches!(
            lifecycle.mark_running(&mut task),
            Err(EngineError::Terminal(_))
        ));
        assert!(matches!(
            lifecycle.advance(&mut task),
            Err(EngineError::Terminal(_))
        ));
        assert!(matches!(
            lifecycle.fail(&mut task, "again"),
            Err(EngineError::Terminal(_))
        ));
        let attempt = Attempt::new(2, "x", "", 0, Validation::valid(0.9));
        assert!(matches!(
            lifecycle.record_attempt(&mut task, &SubtaskId::from_raw("step_1"), attempt),
            Err(EngineError::Terminal(_))
        ));
    }

    #[test]
    fn cancel_pending_and_running_only() {
        let (lifecycle, mut task) = setup(vec![subtask("step_1", "whoami")]);
        let identity = task.identity_id.clone();

        assert!(lifecycle.cancel(&task.id, &identity).unwrap());
        assert!(!lifecycle.cancel(&task.id, &identity).unwrap(), "terminal cancel rejected");

        task = lifecycle.repo().get(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn set_summary_persists() {
        let (lifecycle, mut task) = setup(vec![subtask("step_1", "whoami")]);
        lifecycle.set_summary(&mut task, "you are root").unwrap();
        let loaded = lifecycle.repo().get(&task.id).unwrap();
        assert_eq!(loaded.summary.as_deref(), Some("you are root"));
    }
}
