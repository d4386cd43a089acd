use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{IdentityId, SubtaskId, TaskId};
use crate::machine::MachineId;

/// Ceiling on execution attempts per subtask. Bounds worst-case latency and
/// reasoning cost while leaving the substitute mechanism two chances to
/// recover from a bad first command.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Subtasks only ever move pending -> completed; failure is recorded on the
/// owning task, not the subtask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Completed,
}

/// Verdict the reasoning backend returns for one execution attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Validation {
    pub is_valid: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default = "default_true")]
    pub should_retry: bool,
}

fn default_true() -> bool {
    true
}

impl Validation {
    pub fn valid(confidence: f64) -> Self {
        Self {
            is_valid: true,
            confidence,
            error_message: String::new(),
            suggested_fix: String::new(),
            should_retry: false,
        }
    }

    pub fn invalid(confidence: f64, error_message: impl Into<String>, should_retry: bool) -> Self {
        Self {
            is_valid: false,
            confidence,
            error_message: error_message.into(),
            suggested_fix: String::new(),
            should_retry,
        }
    }

    pub fn with_fix(mut self, suggested_fix: impl Into<String>) -> Self {
        self.suggested_fix = suggested_fix.into();
        self
    }
}

/// One execution try of a subtask's command.
///
/// `command` is what actually ran, which differs from the subtask's nominal
/// command when a substitute was dispatched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_number: u32,
    pub command: String,
    pub output: String,
    pub exit_code: i32,
    pub validation: Validation,
    pub timestamp: String,
}

impl Attempt {
    pub fn new(
        attempt_number: u32,
        command: impl Into<String>,
        output: impl Into<String>,
        exit_code: i32,
        validation: Validation,
    ) -> Self {
        Self {
            attempt_number,
            command: command.into(),
            output: output.into(),
            exit_code,
            validation,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// One command-level step within a task. Execution is strictly sequential by
/// index; `dependencies` are informational output of decomposition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub description: String,
    pub command: String,
    pub expected_output: String,
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default = "default_subtask_status")]
    pub status: SubtaskStatus,
}

fn default_subtask_status() -> SubtaskStatus {
    SubtaskStatus::Pending
}

impl Subtask {
    /// Attempt number the next execution of this subtask must carry.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn has_valid_attempt(&self) -> bool {
        self.attempts.iter().any(|a| a.validation.is_valid)
    }
}

/// One decomposed user request, tracked end to end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub identity_id: IdentityId,
    pub machine_id: MachineId,
    pub request: String,
    pub subtasks: Vec<Subtask>,
    pub current_subtask_index: usize,
    pub status: TaskStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub summary: Option<String>,
}

impl Task {
    pub fn new(
        identity_id: IdentityId,
        machine_id: MachineId,
        request: impl Into<String>,
        subtasks: Vec<Subtask>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            identity_id,
            machine_id,
            request: request.into(),
            subtasks,
            current_subtask_index: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now().to_rfc3339(),
            completed_at: None,
            error_message: None,
            summary: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_subtask(&self) -> Option<&Subtask> {
        self.subtasks.get(self.current_subtask_index)
    }

    pub fn current_subtask_mut(&mut self) -> Option<&mut Subtask> {
        self.subtasks.get_mut(self.current_subtask_index)
    }

    /// Whether `subtask_id` names the subtask execution is currently gated on.
    pub fn is_current_subtask(&self, subtask_id: &SubtaskId) -> bool {
        self.current_subtask()
            .map(|s| &s.id == subtask_id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(id: &str) -> Subtask {
        Subtask {
            id: SubtaskId::from_raw(id),
            description: format!("run {id}"),
            command: "true".into(),
            expected_output: "exit 0".into(),
            dependencies: vec![],
            attempts: vec![],
            status: SubtaskStatus::Pending,
        }
    }

    #[test]
    fn new_task_starts_pending_at_index_zero() {
        let task = Task::new(
            IdentityId::new(),
            MachineId::from_raw("aabb_host_12ab34cd"),
            "list files",
            vec![subtask("step_1")],
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.current_subtask_index, 0);
        assert!(!task.is_terminal());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn status_display_from_str_roundtrip() {
        for s in ["pending", "running", "completed", "failed", "cancelled"] {
            let status: TaskStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn current_subtask_tracking() {
        let mut task = Task::new(
            IdentityId::new(),
            MachineId::from_raw("aabb_host_12ab34cd"),
            "two steps",
            vec![subtask("step_1"), subtask("step_2")],
        );
        assert!(task.is_current_subtask(&SubtaskId::from_raw("step_1")));
        assert!(!task.is_current_subtask(&SubtaskId::from_raw("step_2")));

        task.current_subtask_index = 1;
        assert!(task.is_current_subtask(&SubtaskId::from_raw("step_2")));

        task.current_subtask_index = 2;
        assert!(task.current_subtask().is_none());
        assert!(!task.is_current_subtask(&SubtaskId::from_raw("step_2")));
    }

    #[test]
    fn attempt_numbering() {
        let mut st = subtask("step_1");
        assert_eq!(st.next_attempt_number(), 1);
        st.attempts.push(Attempt::new(1, "true", "", 0, Validation::invalid(0.3, "no", true)));
        assert_eq!(st.next_attempt_number(), 2);
        assert!(!st.has_valid_attempt());
        st.attempts.push(Attempt::new(2, "true", "", 0, Validation::valid(0.9)));
        assert!(st.has_valid_attempt());
    }

    #[test]
    fn validation_serde_defaults() {
        let v: Validation = serde_json::from_str(r#"{"is_valid": false}"#).unwrap();
        assert!(!v.is_valid);
        assert!(v.should_retry, "should_retry defaults to true");
        assert_eq!(v.confidence, 0.0);
        assert_eq!(v.suggested_fix, "");
    }

    #[test]
    fn task_serde_roundtrip() {
        let task = Task::new(
            IdentityId::new(),
            MachineId::from_raw("aabb_host_12ab34cd"),
            "roundtrip",
            vec![subtask("step_1")],
        );
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.subtasks.len(), 1);
        assert_eq!(parsed.status, TaskStatus::Pending);
    }
}
