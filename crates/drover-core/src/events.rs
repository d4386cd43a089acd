use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{SubtaskId, TaskId};
use crate::machine::MachineId;
use crate::task::{Attempt, TaskStatus, Validation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Server,
    Agent,
}

/// One entry in a task's log transcript. Held in the broadcaster's bounded
/// per-task history, never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub task_id: TaskId,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub context: Value,
    pub timestamp: String,
}

impl LogEntry {
    pub fn server(task_id: TaskId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id,
            source: LogSource::Server,
            level,
            message: message.into(),
            details: Value::Null,
            context: Value::Null,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Events the server pushes to observer dashboards.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    TaskStarted {
        task_id: TaskId,
        machine_id: MachineId,
    },
    TaskUpdate {
        task_id: TaskId,
        subtask_id: SubtaskId,
        status: TaskStatus,
        attempt: Attempt,
        validation: Validation,
    },
    LiveOutput {
        task_id: TaskId,
        subtask_id: SubtaskId,
        attempt_number: u32,
        stream: String,
        data: String,
        machine_id: MachineId,
        timestamp: String,
    },
    ServerLog {
        #[serde(flatten)]
        entry: LogEntry,
    },
    ClientLog {
        task_id: TaskId,
        level: String,
        message: String,
        logger: String,
        #[serde(default)]
        context: Value,
        machine_id: MachineId,
        timestamp: String,
    },
    AiSummaryUpdate {
        task_id: TaskId,
        ai_summary: String,
        machine_id: MachineId,
        timestamp: String,
    },
    AlternativeCommandTriggered {
        task_id: TaskId,
        original_command: String,
        alternative_command: String,
        reason: String,
        attempt_number: u32,
        machine_id: MachineId,
        timestamp: String,
    },
    AlternativeCommandResult {
        task_id: TaskId,
        command: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
        attempt_number: u32,
        machine_id: MachineId,
        timestamp: String,
    },
    InteractivePrompt {
        task_id: TaskId,
        data: Value,
        machine_id: MachineId,
        timestamp: String,
    },
    WaitingForInput {
        task_id: TaskId,
        machine_id: MachineId,
        timestamp: String,
    },
    ProcessHealthUpdate {
        task_id: TaskId,
        health_status: String,
        metrics: Value,
        machine_id: MachineId,
        timestamp: String,
    },
    Pong,
}

impl ObserverEvent {
    /// The task this event belongs to, if any (`Pong` has none; server logs
    /// may carry the system sentinel).
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskUpdate { task_id, .. }
            | Self::LiveOutput { task_id, .. }
            | Self::ClientLog { task_id, .. }
            | Self::AiSummaryUpdate { task_id, .. }
            | Self::AlternativeCommandTriggered { task_id, .. }
            | Self::AlternativeCommandResult { task_id, .. }
            | Self::InteractivePrompt { task_id, .. }
            | Self::WaitingForInput { task_id, .. }
            | Self::ProcessHealthUpdate { task_id, .. } => Some(task_id),
            Self::ServerLog { entry } => Some(&entry.task_id),
            Self::Pong => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::TaskUpdate { .. } => "task_update",
            Self::LiveOutput { .. } => "live_output",
            Self::ServerLog { .. } => "server_log",
            Self::ClientLog { .. } => "client_log",
            Self::AiSummaryUpdate { .. } => "ai_summary_update",
            Self::AlternativeCommandTriggered { .. } => "alternative_command_triggered",
            Self::AlternativeCommandResult { .. } => "alternative_command_result",
            Self::InteractivePrompt { .. } => "interactive_prompt",
            Self::WaitingForInput { .. } => "waiting_for_input",
            Self::ProcessHealthUpdate { .. } => "process_health_update",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_started_serializes_with_tag() {
        let event = ObserverEvent::TaskStarted {
            task_id: TaskId::from_raw("task_7"),
            machine_id: MachineId::from_raw("aabb_host_12ab34cd"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task_started\""));
        assert!(json.contains("task_7"));
    }

    #[test]
    fn server_log_flattens_entry() {
        let event = ObserverEvent::ServerLog {
            entry: LogEntry::server(TaskId::from_raw("task_3"), LogLevel::Info, "hello"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "server_log");
        assert_eq!(json["task_id"], "task_3");
        assert_eq!(json["level"], "info");
        assert_eq!(json["source"], "server");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn task_id_accessor() {
        let tid = TaskId::from_raw("task_5");
        let event = ObserverEvent::WaitingForInput {
            task_id: tid.clone(),
            machine_id: MachineId::from_raw("m_h_1"),
            timestamp: Utc::now().to_rfc3339(),
        };
        assert_eq!(event.task_id(), Some(&tid));
        assert_eq!(ObserverEvent::Pong.task_id(), None);
    }

    #[test]
    fn event_type_strings() {
        let event = ObserverEvent::Pong;
        assert_eq!(event.event_type(), "pong");

        let event = ObserverEvent::AiSummaryUpdate {
            task_id: TaskId::new(),
            ai_summary: "done".into(),
            machine_id: MachineId::from_raw("m_h_1"),
            timestamp: Utc::now().to_rfc3339(),
        };
        assert_eq!(event.event_type(), "ai_summary_update");
    }

    #[test]
    fn observer_event_roundtrip() {
        let event = ObserverEvent::LiveOutput {
            task_id: TaskId::from_raw("task_1"),
            subtask_id: SubtaskId::from_raw("step_1"),
            attempt_number: 1,
            stream: "stdout".into(),
            data: "hello\n".into(),
            machine_id: MachineId::from_raw("m_h_1"),
            timestamp: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ObserverEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn log_entry_builders() {
        let entry = LogEntry::server(TaskId::system(), LogLevel::Warning, "queue full")
            .with_details(serde_json::json!({"dropped": 3}))
            .with_context(serde_json::json!({"service": "broadcaster"}));
        assert_eq!(entry.details["dropped"], 3);
        assert_eq!(entry.context["service"], "broadcaster");
        assert!(entry.task_id.is_system());
    }
}
