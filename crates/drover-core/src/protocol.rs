//! Wire protocol for the machine and observer transports.
//!
//! One closed enum per direction, discriminated by a `type` tag, so adding a
//! message is a compile-time-checked change and dispatch is an exhaustive
//! match rather than string lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{SubtaskId, TaskId};
use crate::machine::{MachineId, SystemInfo};

/// Messages a remote agent sends to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MachineMessage {
    CommandResult {
        task_id: TaskId,
        subtask_id: SubtaskId,
        command: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        exit_code: i32,
        #[serde(default = "default_attempt")]
        attempt_number: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_time: Option<f64>,
    },
    Heartbeat {
        timestamp: String,
    },
    SystemInfoUpdate {
        system_info: SystemInfo,
    },
    LiveOutput {
        task_id: TaskId,
        subtask_id: SubtaskId,
        attempt_number: u32,
        /// "stdout" or "stderr".
        stream: String,
        data: String,
    },
    InteractivePrompt {
        task_id: TaskId,
        data: Value,
    },
    WaitingForInput {
        task_id: TaskId,
    },
    ProcessHealthUpdate {
        task_id: TaskId,
        health_status: String,
        #[serde(default)]
        metrics: Value,
    },
    AlternativeCommandTriggered {
        task_id: TaskId,
        original_command: String,
        alternative_command: String,
        reason: String,
        attempt_number: u32,
    },
    AlternativeCommandResult {
        task_id: TaskId,
        command: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        exit_code: i32,
        attempt_number: u32,
    },
    AiSummaryUpdate {
        task_id: TaskId,
        ai_summary: String,
    },
    ClientLog {
        #[serde(default = "TaskId::system")]
        task_id: TaskId,
        #[serde(default = "default_level")]
        level: String,
        message: String,
        #[serde(default = "default_logger")]
        logger: String,
        #[serde(default)]
        context: Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
    UserInput {
        task_id: TaskId,
        input: String,
    },
    Ping,
}

fn default_attempt() -> u32 {
    1
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_logger() -> String {
    "client".to_owned()
}

/// Messages the server sends to a remote agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ExecuteCommand {
        task_id: TaskId,
        subtask_id: SubtaskId,
        command: String,
        attempt_number: u32,
    },
    UserInput {
        task_id: TaskId,
        input: String,
    },
}

/// Messages an observer dashboard sends to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverRequest {
    Ping,
    UserInput {
        task_id: TaskId,
        machine_id: MachineId,
        #[serde(default)]
        input: String,
    },
    SubscribeToLogs {
        task_id: TaskId,
    },
}
