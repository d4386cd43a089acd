//! Salvaging structured results from free-form model text, and the
//! heuristics used when no JSON can be recovered.

use drover_core::task::Validation;

use crate::types::{SubtaskSpec, TaskPlan};

/// Slice out the first `{` through the last `}` of a model response.
/// Models wrap JSON in prose and markdown fences often enough that this is
/// the reliable path.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Commands whose non-zero exit codes routinely carry a valid answer
/// ("inactive", "not found", ...) rather than a failure.
const STATUS_COMMANDS: &[&str] = &[
    "systemctl is-active",
    "systemctl status",
    "ps aux | grep",
    "grep",
    "which",
    "dpkg",
    "test",
    "diff",
    "cmp",
    "find",
    "locate",
    "whereis",
    "ss",
    "netstat",
];

const STATUS_INDICATORS: &[&str] = &[
    "inactive", "active", "not found", "no process", "failed", "running", "stopped",
];

const CHECK_KEYWORDS: &[&str] = &["check", "verify", "list", "show"];

/// Heuristic validation used ONLY when the reasoning backend's response
/// cannot be parsed. The primary path trusts the parsed verdict.
pub fn fallback_validation(command: &str, output: &str, exit_code: i32) -> Validation {
    let command_lower = command.to_lowercase();
    let output_lower = output.to_lowercase();

    // Status probes answer the question even when they exit non-zero.
    let is_status_command = STATUS_COMMANDS.iter().any(|k| command_lower.contains(k));
    if is_status_command && exit_code != 0 {
        let meaningful = STATUS_INDICATORS.iter().any(|i| output_lower.contains(i))
            || !output.trim().is_empty();
        if meaningful {
            return Validation::valid(0.8);
        }
    }

    // Generic check/list commands: judge by output, not exit code.
    let is_general_check = CHECK_KEYWORDS.iter().any(|k| command_lower.contains(k));
    if is_general_check && exit_code != 0 && !output.trim().is_empty() {
        return Validation::valid(0.7);
    }

    if exit_code == 0 {
        Validation::valid(0.8)
    } else {
        Validation::invalid(0.3, "Command failed", true)
    }
}

/// Single-step plan used when decomposition output is unparsable: run the
/// request verbatim.
pub fn fallback_plan(prompt: &str) -> TaskPlan {
    let command = if prompt.trim().is_empty() {
        "echo 'No command specified'".to_owned()
    } else {
        prompt.to_owned()
    };
    TaskPlan {
        original_prompt: prompt.to_owned(),
        subtasks: vec![SubtaskSpec {
            id: "step_1".into(),
            description: format!("Execute: {prompt}"),
            command,
            expected_output: "Command executed successfully".into(),
            dependencies: vec![],
        }],
        execution_order: vec!["step_1".into()],
    }
}
