//! Prompt templates for the reasoning backend.

use drover_core::machine::SystemInfo;
use drover_core::task::Subtask;

pub const SYSTEM_PROMPT: &str = "You are an expert Linux system administrator and command-line \
specialist. Your role is to break complex user requests into executable Linux commands and to \
validate their outputs. Always provide precise, safe commands, break complex tasks into logical \
sequential steps, and use JSON format for structured responses.";

pub fn decomposition(prompt: &str, info: &SystemInfo) -> String {
    format!(
        r#"{SYSTEM_PROMPT}

System Information:
- OS: {os}
- Architecture: {arch}
- Hostname: {hostname}

User Request: "{prompt}"

Break this request into Linux commands. Guidelines:
- For simple status checks use 1-2 commands maximum; combine related commands where possible.
- For "is X installed" / "is X running" questions, create up to 3 verification methods
  (PATH check, package manager check, direct execution / process / port check).
- Every command must be complete, self-contained, and executable as written.
- Use only safe, non-destructive commands unless explicitly requested.

Return a JSON response with this structure:
{{
    "original_prompt": "{prompt}",
    "subtasks": [
        {{
            "id": "step_1",
            "description": "what this step does and what success means",
            "command": "actual linux command to execute",
            "expected_output": "what output indicates success",
            "dependencies": []
        }}
    ],
    "execution_order": ["step_1"]
}}"#,
        os = or_unknown(&info.os),
        arch = or_unknown(&info.arch),
        hostname = or_unknown(&info.hostname),
    )
}

pub fn validation(command: &str, output: &str, exit_code: i32, expected_output: &str) -> String {
    format!(
        r#"{SYSTEM_PROMPT}

Command Executed: {command}
Exit Code: {exit_code}
Actual Output: {output}
Expected Output: {expected_output}

Validate this command execution and return a JSON response:
{{
    "is_valid": true/false,
    "confidence": 0.0-1.0,
    "error_message": "description if invalid",
    "suggested_fix": "ONLY an executable command, never instructions",
    "should_retry": true/false
}}

CRITICAL RULES FOR suggested_fix:
- MUST be a single executable command.
- NEVER include phrases like "run this command" or "try running".
- If no fix is possible, leave suggested_fix empty.

Status check commands are VALID regardless of exit code when they produce a
meaningful answer: "systemctl is-active X" printing "inactive" (exit 4),
"which X" printing "not found" (exit 1), and similar results successfully
answer the user's question. The goal is to answer the question, not to force
exit code 0."#
    )
}

pub fn summary(request: &str, subtasks: &[Subtask]) -> String {
    let mut outputs = String::new();
    for (i, subtask) in subtasks.iter().enumerate() {
        if let Some(last) = subtask.attempts.last() {
            outputs.push_str(&format!(
                "Step {}: {}\nCommand: {}\nOutput: {}\nExit Code: {}\n\n",
                i + 1,
                subtask.description,
                last.command,
                last.output.trim(),
                last.exit_code,
            ));
        }
    }

    format!(
        r#"You are an expert system administrator who combines command outputs into clear,
definitive conclusions.

USER QUESTION: "{request}"

COMMAND EXECUTION RESULTS:
{outputs}
Analyze the outputs together and answer the user's question directly.
Remember that a path from "command -v" means installed, and that "not
installed via package manager" does not contradict a manual install.
Answer in 1-2 sentences with your conclusion."#
    )
}

fn or_unknown(s: &str) -> &str {
    if s.is_empty() {
        "Unknown"
    } else {
        s
    }
}
