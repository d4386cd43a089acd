use async_trait::async_trait;

use drover_core::machine::SystemInfo;
use drover_core::task::{Subtask, Validation};

use crate::error::ReasoningError;
use crate::types::TaskPlan;

/// External reasoning collaborator: turns natural language into command
/// plans, judges execution output, and writes result summaries.
///
/// Implementations must absorb unparsable model output themselves (falling
/// back to heuristic results); an `Err` means the backend was unreachable.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Decompose a user request into an ordered command plan for the
    /// described host.
    async fn decompose(
        &self,
        prompt: &str,
        system_info: &SystemInfo,
    ) -> Result<TaskPlan, ReasoningError>;

    /// Judge one execution attempt against the subtask's expected output.
    async fn validate(
        &self,
        command: &str,
        output: &str,
        exit_code: i32,
        expected_output: &str,
    ) -> Result<Validation, ReasoningError>;

    /// Produce a 1-2 sentence answer to the original request from the final
    /// attempt outputs.
    async fn summarize(
        &self,
        request: &str,
        subtasks: &[Subtask],
        system_info: &SystemInfo,
    ) -> Result<String, ReasoningError>;
}
