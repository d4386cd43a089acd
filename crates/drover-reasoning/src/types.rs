use serde::{Deserialize, Serialize};

use drover_core::ids::SubtaskId;
use drover_core::task::{Subtask, SubtaskStatus};

/// One step of a decomposition, as returned by the reasoning backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub id: String,
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SubtaskSpec {
    pub fn into_subtask(self) -> Subtask {
        Subtask {
            id: SubtaskId::from_raw(self.id),
            description: self.description,
            command: self.command,
            expected_output: self.expected_output,
            dependencies: self.dependencies.into_iter().map(SubtaskId::from_raw).collect(),
            attempts: Vec::new(),
            status: SubtaskStatus::Pending,
        }
    }
}

/// A decomposed request: ordered subtasks plus the declared execution order.
/// Execution is strictly sequential by index; `execution_order` and
/// `dependencies` are validated at decomposition time only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub original_prompt: String,
    pub subtasks: Vec<SubtaskSpec>,
    #[serde(default)]
    pub execution_order: Vec<String>,
}

impl TaskPlan {
    pub fn into_subtasks(self) -> Vec<Subtask> {
        self.subtasks.into_iter().map(SubtaskSpec::into_subtask).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_model_json() {
        let json = r#"{
            "original_prompt": "is docker installed",
            "subtasks": [
                {
                    "id": "step_1",
                    "description": "Check docker in PATH",
                    "command": "command -v docker",
                    "expected_output": "a path, or nothing if absent",
                    "dependencies": []
                },
                {
                    "id": "step_2",
                    "description": "Package manager check",
                    "command": "dpkg -s docker.io",
                    "expected_output": "install status",
                    "dependencies": ["step_1"]
                }
            ],
            "execution_order": ["step_1", "step_2"]
        }"#;
        let plan: TaskPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.execution_order, vec!["step_1", "step_2"]);
    }

    #[test]
    fn spec_converts_to_subtask() {
        let spec = SubtaskSpec {
            id: "step_1".into(),
            description: "whoami".into(),
            command: "whoami".into(),
            expected_output: "a username".into(),
            dependencies: vec!["step_0".into()],
        };
        let subtask = spec.into_subtask();
        assert_eq!(subtask.id.as_str(), "step_1");
        assert_eq!(subtask.status, SubtaskStatus::Pending);
        assert!(subtask.attempts.is_empty());
        assert_eq!(subtask.dependencies[0].as_str(), "step_0");
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{"subtasks":[{"id":"s","description":"d","command":"ls"}]}"#;
        let plan: TaskPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.subtasks[0].expected_output, "");
        assert!(plan.subtasks[0].dependencies.is_empty());
        assert!(plan.execution_order.is_empty());
    }
}
