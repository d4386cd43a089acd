use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use drover_core::machine::SystemInfo;
use drover_core::task::{Subtask, Validation};

use crate::error::ReasoningError;
use crate::extract;
use crate::service::ReasoningService;
use crate::types::TaskPlan;

/// Scripted reasoning backend for deterministic tests without API calls.
///
/// Validations are consumed in sequence; once the script is exhausted every
/// further attempt validates as correct. With no plan configured,
/// decomposition returns the single-step fallback plan.
pub struct MockReasoning {
    plan: Mutex<Option<TaskPlan>>,
    validations: Mutex<VecDeque<Validation>>,
    summary: String,
    unreachable: bool,
    fail_summarize: bool,
    decompose_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
}

impl Default for MockReasoning {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReasoning {
    pub fn new() -> Self {
        Self {
            plan: Mutex::new(None),
            validations: Mutex::new(VecDeque::new()),
            summary: "Task completed successfully.".to_owned(),
            unreachable: false,
            fail_summarize: false,
            decompose_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
            summarize_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_plan(self, plan: TaskPlan) -> Self {
        *self.plan.lock().unwrap() = Some(plan);
        self
    }

    pub fn with_validations(self, validations: Vec<Validation>) -> Self {
        *self.validations.lock().unwrap() = validations.into();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Every call fails as if the backend were down.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new()
        }
    }

    /// Only summarize fails; decompose and validate stay reachable.
    pub fn with_failing_summary(mut self) -> Self {
        self.fail_summarize = true;
        self
    }

    pub fn decompose_calls(&self) -> usize {
        self.decompose_calls.load(Ordering::Relaxed)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::Relaxed)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::Relaxed)
    }

    fn check_reachable(&self) -> Result<(), ReasoningError> {
        if self.unreachable {
            Err(ReasoningError::Http("mock backend unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReasoningService for MockReasoning {
    async fn decompose(
        &self,
        prompt: &str,
        _system_info: &SystemInfo,
    ) -> Result<TaskPlan, ReasoningError> {
        self.decompose_calls.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;
        Ok(self
            .plan
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| extract::fallback_plan(prompt)))
    }

    async fn validate(
        &self,
        _command: &str,
        _output: &str,
        _exit_code: i32,
        _expected_output: &str,
    ) -> Result<Validation, ReasoningError> {
        self.validate_calls.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;
        Ok(self
            .validations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Validation::valid(0.9)))
    }

    async fn summarize(
        &self,
        _request: &str,
        _subtasks: &[Subtask],
        _system_info: &SystemInfo,
    ) -> Result<String, ReasoningError> {
        self.summarize_calls.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;
        if self.fail_summarize {
            return Err(ReasoningError::EmptyResponse);
        }
        Ok(self.summary.clone())
    }
}
