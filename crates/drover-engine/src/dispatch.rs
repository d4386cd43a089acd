use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use drover_core::events::{LogEntry, LogLevel, ObserverEvent};
use drover_core::ids::{IdentityId, SubtaskId, TaskId};
use drover_core::machine::SystemInfo;
use drover_core::protocol::ServerMessage;
use drover_core::task::{Attempt, Task, TaskStatus, Validation, MAX_ATTEMPTS};
use drover_reasoning::ReasoningService;
use drover_store::{MachineRepo, StoreError};

use crate::broadcast::EventBroadcaster;
use crate::command_check::is_executable_command;
use crate::error::EngineError;
use crate::lifecycle::{Advance, TaskLifecycle};
use crate::registry::ConnectionRegistry;

/// A raw execution result reported by a machine, before validation.
#[derive(Clone, Debug)]
pub struct RawResult {
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub command: String,
    pub output: String,
    pub exit_code: i32,
    pub attempt_number: u32,
}

/// Drives one validate-and-decide round per reported attempt.
///
/// Composes the registry, lifecycle, broadcaster, and reasoning backend.
/// Per-task mutations run under a per-task async lock so that at most one
/// attempt is resolved at a time; stale and duplicate results are discarded
/// by identifier comparison before any state changes.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    lifecycle: TaskLifecycle,
    machines: MachineRepo,
    reasoning: Arc<dyn ReasoningService>,
    task_locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        lifecycle: TaskLifecycle,
        machines: MachineRepo,
        reasoning: Arc<dyn ReasoningService>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            lifecycle,
            machines,
            reasoning,
            task_locks: DashMap::new(),
        }
    }

    pub fn lifecycle(&self) -> &TaskLifecycle {
        &self.lifecycle
    }

    fn task_lock(&self, task_id: &TaskId) -> Arc<Mutex<()>> {
        self.task_locks
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Publish to the task's event history and the owning identity's live
    /// observer connections.
    fn emit(&self, identity: &IdentityId, event: ObserverEvent) {
        self.registry.broadcast_to_observers(identity, &event);
        self.broadcaster.publish(event);
    }

    fn send_execute(
        &self,
        task: &Task,
        subtask_id: &SubtaskId,
        command: &str,
        attempt_number: u32,
    ) -> bool {
        let delivered = self.registry.send_to_machine(
            &task.machine_id,
            &ServerMessage::ExecuteCommand {
                task_id: task.id.clone(),
                subtask_id: subtask_id.clone(),
                command: command.to_owned(),
                attempt_number,
            },
        );
        if !delivered {
            // The machine may simply be offline; state stays server-side and
            // the command is re-issued at the next transition or reconnect.
            self.broadcaster.log_server_event(
                &task.id,
                LogLevel::Warning,
                "command not delivered, machine offline",
                json!({"subtask_id": subtask_id, "attempt_number": attempt_number}),
                json!({"machine_id": task.machine_id}),
            );
        }
        delivered
    }

    /// Transition a pending task to running and dispatch its first command.
    /// Returns whether the command reached a live machine connection; `false`
    /// still leaves the task running, awaiting reconnect or cancellation.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn start_task(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut task = self.lifecycle.repo().get(task_id)?;
        self.lifecycle.mark_running(&mut task)?;

        self.emit(
            &task.identity_id,
            ObserverEvent::TaskStarted {
                task_id: task.id.clone(),
                machine_id: task.machine_id.clone(),
            },
        );

        Ok(self.dispatch_current_locked(&task))
    }

    /// Re-issue the current subtask's command, e.g. after the machine
    /// reconnected. No-op (false) unless the task is running.
    pub async fn dispatch_current(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.lifecycle.repo().get(task_id)?;
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        Ok(self.dispatch_current_locked(&task))
    }

    fn dispatch_current_locked(&self, task: &Task) -> bool {
        match task.current_subtask() {
            Some(subtask) => {
                self.send_execute(task, &subtask.id, &subtask.command, subtask.next_attempt_number())
            }
            None => false,
        }
    }

    /// Resolve one reported attempt: validate, record, then advance, retry,
    /// or fail. Unroutable results (unknown task, terminal task, stale
    /// subtask, duplicate attempt) are discarded without state change.
    #[instrument(skip(self, result), fields(task_id = %result.task_id, subtask_id = %result.subtask_id, attempt = result.attempt_number))]
    pub async fn handle_result(&self, result: RawResult) -> Result<(), EngineError> {
        let lock = self.task_lock(&result.task_id);
        let _guard = lock.lock().await;

        let mut task = match self.lifecycle.repo().get(&result.task_id) {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                debug!("result for unknown task discarded");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if task.is_terminal() {
            self.broadcaster.log_server_event(
                &task.id,
                LogLevel::Debug,
                "late result for terminal task discarded",
                json!({"subtask_id": result.subtask_id, "attempt_number": result.attempt_number}),
                json!({"status": task.status.to_string()}),
            );
            return Ok(());
        }

        if !task.is_current_subtask(&result.subtask_id) {
            debug!("result for non-current subtask discarded");
            return Ok(());
        }

        let current = task
            .current_subtask()
            .ok_or_else(|| EngineError::Internal("running task without current subtask".into()))?;
        if result.attempt_number != current.next_attempt_number() {
            debug!(expected = current.next_attempt_number(), "duplicate or out-of-order attempt discarded");
            return Ok(());
        }
        let expected_output = current.expected_output.clone();

        self.broadcaster.log_server_event(
            &task.id,
            LogLevel::Info,
            &format!("command result received: {}", result.command),
            json!({
                "exit_code": result.exit_code,
                "output_length": result.output.len(),
                "attempt_number": result.attempt_number,
            }),
            json!({"machine_id": task.machine_id, "subtask_id": result.subtask_id}),
        );

        let validation = match self
            .reasoning
            .validate(&result.command, &result.output, result.exit_code, &expected_output)
            .await
        {
            Ok(validation) => validation,
            Err(e) => {
                // Reasoning unreachable: surface a failure event and leave
                // the task in its last non-terminal state for operator retry.
                self.emit(
                    &task.identity_id,
                    ObserverEvent::ServerLog {
                        entry: LogEntry::server(
                            task.id.clone(),
                            LogLevel::Error,
                            "validation unavailable, attempt not judged",
                        )
                        .with_details(json!({"error": e.to_string()}))
                        .with_context(json!({"service": "reasoning"})),
                    },
                );
                return Err(e.into());
            }
        };

        let attempt = Attempt::new(
            result.attempt_number,
            &result.command,
            &result.output,
            result.exit_code,
            validation.clone(),
        );
        self.lifecycle
            .record_attempt(&mut task, &result.subtask_id, attempt.clone())?;

        self.broadcaster.log_server_event(
            &task.id,
            if validation.is_valid { LogLevel::Info } else { LogLevel::Warning },
            &format!(
                "command validation {}",
                if validation.is_valid { "passed" } else { "failed" }
            ),
            json!({"validation": validation, "command": result.command}),
            json!({"service": "validator", "subtask_id": result.subtask_id}),
        );

        if validation.is_valid {
            match self.lifecycle.advance(&mut task)? {
                Advance::Completed => {
                    self.finish_task(&mut task).await;
                    self.emit(
                        &task.identity_id,
                        ObserverEvent::TaskUpdate {
                            task_id: task.id.clone(),
                            subtask_id: result.subtask_id,
                            status: task.status,
                            attempt,
                            validation,
                        },
                    );
                    self.task_locks.remove(&task.id);
                }
                Advance::Next { subtask_id, command } => {
                    self.emit(
                        &task.identity_id,
                        ObserverEvent::TaskUpdate {
                            task_id: task.id.clone(),
                            subtask_id: result.subtask_id,
                            status: task.status,
                            attempt,
                            validation,
                        },
                    );
                    self.send_execute(&task, &subtask_id, &command, 1);
                }
            }
        } else if result.attempt_number < MAX_ATTEMPTS && validation.should_retry {
            let next_command = self.select_retry_command(&task.id, &result.command, &validation);
            self.emit(
                &task.identity_id,
                ObserverEvent::TaskUpdate {
                    task_id: task.id.clone(),
                    subtask_id: result.subtask_id.clone(),
                    status: task.status,
                    attempt,
                    validation,
                },
            );
            self.send_execute(&task, &result.subtask_id, &next_command, result.attempt_number + 1);
        } else {
            let reason = if validation.error_message.is_empty() {
                "maximum attempts exhausted".to_owned()
            } else {
                validation.error_message.clone()
            };
            self.lifecycle.fail(&mut task, &reason)?;
            self.emit(
                &task.identity_id,
                ObserverEvent::TaskUpdate {
                    task_id: task.id.clone(),
                    subtask_id: result.subtask_id,
                    status: task.status,
                    attempt,
                    validation,
                },
            );
            self.task_locks.remove(&task.id);
        }

        Ok(())
    }

    /// Prefer the suggested substitute, but only if it passes the
    /// executable-command check; otherwise reuse the command just attempted.
    fn select_retry_command(
        &self,
        task_id: &TaskId,
        attempted: &str,
        validation: &Validation,
    ) -> String {
        let fix = validation.suggested_fix.trim();
        if fix.is_empty() {
            return attempted.to_owned();
        }
        if is_executable_command(fix) {
            return fix.to_owned();
        }
        self.broadcaster.log_server_event(
            task_id,
            LogLevel::Warning,
            "suggested substitute is not an executable command, using original",
            json!({"suggested_fix": fix}),
            json!({"service": "validator"}),
        );
        attempted.to_owned()
    }

    async fn finish_task(&self, task: &mut Task) {
        let system_info = self
            .machines
            .get(&task.machine_id)
            .map(|m| SystemInfo {
                os: m.os,
                arch: m.arch,
                hostname: m.hostname,
            })
            .unwrap_or_default();

        let summary = match self
            .reasoning
            .summarize(&task.request, &task.subtasks, &system_info)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "summary generation failed");
                "Task completed successfully.".to_owned()
            }
        };

        if let Err(e) = self.lifecycle.set_summary(task, &summary) {
            warn!(task_id = %task.id, error = %e, "failed to persist summary");
        }

        self.emit(
            &task.identity_id,
            ObserverEvent::AiSummaryUpdate {
                task_id: task.id.clone(),
                ai_summary: summary,
                machine_id: task.machine_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
            },
        );
    }

    /// Cancel a task on behalf of its owner. Terminal tasks are rejected
    /// (false); a cancelled task ignores all later results.
    pub async fn cancel(&self, task_id: &TaskId, identity: &IdentityId) -> Result<bool, EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let cancelled = self.lifecycle.cancel(task_id, identity)?;
        if cancelled {
            self.broadcaster.log_server_event(
                task_id,
                LogLevel::Info,
                "task cancelled",
                serde_json::Value::Null,
                json!({"identity": identity}),
            );
            self.task_locks.remove(task_id);
        }
        Ok(cancelled)
    }

    /// Regenerate and broadcast the summary of a finished task.
    pub async fn regenerate_summary(
        &self,
        task_id: &TaskId,
        identity: &IdentityId,
    ) -> Result<String, EngineError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut task = self.lifecycle.repo().get_for_identity(task_id, identity)?;
        if !task.is_terminal() {
            return Err(EngineError::Internal(
                "task must be finished before summarizing".into(),
            ));
        }

        let system_info = self
            .machines
            .get(&task.machine_id)
            .map(|m| SystemInfo {
                os: m.os,
                arch: m.arch,
                hostname: m.hostname,
            })
            .unwrap_or_default();

        let summary = self
            .reasoning
            .summarize(&task.request, &task.subtasks, &system_info)
            .await?;
        self.lifecycle.set_summary(&mut task, &summary)?;

        self.emit(
            identity,
            ObserverEvent::AiSummaryUpdate {
                task_id: task.id.clone(),
                ai_summary: summary.clone(),
                machine_id: task.machine_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
            },
        );
        Ok(summary)
    }
}
