use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use drover_core::events::{LogEntry, LogLevel, ObserverEvent};
use drover_core::ids::TaskId;

const MAX_HISTORY_PER_TASK: usize = 500;
const REPLAY_ON_SUBSCRIBE: usize = 50;

/// Buffers task events and fans them out to subscribed observer transports.
///
/// History is a process-lifetime replay convenience (ring semantics, oldest
/// evicted first); the task store remains the system of record.
pub struct EventBroadcaster {
    history: DashMap<TaskId, VecDeque<ObserverEvent>>,
    subscribers: DashMap<TaskId, Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    max_history: usize,
    replay: usize,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_limits(MAX_HISTORY_PER_TASK, REPLAY_ON_SUBSCRIBE)
    }

    pub fn with_limits(max_history: usize, replay: usize) -> Self {
        Self {
            history: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            max_history,
            replay,
        }
    }

    /// Append an event to its task's history and forward it to every
    /// current subscriber of that task.
    pub fn publish(&self, event: ObserverEvent) {
        let task_id = event.task_id().cloned().unwrap_or_else(TaskId::system);

        {
            let mut ring = self.history.entry(task_id.clone()).or_default();
            ring.push_back(event.clone());
            while ring.len() > self.max_history {
                ring.pop_front();
            }
        }

        let Ok(json) = serde_json::to_string(&event) else {
            return;
        };
        if let Some(mut subs) = self.subscribers.get_mut(&task_id) {
            subs.retain(|sub| match sub.tx.try_send(json.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(task_id = %task_id, subscriber = sub.id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(task_id = %task_id, subscriber = sub.id, "evicting closed subscriber");
                    false
                }
            });
        }
    }

    /// Subscribe a transport to a task's events. The most recent history is
    /// replayed first (catch-up), then live events flow.
    pub fn subscribe(&self, task_id: &TaskId, tx: mpsc::Sender<String>) -> u64 {
        if let Some(ring) = self.history.get(task_id) {
            let skip = ring.len().saturating_sub(self.replay);
            for event in ring.iter().skip(skip) {
                if let Ok(json) = serde_json::to_string(event) {
                    let _ = tx.try_send(json);
                }
            }
        }

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(task_id.clone())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(task_id = %task_id, subscriber = id, "observer subscribed to task events");
        id
    }

    /// Idempotent unsubscribe.
    pub fn unsubscribe(&self, task_id: &TaskId, subscriber_id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(task_id) {
            subs.retain(|s| s.id != subscriber_id);
        }
    }

    /// Most recent `limit` events for a task.
    pub fn history(&self, task_id: &TaskId, limit: usize) -> Vec<ObserverEvent> {
        match self.history.get(task_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop a task's buffered history.
    pub fn clear(&self, task_id: &TaskId) {
        self.history.remove(task_id);
    }

    /// Record a server-side log line into the task transcript and forward
    /// it as a `server_log` event; mirrored to the process log.
    pub fn log_server_event(
        &self,
        task_id: &TaskId,
        level: LogLevel,
        message: &str,
        details: Value,
        context: Value,
    ) {
        let entry = LogEntry::server(task_id.clone(), level, message)
            .with_details(details)
            .with_context(context);

        match level {
            LogLevel::Debug => debug!(task_id = %task_id, "{message}"),
            LogLevel::Info => tracing::info!(task_id = %task_id, "{message}"),
            LogLevel::Warning => warn!(task_id = %task_id, "{message}"),
            LogLevel::Error => tracing::error!(task_id = %task_id, "{message}"),
        }

        self.publish(ObserverEvent::ServerLog { entry });
    }
}
