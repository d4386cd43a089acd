//! Agent connection loop: connect, announce, execute, report, reconnect.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use drover_core::ids::TaskId;
use drover_core::machine::MachineId;
use drover_core::protocol::{MachineMessage, ServerMessage};

use crate::executor;
use crate::identity;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const SEND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("identity error: {0}")]
    Identity(String),
}

pub struct AgentConfig {
    pub server_url: String,
    pub token: String,
    pub heartbeat_interval: Duration,
    pub state_dir: PathBuf,
}

pub struct Agent {
    config: AgentConfig,
    machine_id: MachineId,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let machine_id = identity::machine_identity(&config.state_dir)
            .map_err(|e| AgentError::Identity(e.to_string()))?;
        info!(machine_id = %machine_id, "agent identity loaded");
        Ok(Self { config, machine_id })
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// Run forever: each session lasts until the transport drops, then
    /// reconnect with capped exponential backoff.
    pub async fn run(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.connect_and_run().await {
                Ok(()) => {
                    info!("connection closed by server, reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(error = %e, delay_secs = backoff.as_secs(), "connection failed, retrying");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One connected session: announce identity and system facts, keep
    /// heartbeats flowing, execute commands as they arrive.
    async fn connect_and_run(&self) -> Result<(), AgentError> {
        let url = self.endpoint_url();
        info!(url = %redact_token(&url), "connecting");

        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| AgentError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        // Re-announcement on every connect: the server treats it as
        // supersession of any stale connection for this machine id.
        send(&tx, &MachineMessage::SystemInfoUpdate {
            system_info: identity::system_info(),
        });
        self.send_log(&tx, "info", "agent connected", json!({"action": "connection_established"}));

        let heartbeat_tx = tx.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                send(&heartbeat_tx, &MachineMessage::Heartbeat {
                    timestamp: Utc::now().to_rfc3339(),
                });
            }
        });

        let result = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.handle_server_message(&tx, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(AgentError::Transport(e.to_string())),
            }
        };

        heartbeat.abort();
        writer.abort();
        result
    }

    async fn handle_server_message(&self, tx: &mpsc::Sender<String>, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable server frame");
                return;
            }
        };

        match message {
            ServerMessage::ExecuteCommand {
                task_id,
                subtask_id,
                command,
                attempt_number,
            } => {
                self.send_log(
                    tx,
                    "info",
                    &format!("executing command (attempt {attempt_number}): {command}"),
                    json!({
                        "task_id": task_id,
                        "subtask_id": subtask_id,
                        "action": "command_start",
                    }),
                );

                let outcome = executor::run_shell(&command).await;

                if outcome.exit_code != 0 {
                    self.send_log(
                        tx,
                        "warning",
                        &format!("command exited {}: {command}", outcome.exit_code),
                        json!({"task_id": task_id, "action": "command_failed"}),
                    );
                }

                send(tx, &MachineMessage::CommandResult {
                    task_id,
                    subtask_id,
                    command,
                    output: outcome.output,
                    exit_code: outcome.exit_code,
                    attempt_number,
                    execution_time: Some(outcome.duration),
                });
            }

            ServerMessage::UserInput { task_id, input } => {
                // Accepted per the protocol contract; interactive stdin
                // plumbing is not wired into the executor.
                self.send_log(
                    tx,
                    "info",
                    &format!("received user input: {input}"),
                    json!({"task_id": task_id, "action": "user_input_received"}),
                );
            }
        }
    }

    fn send_log(&self, tx: &mpsc::Sender<String>, level: &str, message: &str, context: serde_json::Value) {
        send(tx, &MachineMessage::ClientLog {
            task_id: TaskId::system(),
            level: level.to_owned(),
            message: message.to_owned(),
            logger: "agent".to_owned(),
            context,
            timestamp: Some(Utc::now().to_rfc3339()),
        });
    }

    fn endpoint_url(&self) -> String {
        let base = self
            .config
            .server_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        let base = if base.starts_with("ws://") || base.starts_with("wss://") {
            base
        } else {
            format!("ws://{base}")
        };
        format!(
            "{}/ws/machine?token={}&machine_id={}",
            base.trim_end_matches('/'),
            self.config.token,
            self.machine_id
        )
    }
}

fn send(tx: &mpsc::Sender<String>, message: &MachineMessage) {
    if let Ok(json) = serde_json::to_string(message) {
        if tx.try_send(json).is_err() {
            warn!("outbound queue full or closed, dropping frame");
        }
    }
}

fn redact_token(url: &str) -> String {
    match url.split_once("token=") {
        Some((head, tail)) => {
            let rest = tail.split_once('&').map(|(_, r)| format!("&{r}")).unwrap_or_default();
            format!("{head}token=***{rest}")
        }
        None => url.to_owned(),
    }
}
