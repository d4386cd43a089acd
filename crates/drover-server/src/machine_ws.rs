//! Machine-side WebSocket endpoint.
//!
//! Each connected agent gets an independent read loop; frames are decoded
//! into the closed `MachineMessage` enum and dispatched exhaustively.
//! Undecodable or unroutable frames are logged and dropped, never allowed
//! to take down the loop.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use drover_core::events::{LogLevel, ObserverEvent};
use drover_core::ids::{IdentityId, TaskId};
use drover_core::machine::{MachineId, SystemInfo};
use drover_core::protocol::MachineMessage;
use drover_engine::RawResult;

use crate::auth::{CLOSE_INVALID_MACHINE, CLOSE_INVALID_TOKEN};
use crate::server::AppState;

#[derive(Deserialize)]
pub struct MachineQuery {
    token: String,
    machine_id: String,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<MachineQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, query: MachineQuery, state: AppState) {
    // Handshake: no state is created before both checks pass.
    let Some(identity) = state.tokens.verify(&query.token) else {
        info!("machine handshake rejected: invalid token");
        close_with(socket, CLOSE_INVALID_TOKEN, "invalid access token").await;
        return;
    };

    let machine_id = MachineId::from_raw(query.machine_id);
    if !machine_id.is_well_formed() {
        info!(machine_id = %machine_id, "machine handshake rejected: malformed id");
        close_with(socket, CLOSE_INVALID_MACHINE, "malformed machine id").await;
        return;
    }

    // Auto-registration: first connection creates the machine record,
    // reconnection refreshes it.
    if let Err(e) = state.machines.upsert(&machine_id, &SystemInfo::default()) {
        error!(machine_id = %machine_id, error = %e, "machine registration failed");
        close_with(socket, CLOSE_INVALID_MACHINE, "machine registration failed").await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<String>(state.max_send_queue);
    state.registry.register_machine(&machine_id, tx.clone());
    state.broadcaster.log_server_event(
        &TaskId::system(),
        LogLevel::Debug,
        &format!("machine {machine_id} connected"),
        json!({"machine_id": machine_id, "identity": identity}),
        json!({"service": "websocket"}),
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader: decode and dispatch inbound frames until the transport closes.
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => {
                handle_message(&state, &identity, &machine_id, text.as_str()).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.registry.unregister_machine(&machine_id, &tx);
    // A superseded loop must not mark the machine offline under its
    // successor's live connection.
    if !state.registry.machine_connected(&machine_id) {
        if let Err(e) = state.machines.set_active(&machine_id, false) {
            warn!(machine_id = %machine_id, error = %e, "failed to mark machine inactive");
        }
    }
    info!(machine_id = %machine_id, "machine loop ended");
}

async fn handle_message(state: &AppState, identity: &IdentityId, machine_id: &MachineId, text: &str) {
    let message: MachineMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(machine_id = %machine_id, error = %e, "undecodable machine frame dropped");
            return;
        }
    };

    match message {
        MachineMessage::CommandResult {
            task_id,
            subtask_id,
            command,
            output,
            exit_code,
            attempt_number,
            execution_time: _,
        } => {
            let result = RawResult {
                task_id,
                subtask_id,
                command,
                output,
                exit_code,
                attempt_number,
            };
            if let Err(e) = state.dispatcher.handle_result(result).await {
                // Recoverable conditions are absorbed inside the dispatcher;
                // what reaches here is a store/reasoning outage.
                error!(machine_id = %machine_id, error = %e, "failed to resolve command result");
            }
        }

        MachineMessage::Heartbeat { timestamp: _ } => {
            if let Err(e) = state.machines.touch(machine_id) {
                warn!(machine_id = %machine_id, error = %e, "heartbeat touch failed");
            }
        }

        MachineMessage::Ping => {
            // Bare liveness probe; refreshes last_seen like a heartbeat.
            let _ = state.machines.touch(machine_id);
        }

        MachineMessage::SystemInfoUpdate { system_info } => {
            if let Err(e) = state.machines.update_system_info(machine_id, &system_info) {
                warn!(machine_id = %machine_id, error = %e, "system info update failed");
            }
        }

        MachineMessage::LiveOutput {
            task_id,
            subtask_id,
            attempt_number,
            stream,
            data,
        } => {
            forward(
                state,
                identity,
                ObserverEvent::LiveOutput {
                    task_id,
                    subtask_id,
                    attempt_number,
                    stream,
                    data,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::InteractivePrompt { task_id, data } => {
            forward(
                state,
                identity,
                ObserverEvent::InteractivePrompt {
                    task_id,
                    data,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::WaitingForInput { task_id } => {
            forward(
                state,
                identity,
                ObserverEvent::WaitingForInput {
                    task_id,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::ProcessHealthUpdate {
            task_id,
            health_status,
            metrics,
        } => {
            forward(
                state,
                identity,
                ObserverEvent::ProcessHealthUpdate {
                    task_id,
                    health_status,
                    metrics,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::AlternativeCommandTriggered {
            task_id,
            original_command,
            alternative_command,
            reason,
            attempt_number,
        } => {
            state.broadcaster.log_server_event(
                &task_id,
                LogLevel::Warning,
                &format!("executing alternative command (attempt {attempt_number})"),
                json!({
                    "original_command": original_command,
                    "alternative_command": alternative_command,
                    "reason": reason,
                }),
                json!({"machine_id": machine_id}),
            );
            forward(
                state,
                identity,
                ObserverEvent::AlternativeCommandTriggered {
                    task_id,
                    original_command,
                    alternative_command,
                    reason,
                    attempt_number,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::AlternativeCommandResult {
            task_id,
            command,
            stdout,
            stderr,
            exit_code,
            attempt_number,
        } => {
            forward(
                state,
                identity,
                ObserverEvent::AlternativeCommandResult {
                    task_id,
                    command,
                    stdout,
                    stderr,
                    exit_code,
                    attempt_number,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::AiSummaryUpdate { task_id, ai_summary } => {
            // Agent-produced summaries are persisted onto the task record
            // before fan-out.
            match state.dispatcher.lifecycle().repo().get(&task_id) {
                Ok(mut task) => {
                    if let Err(e) = state.dispatcher.lifecycle().set_summary(&mut task, &ai_summary)
                    {
                        warn!(task_id = %task_id, error = %e, "failed to persist agent summary");
                    }
                }
                Err(e) => debug!(task_id = %task_id, error = %e, "summary for unknown task"),
            }
            forward(
                state,
                identity,
                ObserverEvent::AiSummaryUpdate {
                    task_id,
                    ai_summary,
                    machine_id: machine_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                },
            );
        }

        MachineMessage::ClientLog {
            task_id,
            level,
            message,
            logger,
            context,
            timestamp,
        } => {
            state.broadcaster.log_server_event(
                &task_id,
                LogLevel::Debug,
                &format!("[agent] {message}"),
                json!({"logger": logger, "source": "agent"}),
                json!({"machine_id": machine_id}),
            );
            forward(
                state,
                identity,
                ObserverEvent::ClientLog {
                    task_id,
                    level,
                    message,
                    logger,
                    context,
                    machine_id: machine_id.clone(),
                    timestamp: timestamp.unwrap_or_else(|| Utc::now().to_rfc3339()),
                },
            );
        }

        MachineMessage::UserInput { task_id, .. } => {
            // Input flows observer -> machine; the reverse direction carries
            // no action.
            debug!(machine_id = %machine_id, task_id = %task_id, "ignoring user_input from machine");
        }
    }
}

/// Append to the task transcript and push to the owning identity's live
/// observer connections.
fn forward(state: &AppState, identity: &IdentityId, event: ObserverEvent) {
    state.registry.broadcast_to_observers(identity, &event);
    state.broadcaster.publish(event);
}
