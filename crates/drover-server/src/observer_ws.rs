//! Observer-side WebSocket endpoint: dashboards watching tasks live.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use drover_core::events::ObserverEvent;
use drover_core::ids::TaskId;
use drover_core::protocol::{ObserverRequest, ServerMessage};

use crate::auth::CLOSE_INVALID_TOKEN;
use crate::server::AppState;

#[derive(Deserialize)]
pub struct ObserverQuery {
    token: String,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ObserverQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(mut socket: WebSocket, query: ObserverQuery, state: AppState) {
    let Some(identity) = state.tokens.verify(&query.token) else {
        info!("observer handshake rejected: invalid token");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_INVALID_TOKEN,
                reason: "invalid access token".into(),
            })))
            .await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<String>(state.max_send_queue);
    let observer_id = state.registry.register_observer(&identity, tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Broadcaster subscriptions created by this connection, for teardown.
    let mut subscriptions: Vec<(TaskId, u64)> = Vec::new();

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => {
                let request: ObserverRequest = match serde_json::from_str(text.as_str()) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "undecodable observer frame dropped");
                        continue;
                    }
                };

                match request {
                    ObserverRequest::Ping => {
                        if let Ok(pong) = serde_json::to_string(&ObserverEvent::Pong) {
                            let _ = tx.try_send(pong);
                        }
                    }
                    ObserverRequest::UserInput {
                        task_id,
                        machine_id,
                        input,
                    } => {
                        let delivered = state.registry.send_to_machine(
                            &machine_id,
                            &ServerMessage::UserInput { task_id, input },
                        );
                        debug!(machine_id = %machine_id, delivered, "forwarded user input");
                    }
                    ObserverRequest::SubscribeToLogs { task_id } => {
                        let sub_id = state.broadcaster.subscribe(&task_id, tx.clone());
                        subscriptions.push((task_id, sub_id));
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    for (task_id, sub_id) in subscriptions {
        state.broadcaster.unsubscribe(&task_id, sub_id);
    }
    state.registry.unregister_observer(&identity, observer_id);
    info!(identity = %identity, "observer loop ended");
}
