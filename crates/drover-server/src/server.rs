use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use drover_engine::{ConnectionRegistry, Dispatcher, EventBroadcaster};
use drover_reasoning::ReasoningService;
use drover_store::MachineRepo;

use crate::auth::AccessTokens;
use crate::{http, machine_ws, observer_ws};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub machines: Arc<MachineRepo>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub tokens: Arc<AccessTokens>,
    pub max_send_queue: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/machine", get(machine_ws::handler))
        .route("/ws/observer", get(observer_ws::handler))
        .route("/api/tasks", post(http::create_task).get(http::list_tasks))
        .route("/api/tasks/{id}", get(http::get_task).delete(http::cancel_task))
        .route("/api/tasks/{id}/status", get(http::task_status))
        .route("/api/tasks/{id}/summary", post(http::generate_summary))
        .route("/health", get(http::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "drover server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the server, but
/// holding it keeps the spawned task's join handle reachable.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::ids::IdentityId;
    use drover_core::machine::{MachineId, SystemInfo};
    use drover_engine::TaskLifecycle;
    use drover_reasoning::MockReasoning;
    use drover_store::{Database, TaskRepo};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;

    pub(crate) fn test_state(reasoning: MockReasoning) -> (AppState, IdentityId, MachineId) {
        let db = Database::in_memory().unwrap();
        let identity = IdentityId::from_raw("ident_test");
        let machine_id = MachineId::from_raw("aabb_box_12ab34cd");
        let machines = Arc::new(MachineRepo::new(db.clone()));
        machines.upsert(&machine_id, &SystemInfo::default()).unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let reasoning: Arc<dyn ReasoningService> = Arc::new(reasoning);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            TaskLifecycle::new(TaskRepo::new(db.clone())),
            MachineRepo::new(db),
            Arc::clone(&reasoning),
        ));

        let state = AppState {
            dispatcher,
            registry,
            broadcaster,
            machines,
            reasoning,
            tokens: Arc::new(AccessTokens::single("good-token", identity.clone())),
            max_send_queue: 64,
        };
        (state, identity, machine_id)
    }

    async fn start_test_server(reasoning: MockReasoning) -> (ServerHandle, IdentityId, MachineId) {
        let (state, identity, machine_id) = test_state(reasoning);
        let handle = start(ServerConfig { port: 0 }, state).await.unwrap();
        (handle, identity, machine_id)
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handle, _, _) = start_test_server(MockReasoning::new()).await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn machine_handshake_rejects_bad_token() {
        let (handle, _, machine_id) = start_test_server(MockReasoning::new()).await;
        let url = format!(
            "ws://127.0.0.1:{}/ws/machine?token=wrong&machine_id={}",
            handle.port, machine_id
        );

        let (mut ws, _) = connect_async(&url).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::from(crate::auth::CLOSE_INVALID_TOKEN));
            }
            other => panic!("expected close frame, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn machine_handshake_rejects_malformed_id() {
        let (handle, _, _) = start_test_server(MockReasoning::new()).await;
        let url = format!(
            "ws://127.0.0.1:{}/ws/machine?token=good-token&machine_id=nounderscores",
            handle.port
        );

        let (mut ws, _) = connect_async(&url).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::from(crate::auth::CLOSE_INVALID_MACHINE));
            }
            other => panic!("expected close frame, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn observer_handshake_rejects_bad_token() {
        let (handle, _, _) = start_test_server(MockReasoning::new()).await;
        let url = format!("ws://127.0.0.1:{}/ws/observer?token=nope", handle.port);

        let (mut ws, _) = connect_async(&url).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::from(crate::auth::CLOSE_INVALID_TOKEN));
            }
            other => panic!("expected close frame, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn observer_ping_gets_pong() {
        let (handle, _, _) = start_test_server(MockReasoning::new()).await;
        let url = format!("ws://127.0.0.1:{}/ws/observer?token=good-token", handle.port);

        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();

        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed["type"], "pong");
            }
            other => panic!("expected pong, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_to_end_task_over_websocket() {
        let (handle, _, machine_id) =
            start_test_server(MockReasoning::new().with_summary("you are root")).await;

        // Agent side: connect as the machine.
        let machine_url = format!(
            "ws://127.0.0.1:{}/ws/machine?token=good-token&machine_id={}",
            handle.port, machine_id
        );
        let (mut machine_ws, _) = connect_async(&machine_url).await.unwrap();

        // Registration happens on the server's socket task; wait for it.
        let client = reqwest::Client::new();
        for _ in 0..50 {
            let body: serde_json::Value = client
                .get(format!("http://127.0.0.1:{}/health", handle.port))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if body["machines_connected"] == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let resp = client
            .post(format!("http://127.0.0.1:{}/api/tasks", handle.port))
            .header("Authorization", "Bearer good-token")
            .json(&serde_json::json!({"prompt": "whoami", "machine_id": machine_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let task_id = body["task_id"].as_str().unwrap().to_owned();
        assert_eq!(body["status"], "running");
        assert_eq!(body["dispatched"], true);

        // The machine receives the first command...
        let command = loop {
            match machine_ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if parsed["type"] == "execute_command" {
                        break parsed;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("machine socket ended: {other:?}"),
            }
        };
        assert_eq!(command["command"], "whoami");
        assert_eq!(command["task_id"], task_id.as_str());

        // ...executes it and reports the result.
        let result = serde_json::json!({
            "type": "command_result",
            "task_id": command["task_id"],
            "subtask_id": command["subtask_id"],
            "command": "whoami",
            "output": "root\n",
            "exit_code": 0,
            "attempt_number": 1
        });
        machine_ws.send(Message::Text(result.to_string().into())).await.unwrap();

        // Poll the REST status until the dispatch loop settles.
        let status_url = format!(
            "http://127.0.0.1:{}/api/tasks/{}/status",
            handle.port, task_id
        );
        let mut status = String::new();
        for _ in 0..50 {
            let resp = client
                .get(&status_url)
                .header("Authorization", "Bearer good-token")
                .send()
                .await
                .unwrap();
            let body: serde_json::Value = resp.json().await.unwrap();
            status = body["status"].as_str().unwrap_or_default().to_owned();
            if status == "completed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status, "completed");

        // Full task record carries the attempt and the summary.
        let resp = client
            .get(format!("http://127.0.0.1:{}/api/tasks/{}", handle.port, task_id))
            .header("Authorization", "Bearer good-token")
            .send()
            .await
            .unwrap();
        let task: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(task["summary"], "you are root");
        assert_eq!(task["subtasks"][0]["attempts"][0]["exit_code"], 0);
    }

    #[tokio::test]
    async fn create_list_and_cancel_task() {
        let (handle, _, machine_id) = start_test_server(MockReasoning::new()).await;
        let client = reqwest::Client::new();

        // No live machine connection: creation succeeds, dispatch does not.
        let resp = client
            .post(format!("http://127.0.0.1:{}/api/tasks", handle.port))
            .header("Authorization", "Bearer good-token")
            .json(&serde_json::json!({"prompt": "uptime", "machine_id": machine_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["dispatched"], false, "no live machine connection");
        let task_id = body["task_id"].as_str().unwrap().to_owned();

        let resp = client
            .get(format!("http://127.0.0.1:{}/api/tasks", handle.port))
            .header("Authorization", "Bearer good-token")
            .send()
            .await
            .unwrap();
        let list: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["task_id"], task_id.as_str());
        assert_eq!(list[0]["status"], "running");

        let resp = client
            .delete(format!("http://127.0.0.1:{}/api/tasks/{}", handle.port, task_id))
            .header("Authorization", "Bearer good-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // Cancelling again is rejected: the task is terminal.
        let resp = client
            .delete(format!("http://127.0.0.1:{}/api/tasks/{}", handle.port, task_id))
            .header("Authorization", "Bearer good-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn summary_endpoint_requires_finished_task() {
        let (handle, _, machine_id) = start_test_server(MockReasoning::new()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://127.0.0.1:{}/api/tasks", handle.port))
            .header("Authorization", "Bearer good-token")
            .json(&serde_json::json!({"prompt": "uptime", "machine_id": machine_id}))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        let task_id = body["task_id"].as_str().unwrap().to_owned();

        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/tasks/{}/summary",
                handle.port, task_id
            ))
            .header("Authorization", "Bearer good-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "running task cannot be summarized");
    }

    #[tokio::test]
    async fn rest_rejects_missing_bearer() {
        let (handle, _, _) = start_test_server(MockReasoning::new()).await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://127.0.0.1:{}/api/tasks", handle.port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn create_task_unknown_machine_is_404() {
        let (handle, _, _) = start_test_server(MockReasoning::new()).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{}/api/tasks", handle.port))
            .header("Authorization", "Bearer good-token")
            .json(&serde_json::json!({"prompt": "whoami", "machine_id": "zzzz_ghost_00000000"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
