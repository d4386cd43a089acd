use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use drover_engine::{ConnectionRegistry, Dispatcher, EventBroadcaster, TaskLifecycle};
use drover_reasoning::{GeminiReasoning, ReasoningService};
use drover_server::{AccessTokens, AppState, ServerConfig};
use drover_store::{Database, MachineRepo, TaskRepo};

/// Remote task-execution orchestration server.
#[derive(Parser)]
#[command(name = "drover", version)]
struct Args {
    /// Listen port.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// State directory (database lives here). Defaults to ~/.drover.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Reasoning backend API key.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: String,

    /// Reasoning model name.
    #[arg(long)]
    gemini_model: Option<String>,

    /// Access tokens as token=identity pairs (comma separated).
    #[arg(long = "access-token", env = "DROVER_ACCESS_TOKENS", value_delimiter = ',')]
    access_tokens: Vec<String>,

    /// Per-connection outbound queue size.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let tokens = AccessTokens::parse(&args.access_tokens);
    if tokens.is_empty() {
        eprintln!("no access tokens configured; pass --access-token token=identity");
        std::process::exit(1);
    }

    let state_dir = args.state_dir.unwrap_or_else(|| {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join(".drover")
    });
    let db_path = state_dir.join("drover.db");
    let db = Database::open(&db_path).expect("failed to open task store");

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let reasoning: Arc<dyn ReasoningService> = Arc::new(GeminiReasoning::new(
        args.gemini_api_key,
        args.gemini_model.as_deref(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
        TaskLifecycle::new(TaskRepo::new(db.clone())),
        MachineRepo::new(db.clone()),
        Arc::clone(&reasoning),
    ));

    let state = AppState {
        dispatcher,
        registry,
        broadcaster,
        machines: Arc::new(MachineRepo::new(db)),
        reasoning,
        tokens: Arc::new(tokens),
        max_send_queue: args.max_send_queue,
    };

    let handle = drover_server::start(ServerConfig { port: args.port }, state)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "drover server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}
