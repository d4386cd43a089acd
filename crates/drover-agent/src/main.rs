mod client;
mod executor;
mod identity;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use client::{Agent, AgentConfig};

/// Remote execution agent: connects to a drover server, runs the commands
/// it is sent, and reports results and heartbeats.
#[derive(Parser)]
#[command(name = "drover-agent", version)]
struct Args {
    /// Server URL (http/https/ws/wss).
    #[arg(long, env = "DROVER_SERVER_URL", default_value = "ws://127.0.0.1:9090")]
    server_url: String,

    /// Access token for the machine handshake.
    #[arg(long, env = "DROVER_ACCESS_TOKEN")]
    token: String,

    /// Seconds between heartbeat messages.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Directory for the cached machine identity.
    #[arg(long)]
    state_dir: Option<PathBuf>,
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

    let state_dir = args.state_dir.unwrap_or_else(|| {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join(".drover-agent")
    });

    let agent = match Agent::new(AgentConfig {
        server_url: args.server_url,
        token: args.token,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        state_dir,
    }) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("failed to initialize agent: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(machine_id = %agent.machine_id(), "drover agent starting");
    agent.run().await;
}
