pub mod auth;
pub mod http;
pub mod machine_ws;
pub mod observer_ws;
pub mod server;

pub use auth::AccessTokens;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
