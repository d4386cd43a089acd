pub mod broadcast;
pub mod command_check;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod registry;

pub use broadcast::EventBroadcaster;
pub use dispatch::{Dispatcher, RawResult};
pub use error::EngineError;
pub use lifecycle::{Advance, TaskLifecycle};
pub use registry::ConnectionRegistry;
