use drover_reasoning::ReasoningError;
use drover_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reasoning backend unavailable: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("task is terminal: {0}")]
    Terminal(String),

    #[error("internal error: {0}")]
    Internal(String),
}
