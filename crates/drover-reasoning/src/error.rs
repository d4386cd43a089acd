/// Errors from the reasoning backend.
///
/// Unparsable model output is NOT an error: callers fall back to heuristic
/// results in that case. Only transport/API failures surface here.
#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("empty response from model")]
    EmptyResponse,
}

impl From<reqwest::Error> for ReasoningError {
    fn from(e: reqwest::Error) -> Self {
        ReasoningError::Http(e.to_string())
    }
}
