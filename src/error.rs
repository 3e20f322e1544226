use thiserror::Error;

/// Errors produced by the orchestrator and its components.
///
/// Per-model call failures are *not* represented here; they are carried as
/// [`ModelError`](crate::gateway::ModelError) values inside fan-out result
/// maps so that one model's failure never aborts a stage.
#[derive(Error, Debug)]
pub enum CouncilError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure in the conversation store or pending tracker.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A request referenced a conversation that does not exist.
    #[error("conversation {0} not found")]
    ConversationNotFound(String),

    /// The request violated a precondition (bad mode, empty council,
    /// retry without prior data, extend on a non-arena message, ...).
    /// Surfaced as 4xx on plain routes and a single `error` event on streams.
    #[error("{0}")]
    Precondition(String),

    /// The client went away: the event channel closed mid-pipeline.
    /// Partial pending data already persisted stays for a later resume.
    #[error("deliberation was cancelled")]
    Cancelled,

    /// Invalid configuration detected at startup or build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CouncilError {
    fn from(err: anyhow::Error) -> Self {
        CouncilError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CouncilError>;
