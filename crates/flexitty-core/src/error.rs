use thiserror::Error;

/// Errors produced by the session engine and its collaborators.
#[derive(Debug, Error)]
pub enum FlexiError {
    /// The terminal or its child process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The terminal (or a sink) reached end of stream.
    #[error("end of stream")]
    Eof,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("buffer empty")]
    BufferEmpty,

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for FlexiError {
    fn from(e: serde_json::Error) -> Self {
        FlexiError::Transport(format!("json: {e}"))
    }
}

pub type FlexiResult<T> = Result<T, FlexiError>;
