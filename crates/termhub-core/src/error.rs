use thiserror::Error;

/// Errors produced by the session manager and its protocol layer.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("working directory does not exist: {0}")]
    InvalidDirectory(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("not enough free ports: requested {requested}, found {available}")]
    PortsExhausted { requested: usize, available: usize },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TermError {
    /// Whether this error means the caller referenced something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TermError::SessionNotFound(_))
    }
}

pub type TermResult<T> = Result<T, TermError>;
