//! Error handling for gpufleet
//!
//! Provides a unified error type shared by the scheduler core and both
//! daemons.

/// Result type alias for gpufleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for gpufleet
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration is invalid; the process refuses to start
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Unknown task, agent, or GPU id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Precondition miss in a transactional mutation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload validation failure
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Scheduling blocked by the class quota
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No heartbeat from an agent within the timeout
    #[error("Agent unreachable: {0}")]
    AgentUnreachable(String),

    /// Release of a task that already reached a terminal state
    #[error("Task already terminal: {0}")]
    AlreadyTerminal(String),

    /// Snapshot write or load failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Network or RPC transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a quota exceeded error
    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Create an agent unreachable error
    pub fn agent_unreachable(msg: impl Into<String>) -> Self {
        Self::AgentUnreachable(msg.into())
    }

    /// Create an already terminal error
    pub fn already_terminal(msg: impl Into<String>) -> Self {
        Self::AlreadyTerminal(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether retrying the operation can succeed without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::QuotaExceeded(_) | Error::Transport(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::InvalidRequest(_) => "invalid_request",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::AgentUnreachable(_) => "agent_unreachable",
            Error::AlreadyTerminal(_) => "already_terminal",
            Error::Persistence(_) => "persistence",
            Error::Transport(_) => "transport",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Other(_) => "other",
        }
    }

    /// Convert to an HTTP status code for the REST surface
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) | Error::InvalidConfiguration(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) | Error::AlreadyTerminal(_) => 409,
            Error::AgentUnreachable(_) => 503,
            Error::Transport(_) => 502,
            _ => 500,
        }
    }
}
