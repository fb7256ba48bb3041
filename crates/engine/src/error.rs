/// The error taxonomy from SPEC_FULL.md §7 / §3.1. `tool-parse-error` and
/// `tool-exec-error` are deliberately absent: per §7 those are always
/// converted to `ToolResult` content and never propagate as a Rust error.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error (transient): {0}")]
    ServerTransient(String),

    #[error("request timed out")]
    HttpTimeout,

    #[error("connection dropped before completion")]
    ConnectionDropped,

    #[error("stream decode error: {0}")]
    StreamDecodeError(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(#[from] sa_domain::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// The UI-facing notice kind, per §7's taxonomy names.
    pub fn notice_kind(&self) -> &'static str {
        match self {
            EngineError::AuthFailed(_) => "auth-failed",
            EngineError::BadRequest(_) => "bad-request",
            EngineError::RateLimited(_) => "rate-limited",
            EngineError::ServerTransient(_) => "server-transient",
            EngineError::HttpTimeout => "http-timeout",
            EngineError::ConnectionDropped => "connection-dropped",
            EngineError::StreamDecodeError(_) => "stream-decode-error",
            EngineError::Cancelled => "cancelled",
            EngineError::Transport(_) => "transport-error",
            EngineError::Decode(_) => "decode-error",
            EngineError::Io(_) => "io-error",
            EngineError::Config(_) => "config-error",
        }
    }

    /// Whether this error is fatal (ends the turn) as opposed to retryable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::AuthFailed(_) | EngineError::BadRequest(_) | EngineError::Cancelled
        )
    }
}
