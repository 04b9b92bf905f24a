use thiserror::Error;

/// Errors produced by the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed")]
    SessionClosed,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
