//! Error types for the store, the sync strategy layer, and the server.
//!
//! Kinds follow the policy in the spec's error-handling section: push-path
//! errors never block the local write, pull-path errors never corrupt local
//! state, and user-visible failure is limited to `StorageError`/`InvalidXxx`.

use thiserror::Error;

/// Errors raised by `LocalStore` and `Repository`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store used before initialize()")]
    NotInitialized,

    #[error("invalid field name: {0}")]
    InvalidField(String),

    #[error("invalid or missing id")]
    InvalidId,

    #[error("invalid event: {0}")]
    InvalidEvent(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a `SyncStrategy` during push/pull/connection handling.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("heartbeat pong timeout")]
    PongTimeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
