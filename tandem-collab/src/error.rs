//! Error kinds surfaced by sessions, the connection pool and the transport.

use tandem_core::CoreError;
use tokio_tungstenite::tungstenite;

/// Errors raised by the collaboration layer.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("session {0} not found")]
    SessionNotFound(String),

    /// Retries exhausted or the peer went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("message {message_id} unacknowledged after {attempts} attempts")]
    AckTimeout { message_id: u64, attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session closed")]
    SessionClosed,

    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("not joined to a session")]
    NotJoined,

    #[error("file {0} is not open")]
    UnknownFile(String),

    #[error("file {0} is still loading")]
    DocumentLoading(String),
}

impl CollabError {
    /// Stable code sent to clients in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::Core(CoreError::Range { .. }) => "range_error",
            CollabError::Core(CoreError::ChunkNotFound(_)) => "chunk_not_found",
            CollabError::Core(CoreError::StaleOperation { .. }) => "stale_operation",
            CollabError::Core(CoreError::FutureVersion { .. }) => "invalid_version",
            CollabError::SessionNotFound(_) => "session_not_found",
            CollabError::ConnectionLost(_) => "connection_lost",
            CollabError::AckTimeout { .. } => "ack_timeout",
            CollabError::Protocol(_) | CollabError::Serialization(_) => "protocol_error",
            CollabError::WebSocket(_) | CollabError::Io(_) => "transport_error",
            CollabError::SessionClosed => "session_closed",
            CollabError::UnknownClient(_) => "unknown_client",
            CollabError::NotJoined => "not_joined",
            CollabError::UnknownFile(_) => "unknown_file",
            CollabError::DocumentLoading(_) => "document_loading",
        }
    }
}
