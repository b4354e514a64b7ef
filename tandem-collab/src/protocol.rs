//! Wire protocol.
//!
//! JSON text frames. Every message carries a `type` discriminator:
//!
//! ```text
//! client → server   {"type":"edit","file_path":"a.rs","operation":{…},"version":4}
//! server → client   {"message_id":17,"message":{"type":"ack","file_path":"a.rs",…}}
//! ```
//!
//! Server messages are wrapped in an [`Envelope`] whose `message_id` the
//! client echoes back in an `ack`; until then the server keeps resending.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_core::{ChunkId, ChunkInfo, DocumentChunk, DocumentSnapshot, Operation};
use uuid::Uuid;

use crate::error::CollabError;
use crate::reliability::UserState;

/// Cursor location as the editor sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: usize,
    pub column: usize,
}

impl Position {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }
}

/// Messages a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a connection. Carrying a known `client_id`
    /// resumes that user; `last_versions` drives replay.
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default)]
        last_versions: HashMap<String, u64>,
    },
    /// Open a document, creating it with `content` if the session lacks it.
    Open {
        file_path: String,
        #[serde(default)]
        content: String,
    },
    Edit {
        file_path: String,
        operation: Operation,
        version: u64,
    },
    Cursor {
        file_path: String,
        position: Position,
    },
    Chat {
        message: String,
    },
    Heartbeat,
    Ack {
        message_id: u64,
    },
    GetChunk {
        file_path: String,
        chunk_id: ChunkId,
    },
    GetManifest {
        file_path: String,
    },
    Leave,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, CollabError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, CollabError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Open { .. } => "open",
            ClientMessage::Edit { .. } => "edit",
            ClientMessage::Cursor { .. } => "cursor",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::Heartbeat => "heartbeat",
            ClientMessage::Ack { .. } => "ack",
            ClientMessage::GetChunk { .. } => "get_chunk",
            ClientMessage::GetManifest { .. } => "get_manifest",
            ClientMessage::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub client_id: String,
    pub name: String,
    pub state: UserState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub client_id: String,
    pub file_path: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub client_id: String,
    pub name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        session_id: Uuid,
        client_id: String,
        reconnected: bool,
    },
    /// The sender's edit was applied at `server_version`.
    Ack {
        file_path: String,
        client_version: u64,
        server_version: u64,
        op_id: Uuid,
    },
    /// Someone's edit, already transformed to apply at `server_version`.
    Edit {
        file_path: String,
        operation: Operation,
        client_id: String,
        server_version: u64,
    },
    /// Session overview. `files` holds every document the receiver must
    /// (re)load from scratch.
    SessionState {
        session_id: Uuid,
        session_name: String,
        users: Vec<UserInfo>,
        files: Vec<DocumentSnapshot>,
        cursors: Vec<CursorInfo>,
        chat_history: Vec<ChatEntry>,
    },
    FileOpened {
        file: DocumentSnapshot,
        client_id: String,
    },
    ChunkData {
        file_path: String,
        version: u64,
        chunk_id: ChunkId,
        content: String,
        start_offset: usize,
        length: usize,
    },
    ChunkManifest {
        file_path: String,
        version: u64,
        total_length: usize,
        chunks: Vec<ChunkInfo>,
    },
    Cursor {
        file_path: String,
        client_id: String,
        position: Position,
    },
    Chat {
        entry: ChatEntry,
    },
    UserJoined {
        client_id: String,
        name: String,
    },
    UserLeft {
        client_id: String,
        name: String,
    },
    UserActive {
        client_id: String,
        name: String,
    },
    UserInactive {
        client_id: String,
        name: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(err: &CollabError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn chunk_data(file_path: &str, version: u64, chunk: &DocumentChunk) -> Self {
        ServerMessage::ChunkData {
            file_path: file_path.to_string(),
            version,
            chunk_id: chunk.chunk_id,
            content: chunk.content.clone(),
            start_offset: chunk.start_offset,
            length: chunk.length,
        }
    }

    /// Wire name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Edit { .. } => "edit",
            ServerMessage::SessionState { .. } => "session_state",
            ServerMessage::FileOpened { .. } => "file_opened",
            ServerMessage::ChunkData { .. } => "chunk_data",
            ServerMessage::ChunkManifest { .. } => "chunk_manifest",
            ServerMessage::Cursor { .. } => "cursor",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::UserJoined { .. } => "user_joined",
            ServerMessage::UserLeft { .. } => "user_left",
            ServerMessage::UserActive { .. } => "user_active",
            ServerMessage::UserInactive { .. } => "user_inactive",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// A server message plus the id the client acknowledges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: u64,
    pub message: ServerMessage,
}

impl Envelope {
    pub fn encode(&self) -> Result<String, CollabError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, CollabError> {
        Ok(serde_json::from_str(text)?)
    }
}
