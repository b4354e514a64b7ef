//! Collaboration session: users, documents, history, cursors and chat.
//!
//! Architecture:
//! ```text
//!  connection tasks ──► mpsc<SessionCommand> ──► SessionActor (one per session)
//!                                                   │  owns Session
//!                                                   │  transform → apply → history
//!                                                   ▼
//!                                             Vec<Effect>
//!                                                   │
//!                                            ConnectionPool
//!                                     send_to / broadcast(topic) / subscribe
//! ```
//!
//! [`Session`] itself is synchronous and never touches the network. Each
//! handler returns the effects to perform, so the actor can run a command
//! to completion before looking at the next one: an edit is transformed and
//! applied without anything interleaving.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tandem_core::{
    transform_against_history, transform_position_by, ChunkId, CoreError, Document,
    DocumentSnapshot, Operation,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::CollabError;
use crate::pool::{document_topic, session_topic, ConnectionId, ConnectionPool};
use crate::protocol::{ChatEntry, ClientMessage, CursorInfo, Position, ServerMessage, UserInfo};
use crate::reliability::UserState;

/// An applied operation, as transformed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version: u64,
    pub operation: Operation,
}

struct SharedDocument {
    document: Document,
    history: VecDeque<HistoryEntry>,
}

impl SharedDocument {
    /// Entries after `version`, if history still covers all of them.
    fn entries_after(&self, version: u64) -> Option<impl Iterator<Item = &HistoryEntry> + '_> {
        let oldest = self.history.front()?.version;
        if oldest > version + 1 {
            return None;
        }
        Some(self.history.iter().filter(move |e| e.version > version))
    }
}

/// A participant. The connection is referenced, the pool owns it.
#[derive(Debug, Clone)]
pub struct User {
    pub client_id: String,
    pub name: String,
    pub connection: Option<ConnectionId>,
    /// Absolute char offset per open document.
    pub cursors: HashMap<String, usize>,
    pub last_heartbeat: Instant,
    pub state: UserState,
    pub disconnected_at: Option<Instant>,
}

/// Something the session wants done on the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send {
        to: ConnectionId,
        message: ServerMessage,
    },
    Broadcast {
        topic: String,
        exclude: Option<ConnectionId>,
        message: ServerMessage,
    },
    Subscribe {
        connection: ConnectionId,
        topic: String,
    },
    /// Drop a connection from the pool.
    Close { connection: ConnectionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub client_id: String,
    pub reconnected: bool,
}

/// Session summary for the manager and diagnostics.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub name: String,
    pub users: usize,
    pub connected_users: usize,
    pub documents: usize,
    pub chunked_documents: usize,
    /// Set while no user is connected.
    pub empty_since: Option<Instant>,
}

pub struct Session {
    id: Uuid,
    name: String,
    config: SessionConfig,
    documents: HashMap<String, SharedDocument>,
    users: HashMap<String, User>,
    chat: VecDeque<ChatEntry>,
    empty_since: Option<Instant>,
}

impl Session {
    pub fn new(id: Uuid, name: impl Into<String>, config: SessionConfig, now: Instant) -> Self {
        Self {
            id,
            name: name.into(),
            config,
            documents: HashMap::new(),
            users: HashMap::new(),
            chat: VecDeque::new(),
            empty_since: Some(now),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn document(&self, file_path: &str) -> Option<&Document> {
        self.documents.get(file_path).map(|d| &d.document)
    }

    pub fn history(&self, file_path: &str) -> impl Iterator<Item = &HistoryEntry> + '_ {
        self.documents
            .get(file_path)
            .into_iter()
            .flat_map(|d| d.history.iter())
    }

    pub fn user(&self, client_id: &str) -> Option<&User> {
        self.users.get(client_id)
    }

    pub fn chat_history(&self) -> impl Iterator<Item = &ChatEntry> + '_ {
        self.chat.iter()
    }

    /// True when no user holds a live connection.
    pub fn is_empty(&self) -> bool {
        self.users.values().all(|u| u.connection.is_none())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            name: self.name.clone(),
            users: self.users.len(),
            connected_users: self.users.values().filter(|u| u.connection.is_some()).count(),
            documents: self.documents.len(),
            chunked_documents: self
                .documents
                .values()
                .filter(|d| d.document.is_chunked())
                .count(),
            empty_since: self.empty_since,
        }
    }

    fn refresh_empty(&mut self, now: Instant) {
        if self.is_empty() {
            self.empty_since.get_or_insert(now);
        } else {
            self.empty_since = None;
        }
    }

    fn topic(&self) -> String {
        session_topic(self.id)
    }

    fn sorted_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.documents.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn subscriptions(&self, connection: ConnectionId) -> Vec<Effect> {
        let mut effects = vec![Effect::Subscribe {
            connection,
            topic: self.topic(),
        }];
        for path in self.sorted_paths() {
            effects.push(Effect::Subscribe {
                connection,
                topic: document_topic(self.id, &path),
            });
        }
        effects
    }

    fn session_state(&self, files: Vec<DocumentSnapshot>) -> ServerMessage {
        let mut users: Vec<UserInfo> = self
            .users
            .values()
            .map(|u| UserInfo {
                client_id: u.client_id.clone(),
                name: u.name.clone(),
                state: u.state,
            })
            .collect();
        users.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let mut cursors = Vec::new();
        for user in self.users.values() {
            for (path, offset) in &user.cursors {
                if let Some(shared) = self.documents.get(path) {
                    let (row, column) = shared.document.row_col(*offset);
                    cursors.push(CursorInfo {
                        client_id: user.client_id.clone(),
                        file_path: path.clone(),
                        position: Position::new(row, column),
                    });
                }
            }
        }
        cursors.sort_by(|a, b| (&a.client_id, &a.file_path).cmp(&(&b.client_id, &b.file_path)));

        ServerMessage::SessionState {
            session_id: self.id,
            session_name: self.name.clone(),
            users,
            files,
            cursors,
            chat_history: self.chat.iter().cloned().collect(),
        }
    }

    /// The user behind `connection`, if it is that user's live connection.
    fn sender(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
    ) -> Result<&mut User, CollabError> {
        match self.users.get_mut(client_id) {
            Some(user) if user.connection == Some(connection) => Ok(user),
            _ => Err(CollabError::UnknownClient(client_id.to_string())),
        }
    }

    /// Join as a new user, or resume `client_id` if the session knows it.
    pub fn join(
        &mut self,
        client_id: String,
        name: String,
        connection: ConnectionId,
        last_versions: &HashMap<String, u64>,
        now: Instant,
    ) -> (JoinOutcome, Vec<Effect>) {
        if self.users.contains_key(&client_id) {
            if let Ok(effects) = self.reconnect_user(&client_id, connection, last_versions, now) {
                let outcome = JoinOutcome {
                    client_id,
                    reconnected: true,
                };
                return (outcome, effects);
            }
        }
        let effects = self.add_user(client_id.clone(), name, connection, now);
        let outcome = JoinOutcome {
            client_id,
            reconnected: false,
        };
        (outcome, effects)
    }

    /// Register a new user and hand them the full session state.
    pub fn add_user(
        &mut self,
        client_id: String,
        name: String,
        connection: ConnectionId,
        now: Instant,
    ) -> Vec<Effect> {
        log::info!("client {client_id} ({name}) joined session {}", self.id);
        self.users.insert(
            client_id.clone(),
            User {
                client_id: client_id.clone(),
                name: name.clone(),
                connection: Some(connection),
                cursors: HashMap::new(),
                last_heartbeat: now,
                state: UserState::Active,
                disconnected_at: None,
            },
        );
        self.refresh_empty(now);

        let mut effects = vec![Effect::Send {
            to: connection,
            message: ServerMessage::Welcome {
                session_id: self.id,
                client_id: client_id.clone(),
                reconnected: false,
            },
        }];
        effects.extend(self.subscriptions(connection));
        let files = self
            .sorted_paths()
            .iter()
            .filter_map(|p| self.documents.get(p))
            .map(|d| d.document.snapshot())
            .collect();
        effects.push(Effect::Send {
            to: connection,
            message: self.session_state(files),
        });
        effects.push(Effect::Broadcast {
            topic: self.topic(),
            exclude: Some(connection),
            message: ServerMessage::UserJoined { client_id, name },
        });
        effects
    }

    /// Resume a known user on a new connection.
    ///
    /// Documents the client lists in `last_versions` are caught up by
    /// replaying history after that version; documents it does not know, or
    /// whose history has been trimmed past it, are sent as snapshots.
    pub fn reconnect_user(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        last_versions: &HashMap<String, u64>,
        now: Instant,
    ) -> Result<Vec<Effect>, CollabError> {
        let user = self
            .users
            .get_mut(client_id)
            .ok_or_else(|| CollabError::UnknownClient(client_id.to_string()))?;
        let previous = user.connection.replace(connection);
        user.state = UserState::Active;
        user.last_heartbeat = now;
        user.disconnected_at = None;
        let name = user.name.clone();
        self.refresh_empty(now);

        let mut effects = vec![Effect::Send {
            to: connection,
            message: ServerMessage::Welcome {
                session_id: self.id,
                client_id: client_id.to_string(),
                reconnected: true,
            },
        }];
        if let Some(old) = previous.filter(|old| *old != connection) {
            effects.push(Effect::Close { connection: old });
        }
        effects.extend(self.subscriptions(connection));

        let mut files = Vec::new();
        let mut replay = Vec::new();
        for path in self.sorted_paths() {
            let Some(shared) = self.documents.get(&path) else {
                continue;
            };
            let current = shared.document.version();
            match last_versions.get(&path).copied() {
                Some(known) if known == current => {}
                Some(known) if known < current => match shared.entries_after(known) {
                    Some(entries) => {
                        replay.extend(entries.map(|entry| Effect::Send {
                            to: connection,
                            message: ServerMessage::Edit {
                                file_path: path.clone(),
                                operation: entry.operation.clone(),
                                client_id: entry.operation.client_id.clone(),
                                server_version: entry.version,
                            },
                        }));
                    }
                    None => {
                        log::info!(
                            "history for {path} starts after v{known}, snapshot to {client_id}"
                        );
                        files.push(shared.document.snapshot());
                    }
                },
                _ => files.push(shared.document.snapshot()),
            }
        }

        log::info!(
            "client {client_id} reconnected to session {} ({} replayed, {} snapshots)",
            self.id,
            replay.len(),
            files.len()
        );
        effects.push(Effect::Send {
            to: connection,
            message: self.session_state(files),
        });
        effects.extend(replay);
        effects.push(Effect::Broadcast {
            topic: self.topic(),
            exclude: Some(connection),
            message: ServerMessage::UserActive {
                client_id: client_id.to_string(),
                name,
            },
        });
        Ok(effects)
    }

    fn create_document(&mut self, file_path: &str, content: &str, client_id: &str) -> Vec<Effect> {
        let document = Document::open(file_path, content, self.config.chunk);
        log::info!(
            "session {} opened {file_path} ({} chars{})",
            self.id,
            document.len(),
            if document.is_chunked() { ", chunked" } else { "" }
        );
        let snapshot = document.snapshot();
        self.documents.insert(
            file_path.to_string(),
            SharedDocument {
                document,
                history: VecDeque::new(),
            },
        );

        let topic = document_topic(self.id, file_path);
        let mut connections: Vec<ConnectionId> =
            self.users.values().filter_map(|u| u.connection).collect();
        connections.sort();
        let mut effects: Vec<Effect> = connections
            .into_iter()
            .map(|connection| Effect::Subscribe {
                connection,
                topic: topic.clone(),
            })
            .collect();
        effects.push(Effect::Broadcast {
            topic: self.topic(),
            exclude: None,
            message: ServerMessage::FileOpened {
                file: snapshot,
                client_id: client_id.to_string(),
            },
        });
        effects
    }

    /// Open `file_path`, creating it from `content` on first open.
    pub fn open_document(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        file_path: &str,
        content: &str,
    ) -> Result<Vec<Effect>, CollabError> {
        self.sender(client_id, connection)?;
        match self.documents.get(file_path) {
            Some(shared) => Ok(vec![
                Effect::Subscribe {
                    connection,
                    topic: document_topic(self.id, file_path),
                },
                Effect::Send {
                    to: connection,
                    message: ServerMessage::FileOpened {
                        file: shared.document.snapshot(),
                        client_id: client_id.to_string(),
                    },
                },
            ]),
            None => Ok(self.create_document(file_path, content, client_id)),
        }
    }

    /// Transform, apply and record an edit.
    ///
    /// On success the sender gets an `ack` and everyone else on the
    /// document gets the transformed operation. An operation id already in
    /// history is acknowledged again without being reapplied.
    pub fn handle_edit(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        file_path: &str,
        operation: Operation,
        version: u64,
        now: Instant,
    ) -> Result<Vec<Effect>, CollabError> {
        let user = self.sender(client_id, connection)?;
        user.last_heartbeat = now;

        let mut effects = Vec::new();
        if !self.documents.contains_key(file_path) {
            effects.extend(self.create_document(file_path, "", client_id));
        }
        let history_limit = self.config.history_limit;
        let shared = self
            .documents
            .get_mut(file_path)
            .ok_or_else(|| CollabError::UnknownFile(file_path.to_string()))?;

        if let Some(entry) = shared.history.iter().find(|e| e.operation.id == operation.id) {
            log::debug!("duplicate operation {} from {client_id}, re-acknowledging", operation.id);
            effects.push(Effect::Send {
                to: connection,
                message: ServerMessage::Ack {
                    file_path: file_path.to_string(),
                    client_version: version,
                    server_version: entry.version,
                    op_id: operation.id,
                },
            });
            return Ok(effects);
        }

        let current = shared.document.version();
        if version > current {
            return Err(CoreError::FutureVersion {
                base_version: version,
                current,
            }
            .into());
        }
        let oldest_available = shared.history.front().map_or(current + 1, |e| e.version);
        // Every version after the base must still be in history.
        if version < current && oldest_available > version + 1 {
            let stale = CoreError::StaleOperation {
                base_version: version,
                oldest_available,
            };
            log::warn!("{file_path}: {stale} from {client_id}, client must reload");
            return Err(stale.into());
        }

        let mut operation = operation;
        operation.client_id = client_id.to_string();
        operation.base_version = version;
        let concurrent = shared
            .history
            .iter()
            .filter(|e| e.version > version)
            .map(|e| &e.operation);
        let transformed = transform_against_history(&operation, concurrent);

        let server_version = match shared.document.apply(&transformed) {
            Ok(v) => v,
            Err(err) => {
                log::error!(
                    "{file_path}: dropping operation {} from {client_id}: {err}",
                    transformed.id
                );
                return Err(err.into());
            }
        };
        shared.history.push_back(HistoryEntry {
            version: server_version,
            operation: transformed.clone(),
        });
        while shared.history.len() > history_limit.max(1) {
            shared.history.pop_front();
        }

        for user in self.users.values_mut() {
            if let Some(offset) = user.cursors.get_mut(file_path) {
                *offset = transform_position_by(*offset, &transformed, user.client_id == client_id);
            }
        }

        log::debug!("{file_path} v{server_version} <- {client_id} (base {version})");
        effects.push(Effect::Send {
            to: connection,
            message: ServerMessage::Ack {
                file_path: file_path.to_string(),
                client_version: version,
                server_version,
                op_id: transformed.id,
            },
        });
        effects.push(Effect::Broadcast {
            topic: document_topic(self.id, file_path),
            exclude: Some(connection),
            message: ServerMessage::Edit {
                file_path: file_path.to_string(),
                operation: transformed,
                client_id: client_id.to_string(),
                server_version,
            },
        });
        Ok(effects)
    }

    pub fn handle_cursor_update(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        file_path: &str,
        position: Position,
    ) -> Result<Vec<Effect>, CollabError> {
        self.sender(client_id, connection)?;
        let document = self
            .document(file_path)
            .ok_or_else(|| CollabError::UnknownFile(file_path.to_string()))?;
        let offset = document.offset_of(position.row, position.column);
        let (row, column) = document.row_col(offset);

        let user = self.sender(client_id, connection)?;
        user.cursors.insert(file_path.to_string(), offset);
        Ok(vec![Effect::Broadcast {
            topic: document_topic(self.id, file_path),
            exclude: Some(connection),
            message: ServerMessage::Cursor {
                file_path: file_path.to_string(),
                client_id: client_id.to_string(),
                position: Position::new(row, column),
            },
        }])
    }

    /// Absolute cursor offset of a user in a document.
    pub fn cursor_offset(&self, client_id: &str, file_path: &str) -> Option<usize> {
        self.users.get(client_id)?.cursors.get(file_path).copied()
    }

    pub fn handle_chat_message(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        message: String,
    ) -> Result<Vec<Effect>, CollabError> {
        let user = self.sender(client_id, connection)?;
        let entry = ChatEntry {
            client_id: client_id.to_string(),
            name: user.name.clone(),
            message,
            timestamp: Utc::now(),
        };
        self.chat.push_back(entry.clone());
        while self.chat.len() > self.config.chat_history_limit {
            self.chat.pop_front();
        }
        Ok(vec![Effect::Broadcast {
            topic: self.topic(),
            exclude: None,
            message: ServerMessage::Chat { entry },
        }])
    }

    pub fn handle_heartbeat(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        now: Instant,
    ) -> Result<Vec<Effect>, CollabError> {
        let topic = self.topic();
        let user = self.sender(client_id, connection)?;
        user.last_heartbeat = now;
        if user.state != UserState::Idle {
            return Ok(Vec::new());
        }
        user.state = UserState::Active;
        log::debug!("client {client_id} active again");
        Ok(vec![Effect::Broadcast {
            topic,
            exclude: Some(connection),
            message: ServerMessage::UserActive {
                client_id: client_id.to_string(),
                name: user.name.clone(),
            },
        }])
    }

    /// Serve one chunk. An unknown id is answered with an error and the
    /// current manifest so the client can re-resolve.
    pub fn get_chunk(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        file_path: &str,
        chunk_id: ChunkId,
    ) -> Result<Vec<Effect>, CollabError> {
        self.sender(client_id, connection)?;
        let document = self
            .document(file_path)
            .ok_or_else(|| CollabError::UnknownFile(file_path.to_string()))?;
        match document.chunk(chunk_id) {
            Ok(chunk) => Ok(vec![Effect::Send {
                to: connection,
                message: ServerMessage::chunk_data(file_path, document.version(), chunk),
            }]),
            Err(err) => {
                log::debug!("{file_path}: {err} requested by {client_id}");
                let mut effects = vec![Effect::Send {
                    to: connection,
                    message: ServerMessage::error(&CollabError::from(err)),
                }];
                effects.extend(self.manifest_message(file_path).map(|message| Effect::Send {
                    to: connection,
                    message,
                }));
                Ok(effects)
            }
        }
    }

    fn manifest_message(&self, file_path: &str) -> Option<ServerMessage> {
        let document = self.document(file_path)?;
        let manifest = document.manifest()?;
        Some(ServerMessage::ChunkManifest {
            file_path: file_path.to_string(),
            version: document.version(),
            total_length: manifest.total_length,
            chunks: manifest.chunks,
        })
    }

    /// Chunk manifest of a chunked document; plain documents are sent whole.
    pub fn manifest(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        file_path: &str,
    ) -> Result<Vec<Effect>, CollabError> {
        self.sender(client_id, connection)?;
        let document = self
            .document(file_path)
            .ok_or_else(|| CollabError::UnknownFile(file_path.to_string()))?;
        let message = match self.manifest_message(file_path) {
            Some(message) => message,
            None => ServerMessage::FileOpened {
                file: document.snapshot(),
                client_id: client_id.to_string(),
            },
        };
        Ok(vec![Effect::Send {
            to: connection,
            message,
        }])
    }

    /// Explicit leave from the user's live connection.
    pub fn leave(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        now: Instant,
    ) -> Result<Vec<Effect>, CollabError> {
        self.sender(client_id, connection)?;
        Ok(self.remove_user(client_id, now))
    }

    /// Forget a user entirely.
    pub fn remove_user(&mut self, client_id: &str, now: Instant) -> Vec<Effect> {
        let Some(user) = self.users.remove(client_id) else {
            return Vec::new();
        };
        log::info!("client {client_id} left session {}", self.id);
        self.refresh_empty(now);
        vec![Effect::Broadcast {
            topic: self.topic(),
            exclude: user.connection,
            message: ServerMessage::UserLeft {
                client_id: user.client_id,
                name: user.name,
            },
        }]
    }

    /// Detach the user's connection but keep the record for reconnection.
    ///
    /// With `Some(connection)`, only acts if that is still the user's live
    /// connection, so a late loss report for a replaced connection is ignored.
    pub fn mark_disconnected(
        &mut self,
        client_id: &str,
        connection: Option<ConnectionId>,
        now: Instant,
    ) -> Vec<Effect> {
        let topic = self.topic();
        let Some(user) = self.users.get_mut(client_id) else {
            return Vec::new();
        };
        if user.connection.is_none() || (connection.is_some() && user.connection != connection) {
            return Vec::new();
        }
        user.connection = None;
        user.state = UserState::Disconnected;
        user.disconnected_at = Some(now);
        let name = user.name.clone();
        log::info!("client {client_id} disconnected from session {}", self.id);
        self.refresh_empty(now);
        vec![Effect::Broadcast {
            topic,
            exclude: None,
            message: ServerMessage::UserInactive {
                client_id: client_id.to_string(),
                name,
            },
        }]
    }

    /// Apply heartbeat timeouts and expire disconnected users.
    pub fn sweep_liveness(&mut self, now: Instant) -> Vec<Effect> {
        let liveness = self.config.heartbeat.liveness();
        let grace = self.config.heartbeat.reconnect_grace;
        let topic = self.topic();

        let mut effects = Vec::new();
        let mut lost = Vec::new();
        let mut expired = Vec::new();
        let mut client_ids: Vec<String> = self.users.keys().cloned().collect();
        client_ids.sort();

        for client_id in client_ids {
            let Some(user) = self.users.get_mut(&client_id) else {
                continue;
            };
            match user.connection {
                Some(connection) => match liveness.classify(user.last_heartbeat, now) {
                    UserState::Idle if user.state == UserState::Active => {
                        user.state = UserState::Idle;
                        log::debug!("client {client_id} idle");
                        effects.push(Effect::Broadcast {
                            topic: topic.clone(),
                            exclude: Some(connection),
                            message: ServerMessage::UserInactive {
                                client_id: client_id.clone(),
                                name: user.name.clone(),
                            },
                        });
                    }
                    UserState::Disconnected => lost.push((client_id, connection)),
                    _ => {}
                },
                None => {
                    let since = user.disconnected_at.unwrap_or(now);
                    if now.saturating_duration_since(since) >= grace {
                        expired.push(client_id);
                    }
                }
            }
        }

        for (client_id, connection) in lost {
            log::info!("client {client_id} missed heartbeats");
            effects.extend(self.mark_disconnected(&client_id, Some(connection), now));
            effects.push(Effect::Close { connection });
        }
        for client_id in expired {
            effects.extend(self.remove_user(&client_id, now));
        }
        effects
    }
}

/// Edit counters shared by all session actors.
#[derive(Debug, Default)]
pub struct EditMetrics {
    edits_applied: AtomicU64,
    edit_errors: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl EditMetrics {
    pub fn record(&self, latency: Duration, ok: bool) {
        if !ok {
            self.edit_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.edits_applied.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn edits_applied(&self) -> u64 {
        self.edits_applied.load(Ordering::Relaxed)
    }

    pub fn edit_errors(&self) -> u64 {
        self.edit_errors.load(Ordering::Relaxed)
    }

    pub fn mean_latency_us(&self) -> u64 {
        let applied = self.edits_applied();
        if applied == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / applied
    }

    pub fn max_latency_us(&self) -> u64 {
        self.max_latency_us.load(Ordering::Relaxed)
    }
}

/// Work queued to a session actor.
pub enum SessionCommand {
    Join {
        client_id: String,
        name: String,
        connection: ConnectionId,
        last_versions: HashMap<String, u64>,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Message {
        client_id: String,
        connection: ConnectionId,
        message: ClientMessage,
        received_at: Instant,
    },
    ConnectionLost {
        client_id: String,
        connection: ConnectionId,
    },
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    Close,
}

/// Cloneable handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Start the actor that owns `session`.
    pub fn spawn(
        session: Session,
        pool: Arc<ConnectionPool>,
        metrics: Arc<EditMetrics>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            session_id: session.id(),
            commands,
        };
        let actor = SessionActor {
            session,
            pool,
            metrics,
        };
        let task = tokio::spawn(actor.run(receiver));
        (handle, task)
    }

    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), CollabError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CollabError::SessionClosed)
    }

    pub async fn join(
        &self,
        client_id: String,
        name: String,
        connection: ConnectionId,
        last_versions: HashMap<String, u64>,
    ) -> Result<JoinOutcome, CollabError> {
        let (reply, outcome) = oneshot::channel();
        self.send(SessionCommand::Join {
            client_id,
            name,
            connection,
            last_versions,
            reply,
        })
        .await?;
        outcome.await.map_err(|_| CollabError::SessionClosed)
    }

    pub async fn submit(
        &self,
        client_id: &str,
        connection: ConnectionId,
        message: ClientMessage,
        received_at: Instant,
    ) -> Result<(), CollabError> {
        self.send(SessionCommand::Message {
            client_id: client_id.to_string(),
            connection,
            message,
            received_at,
        })
        .await
    }

    pub async fn connection_lost(
        &self,
        client_id: &str,
        connection: ConnectionId,
    ) -> Result<(), CollabError> {
        self.send(SessionCommand::ConnectionLost {
            client_id: client_id.to_string(),
            connection,
        })
        .await
    }

    pub async fn info(&self) -> Result<SessionInfo, CollabError> {
        let (reply, info) = oneshot::channel();
        self.send(SessionCommand::Info { reply }).await?;
        info.await.map_err(|_| CollabError::SessionClosed)
    }

    pub async fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }
}

struct SessionActor {
    session: Session,
    pool: Arc<ConnectionPool>,
    metrics: Arc<EditMetrics>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let period = self
            .session
            .config()
            .heartbeat
            .check_interval
            .max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.execute(command).await,
                },
                _ = sweep.tick() => {
                    let effects = self.session.sweep_liveness(Instant::now());
                    self.dispatch(effects).await;
                }
            }
        }

        let connections: Vec<ConnectionId> = self
            .session
            .users
            .values()
            .filter_map(|u| u.connection)
            .collect();
        for connection in connections {
            self.pool.remove_connection(connection).await;
        }
        log::info!("session {} closed", self.session.id());
    }

    async fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                client_id,
                name,
                connection,
                last_versions,
                reply,
            } => {
                let (outcome, effects) =
                    self.session
                        .join(client_id, name, connection, &last_versions, Instant::now());
                self.dispatch(effects).await;
                let _ = reply.send(outcome);
            }
            SessionCommand::Message {
                client_id,
                connection,
                message,
                received_at,
            } => {
                let result = self.handle_message(&client_id, connection, message, received_at);
                match result {
                    Ok(effects) => self.dispatch(effects).await,
                    Err(err) => {
                        log::warn!("session {}: {client_id}: {err}", self.session.id());
                        let report = ServerMessage::error(&err);
                        if let Err(send_err) = self.pool.send_to(connection, &report).await {
                            log::debug!("could not report error to {client_id}: {send_err}");
                        }
                    }
                }
            }
            SessionCommand::ConnectionLost {
                client_id,
                connection,
            } => {
                let effects =
                    self.session
                        .mark_disconnected(&client_id, Some(connection), Instant::now());
                self.dispatch(effects).await;
            }
            SessionCommand::Info { reply } => {
                let _ = reply.send(self.session.info());
            }
            SessionCommand::Close => {}
        }
    }

    fn handle_message(
        &mut self,
        client_id: &str,
        connection: ConnectionId,
        message: ClientMessage,
        received_at: Instant,
    ) -> Result<Vec<Effect>, CollabError> {
        let now = Instant::now();
        let session = &mut self.session;
        match message {
            ClientMessage::Edit {
                file_path,
                operation,
                version,
            } => {
                let result = session.handle_edit(
                    client_id,
                    connection,
                    &file_path,
                    operation,
                    version,
                    now,
                );
                self.metrics
                    .record(now.saturating_duration_since(received_at), result.is_ok());
                result
            }
            ClientMessage::Open { file_path, content } => {
                session.open_document(client_id, connection, &file_path, &content)
            }
            ClientMessage::Cursor {
                file_path,
                position,
            } => session.handle_cursor_update(client_id, connection, &file_path, position),
            ClientMessage::Chat { message } => {
                session.handle_chat_message(client_id, connection, message)
            }
            ClientMessage::Heartbeat => session.handle_heartbeat(client_id, connection, now),
            ClientMessage::GetChunk {
                file_path,
                chunk_id,
            } => session.get_chunk(client_id, connection, &file_path, chunk_id),
            ClientMessage::GetManifest { file_path } => {
                session.manifest(client_id, connection, &file_path)
            }
            ClientMessage::Leave => session.leave(client_id, connection, now),
            ClientMessage::Ack { .. } => Ok(Vec::new()),
            ClientMessage::Join { .. } => Err(CollabError::Protocol("already joined".into())),
        }
    }

    async fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    if let Err(err) = self.pool.send_to(to, &message).await {
                        log::debug!("dropping {} for {to}: {err}", message.kind());
                    }
                }
                Effect::Broadcast {
                    topic,
                    exclude,
                    message,
                } => {
                    if let Err(err) = self.pool.broadcast(&topic, &message, exclude).await {
                        log::error!("broadcast of {} on {topic} failed: {err}", message.kind());
                    }
                }
                Effect::Subscribe { connection, topic } => {
                    self.pool.subscribe(connection, &topic).await;
                }
                Effect::Close { connection } => {
                    self.pool.remove_connection(connection).await;
                }
            }
        }
    }
}
