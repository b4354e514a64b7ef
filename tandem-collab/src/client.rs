//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, leave, automatic reconnect with backoff)
//! - One [`Replica`] per open file, applying server versions strictly in order
//! - Piecewise loading of chunked documents
//! - Acknowledgement of every envelope, heartbeats, offline edit retention
//!
//! [`ClientState`] holds everything that does not touch the network, so the
//! sequencing rules can be exercised without a server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tandem_core::{ChunkId, ChunkInfo, DocumentSnapshot, OpKind, Operation, Replica};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::CollabError;
use crate::protocol::{
    ChatEntry, ClientMessage, CursorInfo, Envelope, Position, ServerMessage, UserInfo,
};
use crate::reliability::RecentIds;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected {
        session_id: Uuid,
        client_id: String,
        reconnected: bool,
    },
    Disconnected,
    SessionState {
        session_name: String,
        users: Vec<UserInfo>,
        cursors: Vec<CursorInfo>,
        chat_history: Vec<ChatEntry>,
    },
    /// A file's full content is available locally.
    DocumentLoaded { file_path: String, version: u64 },
    RemoteEdit {
        file_path: String,
        client_id: String,
        server_version: u64,
    },
    EditAcknowledged { file_path: String, server_version: u64 },
    Cursor {
        file_path: String,
        client_id: String,
        position: Position,
    },
    Chat(ChatEntry),
    UserJoined { client_id: String, name: String },
    UserLeft { client_id: String, name: String },
    UserActive { client_id: String, name: String },
    UserInactive { client_id: String, name: String },
    Error { code: String, message: String },
}

/// Server-ordered input awaiting its turn.
#[derive(Debug, Clone)]
enum Sequenced {
    Remote(Operation),
    Ack(Uuid),
}

#[derive(Debug)]
struct ChunkAssembly {
    version: u64,
    total_length: usize,
    chunks: Vec<ChunkInfo>,
    received: HashMap<ChunkId, String>,
}

impl ChunkAssembly {
    fn is_complete(&self) -> bool {
        self.chunks
            .iter()
            .all(|info| self.received.contains_key(&info.chunk_id))
    }

    fn assemble(&self) -> String {
        let mut content = String::with_capacity(self.total_length);
        for info in &self.chunks {
            if let Some(piece) = self.received.get(&info.chunk_id) {
                content.push_str(piece);
            }
        }
        content
    }
}

#[derive(Debug)]
enum FileBody {
    Ready(Replica),
    Loading(ChunkAssembly),
}

#[derive(Debug)]
struct FileState {
    body: FileBody,
    /// Versions received ahead of the next expected one.
    ahead: BTreeMap<u64, Sequenced>,
    /// Waiting for a fresh snapshot or manifest.
    refreshing: bool,
}

impl FileState {
    fn new(body: FileBody) -> Self {
        Self {
            body,
            ahead: BTreeMap::new(),
            refreshing: false,
        }
    }

    fn version(&self) -> u64 {
        match &self.body {
            FileBody::Ready(replica) => replica.server_version(),
            FileBody::Loading(assembly) => assembly.version,
        }
    }
}

/// Outcome of handling one envelope.
#[derive(Debug, Default)]
pub struct Reaction {
    /// Messages to send back, in order.
    pub outgoing: Vec<ClientMessage>,
    pub events: Vec<SyncEvent>,
}

fn edit_message(file_path: &str, operation: Operation) -> ClientMessage {
    ClientMessage::Edit {
        file_path: file_path.to_string(),
        version: operation.base_version,
        operation,
    }
}

/// Network-independent client state.
#[derive(Debug)]
pub struct ClientState {
    name: String,
    session_id: Option<Uuid>,
    client_id: Option<String>,
    files: HashMap<String, FileState>,
    seen: RecentIds,
    session_lost: bool,
}

impl ClientState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_id: None,
            client_id: None,
            files: HashMap::new(),
            seen: RecentIds::new(4096),
            session_lost: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn set_session(&mut self, session_id: Uuid) {
        self.session_id = Some(session_id);
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// The server no longer knows our session; reconnecting is pointless.
    pub fn session_lost(&self) -> bool {
        self.session_lost
    }

    fn replica(&self, file_path: &str) -> Option<&Replica> {
        match &self.files.get(file_path)?.body {
            FileBody::Ready(replica) => Some(replica),
            FileBody::Loading(_) => None,
        }
    }

    pub fn content(&self, file_path: &str) -> Option<&str> {
        self.replica(file_path).map(Replica::content)
    }

    pub fn server_version(&self, file_path: &str) -> Option<u64> {
        self.replica(file_path).map(Replica::server_version)
    }

    pub fn is_loading(&self, file_path: &str) -> bool {
        matches!(
            self.files.get(file_path).map(|f| &f.body),
            Some(FileBody::Loading(_))
        )
    }

    /// Local edits not yet acknowledged by the server.
    pub fn pending_edits(&self, file_path: &str) -> usize {
        self.replica(file_path).map_or(0, |r| r.pending().count())
    }

    /// The join for (re)connecting, carrying every loaded file's version.
    pub fn join_message(&self) -> ClientMessage {
        let last_versions = self
            .files
            .iter()
            .filter_map(|(path, state)| match &state.body {
                FileBody::Ready(replica) => Some((path.clone(), replica.server_version())),
                FileBody::Loading(_) => None,
            })
            .collect();
        ClientMessage::Join {
            session_id: self.session_id,
            name: self.name.clone(),
            client_id: self.client_id.clone(),
            last_versions,
        }
    }

    pub fn open(&self, file_path: &str, content: &str) -> ClientMessage {
        ClientMessage::Open {
            file_path: file_path.to_string(),
            content: content.to_string(),
        }
    }

    /// Apply a local edit. Returns the message to send now, if any; edits
    /// made while another is in flight go out once it is acknowledged.
    pub fn edit(
        &mut self,
        file_path: &str,
        kind: OpKind,
    ) -> Result<Option<ClientMessage>, CollabError> {
        let state = self
            .files
            .get_mut(file_path)
            .ok_or_else(|| CollabError::UnknownFile(file_path.to_string()))?;
        let FileBody::Ready(replica) = &mut state.body else {
            return Err(CollabError::DocumentLoading(file_path.to_string()));
        };
        let operation = replica.local_edit(kind)?;
        Ok(operation.map(|op| edit_message(file_path, op)))
    }

    /// Handle one envelope from the server.
    pub fn handle(&mut self, envelope: Envelope) -> Reaction {
        let mut reaction = Reaction::default();
        if envelope.message_id != 0 {
            // A duplicate means our ack was lost, so it is sent again.
            reaction.outgoing.push(ClientMessage::Ack {
                message_id: envelope.message_id,
            });
            if !self.seen.first_time(envelope.message_id) {
                log::trace!("duplicate envelope #{}", envelope.message_id);
                return reaction;
            }
        }
        self.handle_message(envelope.message, &mut reaction);
        reaction
    }

    fn handle_message(&mut self, message: ServerMessage, reaction: &mut Reaction) {
        match message {
            ServerMessage::Welcome {
                session_id,
                client_id,
                reconnected,
            } => {
                log::info!(
                    "joined session {session_id} as {client_id} (reconnected: {reconnected})"
                );
                self.session_id = Some(session_id);
                self.client_id = Some(client_id.clone());
                reaction.events.push(SyncEvent::Connected {
                    session_id,
                    client_id,
                    reconnected,
                });
            }
            ServerMessage::SessionState {
                session_name,
                users,
                files,
                cursors,
                chat_history,
                ..
            } => {
                let reset: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
                for file in files {
                    self.load_snapshot(file, reaction);
                }
                self.resend_inflight(&reset, reaction);
                reaction.events.push(SyncEvent::SessionState {
                    session_name,
                    users,
                    cursors,
                    chat_history,
                });
            }
            ServerMessage::FileOpened { file, .. } => {
                let wanted = self.files.get(&file.path).is_none_or(|state| state.refreshing);
                if wanted {
                    self.load_snapshot(file, reaction);
                } else {
                    log::trace!("{} already loaded", file.path);
                }
            }
            ServerMessage::ChunkManifest {
                file_path,
                version,
                total_length,
                chunks,
            } => self.start_assembly(&file_path, version, total_length, chunks, reaction),
            ServerMessage::ChunkData {
                file_path,
                version,
                chunk_id,
                content,
                ..
            } => self.receive_chunk(&file_path, version, chunk_id, content, reaction),
            ServerMessage::Edit {
                file_path,
                operation,
                server_version,
                ..
            } => self.sequence(&file_path, server_version, Sequenced::Remote(operation), reaction),
            ServerMessage::Ack {
                file_path,
                server_version,
                op_id,
                ..
            } => self.sequence(&file_path, server_version, Sequenced::Ack(op_id), reaction),
            ServerMessage::Cursor {
                file_path,
                client_id,
                position,
            } => reaction.events.push(SyncEvent::Cursor {
                file_path,
                client_id,
                position,
            }),
            ServerMessage::Chat { entry } => reaction.events.push(SyncEvent::Chat(entry)),
            ServerMessage::UserJoined { client_id, name } => {
                reaction.events.push(SyncEvent::UserJoined { client_id, name })
            }
            ServerMessage::UserLeft { client_id, name } => {
                reaction.events.push(SyncEvent::UserLeft { client_id, name })
            }
            ServerMessage::UserActive { client_id, name } => {
                reaction.events.push(SyncEvent::UserActive { client_id, name })
            }
            ServerMessage::UserInactive { client_id, name } => {
                reaction.events.push(SyncEvent::UserInactive { client_id, name })
            }
            ServerMessage::Error { code, message } => {
                log::warn!("server error {code}: {message}");
                match code.as_str() {
                    // Recovered by reloading, nothing for the application to do.
                    "stale_operation" => {
                        self.refresh_pending(reaction);
                        return;
                    }
                    "range_error" | "invalid_version" => self.refresh_pending(reaction),
                    "session_not_found" => self.session_lost = true,
                    _ => {}
                }
                reaction.events.push(SyncEvent::Error { code, message });
            }
        }
    }

    fn load_snapshot(&mut self, file: DocumentSnapshot, reaction: &mut Reaction) {
        match (file.content, file.manifest) {
            (Some(content), _) => {
                self.install(&file.path, &content, file.version, reaction);
            }
            (None, Some(manifest)) => self.start_assembly(
                &file.path,
                file.version,
                manifest.total_length,
                manifest.chunks,
                reaction,
            ),
            (None, None) => {
                log::warn!("snapshot of {} has neither content nor manifest", file.path)
            }
        }
    }

    /// Replace a file's local state with server content at `version`.
    fn install(&mut self, file_path: &str, content: &str, version: u64, reaction: &mut Reaction) {
        let client_id = self.client_id.clone().unwrap_or_default();
        let state = self
            .files
            .entry(file_path.to_string())
            .or_insert_with(|| {
                FileState::new(FileBody::Ready(Replica::new(client_id.clone(), "", 0)))
            });
        match &mut state.body {
            FileBody::Ready(replica) => {
                replica.resync(content, version);
            }
            body => *body = FileBody::Ready(Replica::new(client_id, content, version)),
        }
        state.refreshing = false;
        log::debug!("{file_path} loaded at version {version}");
        reaction.events.push(SyncEvent::DocumentLoaded {
            file_path: file_path.to_string(),
            version,
        });
        Self::drain(file_path, state, reaction);
    }

    fn start_assembly(
        &mut self,
        file_path: &str,
        version: u64,
        total_length: usize,
        chunks: Vec<ChunkInfo>,
        reaction: &mut Reaction,
    ) {
        log::debug!("loading {file_path} v{version} from {} chunks", chunks.len());
        for info in &chunks {
            reaction.outgoing.push(ClientMessage::GetChunk {
                file_path: file_path.to_string(),
                chunk_id: info.chunk_id,
            });
        }
        let assembly = ChunkAssembly {
            version,
            total_length,
            chunks,
            received: HashMap::new(),
        };
        match self.files.get_mut(file_path) {
            Some(state) => {
                if let FileBody::Ready(replica) = &state.body {
                    if !replica.is_synced() {
                        log::warn!(
                            "{file_path} reloading, dropping {} pending edits",
                            replica.pending().count()
                        );
                    }
                }
                state.body = FileBody::Loading(assembly);
                state.refreshing = false;
            }
            None => {
                self.files
                    .insert(file_path.to_string(), FileState::new(FileBody::Loading(assembly)));
            }
        }
        self.finish_assembly(file_path, reaction);
    }

    fn receive_chunk(
        &mut self,
        file_path: &str,
        version: u64,
        chunk_id: ChunkId,
        content: String,
        reaction: &mut Reaction,
    ) {
        let Some(state) = self.files.get_mut(file_path) else {
            return;
        };
        let FileBody::Loading(assembly) = &mut state.body else {
            log::trace!("{file_path}: late {chunk_id} ignored");
            return;
        };
        if version != assembly.version {
            // The document moved on while we were fetching.
            if !state.refreshing {
                log::debug!(
                    "{file_path}: {chunk_id} is at v{version}, expected v{}",
                    assembly.version
                );
                state.refreshing = true;
                reaction.outgoing.push(ClientMessage::GetManifest {
                    file_path: file_path.to_string(),
                });
            }
            return;
        }
        assembly.received.insert(chunk_id, content);
        self.finish_assembly(file_path, reaction);
    }

    fn finish_assembly(&mut self, file_path: &str, reaction: &mut Reaction) {
        let client_id = self.client_id.clone().unwrap_or_default();
        let Some(state) = self.files.get_mut(file_path) else {
            return;
        };
        let FileBody::Loading(assembly) = &state.body else {
            return;
        };
        if !assembly.is_complete() {
            return;
        }
        let version = assembly.version;
        let content = assembly.assemble();
        state.body = FileBody::Ready(Replica::new(client_id, &content, version));
        state.refreshing = false;
        log::debug!("{file_path} assembled at version {version}");
        reaction.events.push(SyncEvent::DocumentLoaded {
            file_path: file_path.to_string(),
            version,
        });
        Self::drain(file_path, state, reaction);
    }

    /// Resend in-flight edits of files that kept their local state across
    /// a reconnect. Operations the server already applied come back as
    /// replayed echoes or duplicate acks and are absorbed.
    fn resend_inflight(&self, reset: &[String], reaction: &mut Reaction) {
        let mut paths: Vec<&String> = self.files.keys().filter(|p| !reset.contains(*p)).collect();
        paths.sort();
        for path in paths {
            if let Some(op) = self.replica(path).and_then(Replica::inflight) {
                log::debug!("resending in-flight edit {} on {path}", op.id);
                reaction.outgoing.push(edit_message(path, op.clone()));
            }
        }
    }

    fn refresh_pending(&mut self, reaction: &mut Reaction) {
        let mut paths: Vec<String> = self
            .files
            .iter()
            .filter(|(_, state)| match &state.body {
                FileBody::Ready(replica) => !replica.is_synced() && !state.refreshing,
                FileBody::Loading(_) => false,
            })
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        for path in paths {
            if let Some(state) = self.files.get_mut(&path) {
                state.refreshing = true;
            }
            reaction.outgoing.push(ClientMessage::GetManifest { file_path: path });
        }
    }

    fn sequence(
        &mut self,
        file_path: &str,
        version: u64,
        item: Sequenced,
        reaction: &mut Reaction,
    ) {
        let Some(state) = self.files.get_mut(file_path) else {
            log::debug!("version {version} of unknown file {file_path} ignored");
            return;
        };
        if version <= state.version() {
            log::trace!("{file_path}: version {version} already applied");
            return;
        }
        state.ahead.insert(version, item);
        Self::drain(file_path, state, reaction);
    }

    /// Apply every consecutive version that is available.
    fn drain(file_path: &str, state: &mut FileState, reaction: &mut Reaction) {
        let FileState {
            body,
            ahead,
            refreshing,
        } = state;
        let FileBody::Ready(replica) = body else {
            return;
        };
        let current = replica.server_version();
        ahead.retain(|version, _| *version > current);

        while let Some(item) = ahead.remove(&(replica.server_version() + 1)) {
            let version = replica.server_version() + 1;
            let outcome = match item {
                Sequenced::Ack(op_id) if replica.inflight().is_some_and(|op| op.id == op_id) => {
                    reaction.events.push(SyncEvent::EditAcknowledged {
                        file_path: file_path.to_string(),
                        server_version: version,
                    });
                    Ok(replica.acknowledge(op_id, version))
                }
                Sequenced::Ack(op_id) => Err(format!("ack for unknown operation {op_id}")),
                Sequenced::Remote(op) => {
                    let own = replica.inflight().is_some_and(|inflight| inflight.id == op.id);
                    match replica.apply_remote(&op, version) {
                        Ok(next) => {
                            reaction.events.push(if own {
                                SyncEvent::EditAcknowledged {
                                    file_path: file_path.to_string(),
                                    server_version: version,
                                }
                            } else {
                                SyncEvent::RemoteEdit {
                                    file_path: file_path.to_string(),
                                    client_id: op.client_id.clone(),
                                    server_version: version,
                                }
                            });
                            Ok(next)
                        }
                        Err(err) => Err(err.to_string()),
                    }
                }
            };

            match outcome {
                Ok(Some(next)) => reaction.outgoing.push(edit_message(file_path, next)),
                Ok(None) => {}
                Err(reason) => {
                    log::warn!("{file_path} diverged at version {version}: {reason}; reloading");
                    if !*refreshing {
                        *refreshing = true;
                        reaction.outgoing.push(ClientMessage::GetManifest {
                            file_path: file_path.to_string(),
                        });
                    }
                    return;
                }
            }
        }
    }
}

struct Shared {
    server_url: String,
    config: ClientConfig,
    core: Mutex<ClientState>,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if let Err(err) = self.event_tx.try_send(event) {
            log::debug!("sync event dropped: {err}");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Ended {
    Closed,
    Stopped,
}

/// The sync client.
///
/// Keeps local replicas of every open file convergent with the server,
/// across disconnects.
pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for `server_url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(
        server_url: impl Into<String>,
        name: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                server_url: server_url.into(),
                config,
                core: Mutex::new(ClientState::new(name)),
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                event_tx,
                shutdown,
            }),
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn server_url(&self) -> &str {
        &self.shared.server_url
    }

    /// Connect and join `session_id`, or start a new session.
    ///
    /// Only the first connection attempt is awaited; later reconnects
    /// happen in the background.
    pub async fn connect(&mut self, session_id: Option<Uuid>) -> Result<(), CollabError> {
        if self.supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(CollabError::Protocol("already connected".into()));
        }
        if let Some(session_id) = session_id {
            self.shared.core.lock().await.set_session(session_id);
        }
        *self.shared.state.write().await = ConnectionState::Connecting;
        self.shared.shutdown.send_replace(false);

        let ws = match tokio_tungstenite::connect_async(self.shared.server_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(err.into());
            }
        };
        self.supervisor = Some(tokio::spawn(supervise(self.shared.clone(), ws)));
        Ok(())
    }

    /// Leave the session and close the connection.
    pub async fn disconnect(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(task) = self.supervisor.take() {
            let _ = task.await;
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.shared.core.lock().await.session_id()
    }

    pub async fn client_id(&self) -> Option<String> {
        self.shared.core.lock().await.client_id().map(str::to_string)
    }

    async fn send(&self, message: ClientMessage) -> Result<(), CollabError> {
        let sender = self.shared.outgoing.lock().await.clone().ok_or(CollabError::NotJoined)?;
        sender
            .send(message)
            .await
            .map_err(|_| CollabError::ConnectionLost(self.shared.server_url.clone()))
    }

    /// Open a file, creating it on the server with `content` if new.
    pub async fn open(&self, file_path: &str, content: &str) -> Result<(), CollabError> {
        let message = self.shared.core.lock().await.open(file_path, content);
        self.send(message).await
    }

    /// Apply an edit locally and submit it. Offline edits are kept and
    /// submitted after reconnecting.
    pub async fn edit(&self, file_path: &str, kind: OpKind) -> Result<(), CollabError> {
        let message = self.shared.core.lock().await.edit(file_path, kind)?;
        if let Some(message) = message {
            if let Err(err) = self.send(message).await {
                log::debug!("edit on {file_path} held for resend: {err}");
            }
        }
        Ok(())
    }

    pub async fn insert(
        &self,
        file_path: &str,
        position: usize,
        text: &str,
    ) -> Result<(), CollabError> {
        self.edit(file_path, OpKind::insert(position, text)).await
    }

    pub async fn delete(
        &self,
        file_path: &str,
        position: usize,
        length: usize,
    ) -> Result<(), CollabError> {
        self.edit(file_path, OpKind::delete(position, length)).await
    }

    pub async fn cursor(
        &self,
        file_path: &str,
        row: usize,
        column: usize,
    ) -> Result<(), CollabError> {
        self.send(ClientMessage::Cursor {
            file_path: file_path.to_string(),
            position: Position::new(row, column),
        })
        .await
    }

    pub async fn chat(&self, message: impl Into<String>) -> Result<(), CollabError> {
        self.send(ClientMessage::Chat {
            message: message.into(),
        })
        .await
    }

    pub async fn content(&self, file_path: &str) -> Option<String> {
        self.shared.core.lock().await.content(file_path).map(str::to_string)
    }

    pub async fn server_version(&self, file_path: &str) -> Option<u64> {
        self.shared.core.lock().await.server_version(file_path)
    }

    pub async fn pending_edits(&self, file_path: &str) -> usize {
        self.shared.core.lock().await.pending_edits(file_path)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn send_frame<S>(sink: &mut S, message: &ClientMessage) -> Result<(), CollabError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(message.encode()?)).await?;
    Ok(())
}

/// Drive connections until shutdown or until reconnecting gives up.
async fn supervise(shared: Arc<Shared>, first: WsStream) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ws = first;
    loop {
        let ended = run_connection(&shared, ws, &mut shutdown).await;
        *shared.outgoing.lock().await = None;
        *shared.state.write().await = ConnectionState::Disconnected;
        shared.emit(SyncEvent::Disconnected);

        if ended == Ended::Stopped
            || !shared.config.auto_reconnect
            || shared.core.lock().await.session_lost()
        {
            break;
        }
        *shared.state.write().await = ConnectionState::Reconnecting;
        ws = match reconnect(&shared, &mut shutdown).await {
            Some(ws) => ws,
            None => break,
        };
    }
    *shared.state.write().await = ConnectionState::Disconnected;
    log::debug!("client supervisor for {} finished", shared.server_url);
}

async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Option<WsStream> {
    let policy = shared.config.reconnect;
    for attempt in 0..policy.max_attempts.max(1) {
        tokio::select! {
            _ = tokio::time::sleep(policy.backoff(attempt)) => {}
            _ = shutdown.changed() => return None,
        }
        match tokio_tungstenite::connect_async(shared.server_url.as_str()).await {
            Ok((ws, _)) => {
                log::info!("reconnected to {} after {} attempts", shared.server_url, attempt + 1);
                return Some(ws);
            }
            Err(err) => log::warn!(
                "reconnect attempt {} to {} failed: {err}",
                attempt + 1,
                shared.server_url
            ),
        }
    }
    log::error!("giving up on {}", shared.server_url);
    None
}

async fn run_connection(
    shared: &Shared,
    ws: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();
    let join = shared.core.lock().await.join_message();
    if let Err(err) = send_frame(&mut sink, &join).await {
        log::warn!("join to {} failed: {err}", shared.server_url);
        return Ended::Closed;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
    *shared.outgoing.lock().await = Some(out_tx);
    *shared.state.write().await = ConnectionState::Connected;

    let period = shared.config.heartbeat_interval.max(Duration::from_millis(10));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            let _ = send_frame(&mut sink, &ClientMessage::Leave).await;
            let _ = sink.close().await;
            return Ended::Stopped;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            Some(message) = out_rx.recv() => {
                if send_frame(&mut sink, &message).await.is_err() {
                    return Ended::Closed;
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut sink, &ClientMessage::Heartbeat).await.is_err() {
                    return Ended::Closed;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let envelope = match Envelope::decode(text.as_str()) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            log::warn!("undecodable frame from {}: {err}", shared.server_url);
                            continue;
                        }
                    };
                    let reaction = shared.core.lock().await.handle(envelope);
                    for message in &reaction.outgoing {
                        if send_frame(&mut sink, message).await.is_err() {
                            return Ended::Closed;
                        }
                    }
                    for event in reaction.events {
                        shared.emit(event);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ended::Closed,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    log::debug!("websocket error from {}: {err}", shared.server_url);
                    return Ended::Closed;
                }
            },
        }
    }
}
