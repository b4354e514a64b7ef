//! Process-wide registry of sessions.
//!
//! Architecture:
//! ```text
//!                      SessionManager
//!        ┌───────────────┼──────────────────────┐
//!        ▼               ▼                      ▼
//!  sessions: id → SessionHandle   ConnectionPool   background tasks
//!        │                              ▲           ├── retry/ack pass
//!        │ mpsc<SessionCommand>         │           ├── idle connections
//!        ▼                              │           └── empty sessions
//!   SessionActor ──── effects ──────────┘
//!
//!  ClientLink: inbound mpsc ──► connection task ──► SessionHandle
//!              outbound mpsc ◄── ConnectionPool
//! ```
//!
//! Nothing here is global: the server (or an embedding application)
//! constructs one manager, calls [`SessionManager::start`], and tears it
//! down with [`SessionManager::stop`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_core::{ChunkId, OpKind, Operation};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::pool::{ConnectionId, ConnectionOwner, ConnectionPool};
use crate::protocol::{ClientMessage, Envelope, Position};
use crate::reliability::RecentIds;
use crate::session::{EditMetrics, Session, SessionHandle, SessionInfo};

/// Aggregated counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub messages_dropped: u64,
    pub retries: u64,
    pub acknowledged: u64,
    pub pending_acks: usize,
    pub edits_applied: u64,
    pub edit_errors: u64,
    pub mean_edit_latency_us: u64,
    pub max_edit_latency_us: u64,
    pub active_sessions: usize,
    pub active_connections: usize,
    pub topics: usize,
    pub chunked_documents: usize,
    pub connections_lost: u64,
}

/// Parameters of a join.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    /// Existing session to join; `None` starts a new one.
    pub session_id: Option<Uuid>,
    pub name: String,
    /// Previously assigned id, to resume after a disconnect.
    pub client_id: Option<String>,
    /// Last server version seen per file.
    pub last_versions: HashMap<String, u64>,
}

impl JoinRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn resume(
        mut self,
        client_id: impl Into<String>,
        last_versions: HashMap<String, u64>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.last_versions = last_versions;
        self
    }
}

/// One participant's two-way channel into a session.
pub struct ClientLink {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub session_id: Uuid,
    pub reconnected: bool,
    inbound: mpsc::Sender<ClientMessage>,
    outbound: mpsc::Receiver<Arc<str>>,
    auto_ack: bool,
    seen: RecentIds,
}

impl ClientLink {
    /// Acknowledge every envelope returned by [`ClientLink::recv`]
    /// (default) or leave it to the caller.
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.auto_ack = auto_ack;
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), CollabError> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| CollabError::ConnectionLost(self.connection_id.to_string()))
    }

    pub async fn open(&self, file_path: &str, content: &str) -> Result<(), CollabError> {
        self.send(ClientMessage::Open {
            file_path: file_path.to_string(),
            content: content.to_string(),
        })
        .await
    }

    /// Submit a single-component edit created against `version`.
    pub async fn edit(
        &self,
        file_path: &str,
        kind: OpKind,
        version: u64,
    ) -> Result<Operation, CollabError> {
        let operation = Operation::new(self.client_id.clone(), version, kind);
        self.send(ClientMessage::Edit {
            file_path: file_path.to_string(),
            operation: operation.clone(),
            version,
        })
        .await?;
        Ok(operation)
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

    pub async fn heartbeat(&self) -> Result<(), CollabError> {
        self.send(ClientMessage::Heartbeat).await
    }

    pub async fn ack(&self, message_id: u64) -> Result<(), CollabError> {
        self.send(ClientMessage::Ack { message_id }).await
    }

    pub async fn get_chunk(&self, file_path: &str, chunk_id: ChunkId) -> Result<(), CollabError> {
        self.send(ClientMessage::GetChunk {
            file_path: file_path.to_string(),
            chunk_id,
        })
        .await
    }

    pub async fn get_manifest(&self, file_path: &str) -> Result<(), CollabError> {
        self.send(ClientMessage::GetManifest {
            file_path: file_path.to_string(),
        })
        .await
    }

    pub async fn leave(self) -> Result<(), CollabError> {
        self.send(ClientMessage::Leave).await
    }

    /// Next encoded envelope, exactly as the pool queued it. Retries may
    /// repeat an envelope.
    pub async fn recv_raw(&mut self) -> Option<Arc<str>> {
        self.outbound.recv().await
    }

    /// Next envelope not seen before. `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.outbound.recv().await?;
            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::error!("undecodable frame on {}: {err}", self.connection_id);
                    continue;
                }
            };
            if self.auto_ack {
                let _ = self.ack(envelope.message_id).await;
            }
            if self.seen.first_time(envelope.message_id) {
                return Some(envelope);
            }
        }
    }
}

#[derive(Default)]
struct ManagerCounters {
    messages_in: AtomicU64,
    connections_lost: AtomicU64,
}

/// Registry of live sessions plus the shared connection pool.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<ServerConfig>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    metrics: Arc<EditMetrics>,
    counters: Arc<ManagerCounters>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    running: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.retry, config.pool.outbound_capacity));
        Self {
            config: Arc::new(config),
            pool,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(EditMetrics::default()),
            counters: Arc::new(ManagerCounters::default()),
            tasks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start background housekeeping. Calling twice is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let retry_tick = (self.config.retry.initial_interval / 4).max(Duration::from_millis(10));
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_periodic(retry_tick, |manager| async move {
            let lost = manager.pool.poll_retries(Instant::now()).await;
            manager.report_lost(lost).await;
        }));
        tasks.push(
            self.spawn_periodic(self.config.pool.cleanup_interval, |manager| async move {
                let idle = manager
                    .pool
                    .close_idle(manager.config.pool.idle_timeout, Instant::now())
                    .await;
                manager.report_lost(idle).await;
            }),
        );
        tasks.push(
            self.spawn_periodic(self.config.cleanup_interval, |manager| async move {
                manager.close_expired_sessions().await;
            }),
        );
        log::info!("session manager started");
    }

    fn spawn_periodic<F, Fut>(&self, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(SessionManager) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let manager = self.clone();
        let period = period.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick(manager.clone()).await;
            }
        })
    }

    /// Stop housekeeping, close every session and drop every connection.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let handles: Vec<SessionHandle> =
            self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.close().await;
        }
        self.pool.clear().await;
        log::info!("session manager stopped, {} sessions closed", handles.len());
    }

    async fn report_lost(&self, lost: Vec<(ConnectionId, ConnectionOwner)>) {
        for (connection, owner) in lost {
            self.counters.connections_lost.fetch_add(1, Ordering::Relaxed);
            log::info!("connection {connection} of client {} lost", owner.client_id);
            if let Some(handle) = self.session(owner.session_id).await {
                let _ = handle.connection_lost(&owner.client_id, connection).await;
            }
        }
    }

    async fn close_expired_sessions(&self) {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let now = Instant::now();
        for handle in handles {
            let expired = match handle.info().await {
                Ok(info) => info.empty_since.is_some_and(|since| {
                    now.saturating_duration_since(since) >= self.config.session_grace
                }),
                Err(_) => true,
            };
            if expired {
                log::info!("session {} expired", handle.id());
                let _ = self.close_session(handle.id()).await;
            }
        }
    }

    /// Create an empty session.
    pub async fn create_session(&self, name: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        let name = name.into();
        log::info!("creating session {id} ({name})");
        let session = Session::new(id, name, self.config.session, Instant::now());
        let (handle, _task) = SessionHandle::spawn(
            session,
            self.pool.clone(),
            self.metrics.clone(),
            self.config.command_capacity,
        );
        self.sessions.write().await.insert(id, handle);
        id
    }

    pub async fn session(&self, session_id: Uuid) -> Option<SessionHandle> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn close_session(&self, session_id: Uuid) -> Result<(), CollabError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
        handle.close().await;
        Ok(())
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(info) = handle.info().await {
                infos.push(info);
            }
        }
        infos
    }

    /// Join (or resume) a session and get a link for the participant.
    pub async fn join(&self, request: JoinRequest) -> Result<ClientLink, CollabError> {
        let session_id = match request.session_id {
            Some(id) => id,
            None => self.create_session(format!("{}'s session", request.name)).await,
        };
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;

        let client_id = request
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let owner = ConnectionOwner {
            session_id,
            client_id: client_id.clone(),
        };
        let (connection_id, outbound) = self.pool.add_connection(owner).await;

        let outcome = match handle
            .join(client_id, request.name, connection_id, request.last_versions)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.pool.remove_connection(connection_id).await;
                return Err(err);
            }
        };

        let (inbound, inbound_rx) = mpsc::channel(self.config.command_capacity.max(1));
        tokio::spawn(pump_inbound(
            self.clone(),
            handle,
            outcome.client_id.clone(),
            connection_id,
            inbound_rx,
        ));

        Ok(ClientLink {
            connection_id,
            client_id: outcome.client_id,
            session_id,
            reconnected: outcome.reconnected,
            inbound,
            outbound,
            auto_ack: true,
            seen: RecentIds::new(4096),
        })
    }

    pub async fn stats(&self) -> PerformanceStats {
        let pool = self.pool.stats().await;
        let sessions = self.sessions().await;
        PerformanceStats {
            messages_in: self.counters.messages_in.load(Ordering::Relaxed),
            messages_out: pool.messages_sent,
            messages_dropped: pool.messages_dropped,
            retries: pool.retries,
            acknowledged: pool.acknowledged,
            pending_acks: pool.pending,
            edits_applied: self.metrics.edits_applied(),
            edit_errors: self.metrics.edit_errors(),
            mean_edit_latency_us: self.metrics.mean_latency_us(),
            max_edit_latency_us: self.metrics.max_latency_us(),
            active_sessions: sessions.len(),
            active_connections: pool.connections,
            topics: pool.topics,
            chunked_documents: sessions.iter().map(|s| s.chunked_documents).sum(),
            connections_lost: self.counters.connections_lost.load(Ordering::Relaxed),
        }
    }
}

/// Forward one participant's messages to its session. Acks are settled
/// against the pool directly; everything else is queued to the actor.
async fn pump_inbound(
    manager: SessionManager,
    handle: SessionHandle,
    client_id: String,
    connection: ConnectionId,
    mut inbound: mpsc::Receiver<ClientMessage>,
) {
    let mut left = false;
    while let Some(message) = inbound.recv().await {
        manager.counters.messages_in.fetch_add(1, Ordering::Relaxed);
        if !manager.pool.contains(connection).await {
            break;
        }
        manager.pool.touch(connection).await;
        match message {
            ClientMessage::Ack { message_id } => {
                if !manager.pool.acknowledge(connection, message_id).await {
                    log::trace!("duplicate ack #{message_id} from {client_id}");
                }
            }
            message => {
                left = matches!(message, ClientMessage::Leave);
                log::trace!("{client_id} -> {}", message.kind());
                if handle
                    .submit(&client_id, connection, message, Instant::now())
                    .await
                    .is_err()
                {
                    break;
                }
                if left {
                    break;
                }
            }
        }
    }

    if !left {
        let _ = handle.connection_lost(&client_id, connection).await;
    }
    manager.pool.remove_connection(connection).await;
    log::debug!("connection task for {client_id} on {connection} finished");
}
