//! Connection pool with topic-based fan-out.
//!
//! ```text
//!   topics: "session:{id}"        → Arc<[conn, conn, conn]>
//!           "doc:{id}:{path}"     → Arc<[conn, conn]>
//!                                        │
//!   connections: ConnectionId → { mpsc sender, Outbox, last_activity }
//! ```
//!
//! Subscriber lists are copy-on-write: subscribe/unsubscribe rebuild the
//! list under the write lock, broadcast clones the `Arc` under a short read
//! lock and iterates without holding it. A message is encoded once per
//! broadcast and the same payload is queued to every subscriber.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{Envelope, ServerMessage};
use crate::reliability::{Outbox, RetryPolicy};

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Topic carrying presence and chat for a session.
pub fn session_topic(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

/// Topic carrying edits and cursors for one document.
pub fn document_topic(session_id: Uuid, file_path: &str) -> String {
    format!("doc:{session_id}:{file_path}")
}

/// Who owns a connection, for routing loss notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOwner {
    pub session_id: Uuid,
    pub client_id: String,
}

struct Connection {
    owner: ConnectionOwner,
    sender: mpsc::Sender<Arc<str>>,
    outbox: Mutex<Outbox>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    /// Queue a frame. Returns false once the receiving side is gone.
    fn push(&self, payload: Arc<str>, stats: &AtomicPoolStats) -> bool {
        match self.sender.try_send(payload) {
            Ok(()) => {
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                // Still tracked in the outbox; the retry pass resends it.
                stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("outbound queue full for client {}", self.owner.client_id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: usize,
    pub topics: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub retries: u64,
    pub acknowledged: u64,
    pub pending: usize,
}

#[derive(Default)]
struct AtomicPoolStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    retries: AtomicU64,
    acknowledged: AtomicU64,
}

/// Registry of live connections grouped by topic.
pub struct ConnectionPool {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    topics: RwLock<HashMap<String, Arc<Vec<ConnectionId>>>>,
    next_message_id: AtomicU64,
    retry: RetryPolicy,
    outbound_capacity: usize,
    stats: AtomicPoolStats,
}

impl ConnectionPool {
    pub fn new(retry: RetryPolicy, outbound_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
            retry,
            outbound_capacity: outbound_capacity.max(1),
            stats: AtomicPoolStats::default(),
        }
    }

    /// Register a connection. The receiver yields encoded [`Envelope`]s.
    pub async fn add_connection(
        &self,
        owner: ConnectionOwner,
    ) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.outbound_capacity);
        let connection = Arc::new(Connection {
            owner,
            sender,
            outbox: Mutex::new(Outbox::new(self.retry)),
            last_activity: Mutex::new(Instant::now()),
        });
        self.connections.write().await.insert(id, connection);
        log::debug!("connection {id} registered");
        (id, receiver)
    }

    /// Drop a connection: unsubscribe it everywhere and cancel its pending
    /// messages. Returns its owner if it was registered.
    pub async fn remove_connection(&self, id: ConnectionId) -> Option<ConnectionOwner> {
        let removed = self.connections.write().await.remove(&id)?;
        {
            let mut topics = self.topics.write().await;
            topics.retain(|_, subscribers| {
                if subscribers.contains(&id) {
                    let remaining: Vec<ConnectionId> =
                        subscribers.iter().copied().filter(|c| *c != id).collect();
                    *subscribers = Arc::new(remaining);
                }
                !subscribers.is_empty()
            });
        }
        let cancelled = removed.outbox.lock().await.clear();
        log::debug!("connection {id} removed, {cancelled} pending messages cancelled");
        Some(removed.owner.clone())
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn owner(&self, id: ConnectionId) -> Option<ConnectionOwner> {
        self.connections.read().await.get(&id).map(|c| c.owner.clone())
    }

    /// Add `id` to `topic`. Returns false if the connection is gone.
    pub async fn subscribe(&self, id: ConnectionId, topic: &str) -> bool {
        // Held until the topic is updated so a concurrent removal either
        // happens first or cleans this subscription up.
        let connections = self.connections.read().await;
        if !connections.contains_key(&id) {
            log::debug!("not subscribing removed connection {id} to {topic}");
            return false;
        }
        let mut topics = self.topics.write().await;
        let subscribers = topics.entry(topic.to_string()).or_default();
        if !subscribers.contains(&id) {
            let mut updated = Vec::with_capacity(subscribers.len() + 1);
            updated.extend(subscribers.iter().copied());
            updated.push(id);
            *subscribers = Arc::new(updated);
        }
        true
    }

    pub async fn unsubscribe(&self, id: ConnectionId, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            let remaining: Vec<ConnectionId> =
                subscribers.iter().copied().filter(|c| *c != id).collect();
            if remaining.is_empty() {
                topics.remove(topic);
            } else {
                *subscribers = Arc::new(remaining);
            }
        }
    }

    /// Current subscribers of `topic`.
    pub async fn subscribers(&self, topic: &str) -> Arc<Vec<ConnectionId>> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn envelope(&self, message: &ServerMessage) -> Result<(u64, Arc<str>), CollabError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let encoded = Envelope {
            message_id,
            message: message.clone(),
        }
        .encode()?;
        Ok((message_id, Arc::from(encoded)))
    }

    /// Send to every subscriber of `topic` except `exclude`. Returns the
    /// number of connections the message was queued to.
    pub async fn broadcast(
        &self,
        topic: &str,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, CollabError> {
        let subscribers = self.subscribers(topic).await;
        if subscribers.iter().all(|id| Some(*id) == exclude) {
            return Ok(0);
        }

        let (message_id, payload) = self.envelope(message)?;
        let now = Instant::now();
        let targets: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            subscribers
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };

        let mut delivered = 0;
        for connection in targets {
            connection.outbox.lock().await.track(message_id, payload.clone(), now);
            if connection.push(payload.clone(), &self.stats) {
                delivered += 1;
            }
        }
        log::trace!("broadcast {} #{message_id} on {topic} to {delivered}", message.kind());
        Ok(delivered)
    }

    /// Send to one connection.
    pub async fn send_to(
        &self,
        id: ConnectionId,
        message: &ServerMessage,
    ) -> Result<u64, CollabError> {
        let connection = self
            .connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CollabError::ConnectionLost(id.to_string()))?;
        let (message_id, payload) = self.envelope(message)?;
        connection
            .outbox
            .lock()
            .await
            .track(message_id, payload.clone(), Instant::now());
        if !connection.push(payload, &self.stats) {
            return Err(CollabError::ConnectionLost(id.to_string()));
        }
        log::trace!("sent {} #{message_id} to {id}", message.kind());
        Ok(message_id)
    }

    /// Record a client acknowledgement. Duplicates return `false`.
    pub async fn acknowledge(&self, id: ConnectionId, message_id: u64) -> bool {
        let Some(connection) = self.connections.read().await.get(&id).cloned() else {
            return false;
        };
        *connection.last_activity.lock().await = Instant::now();
        let removed = connection.outbox.lock().await.acknowledge(message_id);
        if removed {
            self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Mark inbound activity on a connection.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(connection) = self.connections.read().await.get(&id).cloned() {
            *connection.last_activity.lock().await = Instant::now();
        }
    }

    /// Resend overdue messages. Returns connections whose retries ran out;
    /// they are removed from the pool.
    pub async fn poll_retries(&self, now: Instant) -> Vec<(ConnectionId, ConnectionOwner)> {
        let snapshot: Vec<(ConnectionId, Arc<Connection>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect();

        let mut lost = Vec::new();
        for (id, connection) in snapshot {
            let due = connection.outbox.lock().await.poll_due(now);
            match due {
                Ok(resend) => {
                    for (message_id, payload) in resend {
                        log::debug!("resending #{message_id} to {id}");
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        if !connection.push(payload, &self.stats) {
                            break;
                        }
                    }
                }
                Err(err) => {
                    log::warn!("client {} on {id}: {err}", connection.owner.client_id);
                    lost.push(id);
                }
            }
        }

        let mut removed = Vec::with_capacity(lost.len());
        for id in lost {
            if let Some(owner) = self.remove_connection(id).await {
                removed.push((id, owner));
            }
        }
        removed
    }

    /// Close connections without inbound activity for `window`.
    pub async fn close_idle(
        &self,
        window: Duration,
        now: Instant,
    ) -> Vec<(ConnectionId, ConnectionOwner)> {
        let snapshot: Vec<(ConnectionId, Arc<Connection>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect();

        let mut idle = Vec::new();
        for (id, connection) in snapshot {
            let last = *connection.last_activity.lock().await;
            if now.saturating_duration_since(last) >= window {
                idle.push(id);
            }
        }

        let mut closed = Vec::with_capacity(idle.len());
        for id in idle {
            if let Some(owner) = self.remove_connection(id).await {
                log::info!("closed idle connection {id} of client {}", owner.client_id);
                closed.push((id, owner));
            }
        }
        closed
    }

    /// Pending (unacknowledged) messages for one connection.
    pub async fn pending(&self, id: ConnectionId) -> usize {
        match self.connections.read().await.get(&id).cloned() {
            Some(connection) => connection.outbox.lock().await.len(),
            None => 0,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Remove every connection.
    pub async fn clear(&self) {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            self.remove_connection(id).await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        let mut pending = 0;
        for connection in &connections {
            pending += connection.outbox.lock().await.len();
        }
        PoolStats {
            connections: connections.len(),
            topics: self.topics.read().await.len(),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            acknowledged: self.stats.acknowledged.load(Ordering::Relaxed),
            pending,
        }
    }
}
