//! Delivery guarantees on top of an unreliable connection.
//!
//! ```text
//!  send ──► Outbox.track(id) ──► pending ──ack(id)──► removed
//!                                   │
//!                          poll_due(now): resend with backoff
//!                                   │
//!                       attempts > max ──► ConnectionLost
//! ```
//!
//! Liveness is derived from heartbeat timestamps: silence past
//! `idle_after` makes a user Idle, past `disconnect_after` Disconnected.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::error::CollabError;

/// Exponential backoff for unacknowledged messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(rename = "initial_interval_ms", with = "duration_ms")]
    pub initial_interval: Duration,
    #[serde(rename = "max_interval_ms", with = "duration_ms")]
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Resends allowed before the connection is declared lost.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before resend number `attempt` (0 = wait after the first send).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// A message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message_id: u64,
    pub payload: Arc<str>,
    pub sent_at: Instant,
    pub retries: u32,
    pub next_retry: Instant,
}

/// Per-connection set of unacknowledged messages.
#[derive(Debug)]
pub struct Outbox {
    pending: BTreeMap<u64, PendingMessage>,
    policy: RetryPolicy,
}

impl Outbox {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            pending: BTreeMap::new(),
            policy,
        }
    }

    /// Start tracking a message that was just sent.
    pub fn track(&mut self, message_id: u64, payload: Arc<str>, now: Instant) {
        self.pending.insert(
            message_id,
            PendingMessage {
                message_id,
                payload,
                sent_at: now,
                retries: 0,
                next_retry: now + self.policy.backoff(0),
            },
        );
    }

    /// Remove an acknowledged message. Returns `false` for unknown or
    /// already acknowledged ids, leaving the outbox untouched.
    pub fn acknowledge(&mut self, message_id: u64) -> bool {
        self.pending.remove(&message_id).is_some()
    }

    /// Messages whose retry deadline has passed, oldest first.
    ///
    /// Each returned message has its retry count bumped and its next
    /// deadline pushed out. Fails once any message has used up
    /// `max_attempts` resends.
    pub fn poll_due(&mut self, now: Instant) -> Result<Vec<(u64, Arc<str>)>, CollabError> {
        let mut due = Vec::new();
        for pending in self.pending.values_mut() {
            if pending.next_retry > now {
                continue;
            }
            if pending.retries >= self.policy.max_attempts {
                return Err(CollabError::ConnectionLost(
                    CollabError::AckTimeout {
                        message_id: pending.message_id,
                        attempts: pending.retries + 1,
                    }
                    .to_string(),
                ));
            }
            pending.retries += 1;
            pending.next_retry = now + self.policy.backoff(pending.retries);
            due.push((pending.message_id, pending.payload.clone()));
        }
        Ok(due)
    }

    pub fn get(&self, message_id: u64) -> Option<&PendingMessage> {
        self.pending.get(&message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything. Returns how many messages were cancelled.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

/// Presence state of a session user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Active,
    Idle,
    Disconnected,
}

/// Heartbeat thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub idle_after: Duration,
    pub disconnect_after: Duration,
}

impl Liveness {
    pub fn classify(&self, last_heartbeat: Instant, now: Instant) -> UserState {
        let silent = now.saturating_duration_since(last_heartbeat);
        if silent >= self.disconnect_after {
            UserState::Disconnected
        } else if silent >= self.idle_after {
            UserState::Idle
        } else {
            UserState::Active
        }
    }
}

/// Remembers the last `capacity` message ids so resent messages are
/// processed once.
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records `id`; `false` when it was already seen.
    pub fn first_time(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}
