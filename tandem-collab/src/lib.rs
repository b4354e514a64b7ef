//! # tandem-collab — Sessions, delivery and transport for Tandem
//!
//! Turns the pure model in `tandem-core` into a multi-user service:
//! sessions that serialize edits, a pool that fans messages out and retries
//! until acknowledged, and a WebSocket server and client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames    │             │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │ ClientLink
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────────┐
//! │ Replica     │                    │ SessionManager   │
//! │ per file    │                    │  ├─ SessionActor │ ── Session (documents, users)
//! └─────────────┘                    │  └─ Connection-  │
//!                                    │     Pool (retry) │
//!                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and the acknowledgeable envelope
//! - [`reliability`]: retry policy, outbox, liveness classification
//! - [`pool`]: connections, topic fan-out, acknowledgement tracking
//! - [`session`]: session state machine and its actor
//! - [`manager`]: session registry and background housekeeping
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with reconnection and replay
//! - [`config`]: configuration structs

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod reliability;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use client::{ClientState, ConnectionState, SyncClient, SyncEvent};
pub use config::{ClientConfig, HeartbeatConfig, PoolConfig, ServerConfig, SessionConfig};
pub use error::CollabError;
pub use manager::{ClientLink, JoinRequest, PerformanceStats, SessionManager};
pub use pool::{ConnectionId, ConnectionPool, PoolStats};
pub use protocol::{ClientMessage, Envelope, Position, ServerMessage};
pub use reliability::{Outbox, RetryPolicy, UserState};
pub use server::SyncServer;
pub use session::{Effect, Session, SessionHandle, SessionInfo};
