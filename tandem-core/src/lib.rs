//! # tandem-core — Operation transform and document model for Tandem
//!
//! Pure, synchronous building blocks of the collaboration engine. Nothing in
//! this crate performs I/O or spawns tasks; `tandem-collab` drives it.
//!
//! ## Architecture
//!
//! ```text
//!   Operation ──► transform() ──► Operation′
//!                    │
//!                    ▼
//!   ┌──────────────────────────────────────┐
//!   │ Document (version, path)             │
//!   │   ├── Plain(String)         ≤ limit  │
//!   │   └── Chunked(ChunkedDocument) > limit│
//!   │         ├── arena: ChunkId → Chunk   │
//!   │         └── order: [ChunkId]         │
//!   └──────────────────────────────────────┘
//!
//!   Replica (client side): local text + in-flight op + buffer
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: Insert/Delete operations addressed in chars
//! - [`transform`]: pairwise and transitive operational transform
//! - [`chunk`]: chunked representation for large documents
//! - [`document`]: versioned document with one-way chunk conversion
//! - [`replica`]: client-side replica with in-flight/buffered edits

pub mod chunk;
pub mod document;
pub mod error;
pub mod operation;
pub mod replica;
pub mod text;
pub mod transform;

pub use chunk::{
    ChunkConfig, ChunkDelta, ChunkId, ChunkInfo, ChunkManifest, ChunkStats, ChunkedDocument,
    DocumentChunk,
};
pub use document::{Document, DocumentSnapshot};
pub use error::CoreError;
pub use operation::{OpKind, Operation};
pub use replica::Replica;
pub use transform::{
    transform, transform_against_history, transform_components, transform_position,
    transform_position_by,
};
