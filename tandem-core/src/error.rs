//! Error kinds raised by the document model and transform engine.

use crate::chunk::ChunkId;

/// Errors from applying or resolving operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// A (transformed) operation still points outside the document.
    #[error("range {position}+{length} exceeds document length {document_length}")]
    Range {
        position: usize,
        length: usize,
        document_length: usize,
    },

    /// The chunk id is not part of the current manifest.
    #[error("chunk {0} not found")]
    ChunkNotFound(ChunkId),

    /// The base version predates the retained history.
    #[error("base version {base_version} predates history (oldest {oldest_available})")]
    StaleOperation {
        base_version: u64,
        oldest_available: u64,
    },

    /// The base version is newer than anything the document has seen.
    #[error("base version {base_version} is ahead of document version {current}")]
    FutureVersion { base_version: u64, current: u64 },
}
