//! Versioned document, stored plain or chunked.

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkConfig, ChunkId, ChunkManifest, ChunkedDocument, DocumentChunk};
use crate::error::CoreError;
use crate::operation::Operation;
use crate::text;

#[derive(Debug, Clone)]
enum Body {
    Plain { content: String, length: usize },
    Chunked(ChunkedDocument),
}

/// A named text document with a monotonically increasing version.
///
/// Every accepted operation bumps the version by exactly one, including
/// operations that transformed into no-ops. Once a document grows past
/// [`ChunkConfig::threshold`] it switches to chunked storage and stays
/// chunked.
#[derive(Debug, Clone)]
pub struct Document {
    path: String,
    version: u64,
    body: Body,
    config: ChunkConfig,
}

/// Serializable state handed to joining or reconnecting clients.
///
/// Plain documents carry their full content; chunked documents carry a
/// manifest and the client pulls chunks on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub path: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ChunkManifest>,
}

impl Document {
    pub fn open(path: impl Into<String>, content: &str, config: ChunkConfig) -> Self {
        let length = text::char_len(content);
        let body = if length > config.threshold {
            Body::Chunked(ChunkedDocument::from_content(content, config))
        } else {
            Body::Plain {
                content: content.to_string(),
                length,
            }
        };
        Self {
            path: path.into(),
            version: 0,
            body,
            config,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        match &self.body {
            Body::Plain { length, .. } => *length,
            Body::Chunked(doc) => doc.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.body, Body::Chunked(_))
    }

    pub fn content(&self) -> String {
        match &self.body {
            Body::Plain { content, .. } => content.clone(),
            Body::Chunked(doc) => doc.content(),
        }
    }

    /// Apply `op` atomically and return the new version.
    ///
    /// All components are validated before anything is mutated, so on
    /// error neither content nor version change.
    pub fn apply(&mut self, op: &Operation) -> Result<u64, CoreError> {
        op.validate(self.len())?;

        match &mut self.body {
            Body::Plain { content, length } => {
                for component in &op.components {
                    component.apply_to_string(content, length)?;
                }
            }
            Body::Chunked(doc) => {
                for component in &op.components {
                    doc.apply(component)?;
                }
            }
        }

        self.version += 1;
        self.maybe_convert();
        Ok(self.version)
    }

    fn maybe_convert(&mut self) {
        if let Body::Plain { content, length } = &self.body {
            if *length > self.config.threshold {
                let chunked = ChunkedDocument::from_content(content, self.config);
                log::info!(
                    "document {} crossed {} chars at version {}, switching to {} chunks",
                    self.path,
                    self.config.threshold,
                    self.version,
                    chunked.chunk_count()
                );
                self.body = Body::Chunked(chunked);
            }
        }
    }

    /// Direct access to the chunk store, if chunked.
    pub fn chunked(&self) -> Option<&ChunkedDocument> {
        match &self.body {
            Body::Chunked(doc) => Some(doc),
            Body::Plain { .. } => None,
        }
    }

    pub fn chunk(&self, id: ChunkId) -> Result<&DocumentChunk, CoreError> {
        match &self.body {
            Body::Chunked(doc) => doc.chunk(id),
            Body::Plain { .. } => Err(CoreError::ChunkNotFound(id)),
        }
    }

    pub fn manifest(&self) -> Option<ChunkManifest> {
        self.chunked().map(ChunkedDocument::manifest)
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        match &self.body {
            Body::Plain { content, .. } => DocumentSnapshot {
                path: self.path.clone(),
                version: self.version,
                content: Some(content.clone()),
                manifest: None,
            },
            Body::Chunked(doc) => DocumentSnapshot {
                path: self.path.clone(),
                version: self.version,
                content: None,
                manifest: Some(doc.manifest()),
            },
        }
    }

    /// Absolute char offset of `(row, column)`, clamped to the document.
    pub fn offset_of(&self, row: usize, column: usize) -> usize {
        match &self.body {
            Body::Plain { content, .. } => text::offset_of([content.as_str()], row, column),
            Body::Chunked(doc) => text::offset_of(doc.pieces(), row, column),
        }
    }

    /// `(row, column)` of an absolute char offset.
    pub fn row_col(&self, offset: usize) -> (usize, usize) {
        match &self.body {
            Body::Plain { content, .. } => text::row_col([content.as_str()], offset),
            Body::Chunked(doc) => text::row_col(doc.pieces(), offset),
        }
    }
}
