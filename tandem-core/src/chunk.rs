//! Chunked representation for large documents.
//!
//! Architecture:
//! ```text
//! order:  [ c3 ][ c7 ][ c1 ][ c9 ]        explicit ordered index
//!            │     │     │     │
//! arena:  ChunkId → DocumentChunk          stable ids, no pointers
//!
//! offsets: 0     256K  512K  768K  total    recomputed from `order`
//! ```
//!
//! Chunks always partition `[0, total_length)` with strictly increasing
//! `start_offset`. After every mutation chunks above `2 × target` are split
//! and neighbours both below `target / 2` are merged, so chunk count and
//! transfer size stay bounded.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::operation::OpKind;
use crate::text;

/// Stable identifier of a chunk within one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Chunking thresholds, in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Documents longer than this are stored chunked.
    pub threshold: usize,
    /// Preferred chunk size for splitting and rebalancing.
    pub target_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            threshold: 1024 * 1024,
            target_size: 256 * 1024,
        }
    }
}

impl ChunkConfig {
    fn target(&self) -> usize {
        self.target_size.max(1)
    }

    fn split_above(&self) -> usize {
        self.target() * 2
    }

    fn merge_below(&self) -> usize {
        self.target() / 2
    }
}

/// A contiguous range of a chunked document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: ChunkId,
    pub start_offset: usize,
    pub length: usize,
    pub content: String,
    /// Document revision of the last mutation touching this chunk.
    pub revision: u64,
}

impl DocumentChunk {
    pub fn end_offset(&self) -> usize {
        self.start_offset + self.length
    }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            chunk_id: self.chunk_id,
            start_offset: self.start_offset,
            length: self.length,
            revision: self.revision,
        }
    }
}

/// Chunk metadata without content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_id: ChunkId,
    pub start_offset: usize,
    pub length: usize,
    pub revision: u64,
}

/// Ordered chunk listing a client uses to fetch content piecewise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub total_length: usize,
    pub chunks: Vec<ChunkInfo>,
}

/// Chunks changed since a client's last known revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub changed: Vec<DocumentChunk>,
    pub removed: Vec<ChunkId>,
    pub total_length: usize,
}

/// Summary numbers for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub chunk_count: usize,
    pub total_length: usize,
    pub smallest_chunk: usize,
    pub largest_chunk: usize,
    pub target_size: usize,
}

/// A document stored as an ordered sequence of chunks.
#[derive(Debug, Clone)]
pub struct ChunkedDocument {
    arena: HashMap<ChunkId, DocumentChunk>,
    order: Vec<ChunkId>,
    next_id: u64,
    revision: u64,
    total_length: usize,
    config: ChunkConfig,
}

impl ChunkedDocument {
    /// Split `content` into chunks of `config.target_size` chars.
    pub fn from_content(content: &str, config: ChunkConfig) -> Self {
        let mut doc = Self {
            arena: HashMap::new(),
            order: Vec::new(),
            next_id: 0,
            revision: 0,
            total_length: 0,
            config,
        };
        for piece in text::split_chars(content, config.target()) {
            let id = doc.alloc_id();
            let length = text::char_len(&piece);
            doc.total_length += length;
            doc.arena.insert(
                id,
                DocumentChunk {
                    chunk_id: id,
                    start_offset: 0,
                    length,
                    content: piece,
                    revision: 0,
                },
            );
            doc.order.push(id);
        }
        doc.reindex(0);
        doc
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.total_length
    }

    pub fn is_empty(&self) -> bool {
        self.total_length == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.order.len()
    }

    /// Current mutation revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Chunks in offset order.
    pub fn chunks(&self) -> impl Iterator<Item = &DocumentChunk> + '_ {
        self.order.iter().filter_map(|id| self.arena.get(id))
    }

    /// Chunk contents in offset order.
    pub fn pieces(&self) -> impl Iterator<Item = &str> + '_ {
        self.chunks().map(|c| c.content.as_str())
    }

    /// Full content, concatenated in offset order.
    pub fn content(&self) -> String {
        let mut out = String::with_capacity(self.total_length);
        for piece in self.pieces() {
            out.push_str(piece);
        }
        out
    }

    pub fn chunk(&self, id: ChunkId) -> Result<&DocumentChunk, CoreError> {
        self.arena.get(&id).ok_or(CoreError::ChunkNotFound(id))
    }

    /// The chunk containing `position` (the last chunk for `position == len`).
    pub fn chunk_at(&self, position: usize) -> Option<&DocumentChunk> {
        if position > self.total_length {
            return None;
        }
        self.order
            .get(self.locate(position))
            .and_then(|id| self.arena.get(id))
    }

    pub fn manifest(&self) -> ChunkManifest {
        ChunkManifest {
            total_length: self.total_length,
            chunks: self.chunks().map(DocumentChunk::info).collect(),
        }
    }

    /// Chunks whose revision differs from `known`, plus ids no longer present.
    pub fn incremental_update(&self, known: &HashMap<ChunkId, u64>) -> ChunkDelta {
        let changed = self
            .chunks()
            .filter(|c| known.get(&c.chunk_id) != Some(&c.revision))
            .cloned()
            .collect();
        let mut removed: Vec<ChunkId> = known
            .keys()
            .filter(|id| !self.arena.contains_key(id))
            .copied()
            .collect();
        removed.sort();
        ChunkDelta {
            changed,
            removed,
            total_length: self.total_length,
        }
    }

    pub fn stats(&self) -> ChunkStats {
        let lengths: Vec<usize> = self.chunks().map(|c| c.length).collect();
        ChunkStats {
            chunk_count: self.order.len(),
            total_length: self.total_length,
            smallest_chunk: lengths.iter().copied().min().unwrap_or(0),
            largest_chunk: lengths.iter().copied().max().unwrap_or(0),
            target_size: self.config.target_size,
        }
    }

    /// Apply one component. The document is unchanged on error.
    pub fn apply(&mut self, component: &OpKind) -> Result<(), CoreError> {
        component.check_bounds(self.total_length)?;
        if component.is_noop() {
            return Ok(());
        }
        self.revision += 1;
        match component {
            OpKind::Insert { position, text } => self.insert(*position, text),
            OpKind::Delete { position, length } => self.delete(*position, *length),
        }
        self.rebalance();
        log::trace!(
            "chunked apply rev {} -> {} chunks, {} chars",
            self.revision,
            self.order.len(),
            self.total_length
        );
        Ok(())
    }

    fn insert(&mut self, position: usize, inserted: &str) {
        let idx = self.locate(position);
        let revision = self.revision;
        let added = text::char_len(inserted);
        if let Some(chunk) = self.order.get(idx).and_then(|id| self.arena.get_mut(id)) {
            text::insert_at(&mut chunk.content, position - chunk.start_offset, inserted);
            chunk.length += added;
            chunk.revision = revision;
        }
        self.total_length += added;
        self.reindex(idx + 1);
    }

    fn delete(&mut self, position: usize, length: usize) {
        let first = self.locate(position);
        let revision = self.revision;
        let mut idx = first;
        let mut remaining = length;
        let mut local_start = self
            .order
            .get(first)
            .and_then(|id| self.arena.get(id))
            .map_or(0, |c| position - c.start_offset);

        while remaining > 0 && idx < self.order.len() {
            let id = self.order[idx];
            let Some(chunk) = self.arena.get_mut(&id) else {
                break;
            };
            let take = remaining.min(chunk.length - local_start);
            text::remove_range(&mut chunk.content, local_start, take);
            chunk.length -= take;
            chunk.revision = revision;
            remaining -= take;
            local_start = 0;

            if chunk.length == 0 && self.order.len() > 1 {
                self.arena.remove(&id);
                self.order.remove(idx);
            } else {
                idx += 1;
            }
        }

        self.total_length -= length;
        self.reindex(first.min(self.order.len().saturating_sub(1)));
    }

    /// Index into `order` of the last chunk starting at or before `position`.
    fn locate(&self, position: usize) -> usize {
        let after = self.order.partition_point(|id| {
            self.arena
                .get(id)
                .is_some_and(|c| c.start_offset <= position)
        });
        after.saturating_sub(1)
    }

    fn reindex(&mut self, from: usize) {
        let mut offset = match from.checked_sub(1).and_then(|i| self.order.get(i)) {
            Some(prev) => self.arena.get(prev).map_or(0, DocumentChunk::end_offset),
            None => 0,
        };
        for id in &self.order[from.min(self.order.len())..] {
            if let Some(chunk) = self.arena.get_mut(id) {
                chunk.start_offset = offset;
                offset += chunk.length;
            }
        }
    }

    fn alloc_id(&mut self) -> ChunkId {
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        id
    }

    fn rebalance(&mut self) {
        let split_above = self.config.split_above();
        let merge_below = self.config.merge_below();
        let target = self.config.target();
        let revision = self.revision;

        // Split oversized chunks; the first piece keeps the id.
        let mut idx = 0;
        while idx < self.order.len() {
            let id = self.order[idx];
            let oversized = self.arena.get(&id).is_some_and(|c| c.length > split_above);
            if !oversized {
                idx += 1;
                continue;
            }
            let pieces = match self.arena.get(&id) {
                Some(chunk) => text::split_chars(&chunk.content, target),
                None => break,
            };
            let count = pieces.len();
            let mut pieces = pieces.into_iter();
            if let (Some(head), Some(chunk)) = (pieces.next(), self.arena.get_mut(&id)) {
                chunk.length = text::char_len(&head);
                chunk.content = head;
                chunk.revision = revision;
            }
            for (offset, piece) in pieces.enumerate() {
                let new_id = self.alloc_id();
                self.arena.insert(
                    new_id,
                    DocumentChunk {
                        chunk_id: new_id,
                        start_offset: 0,
                        length: text::char_len(&piece),
                        content: piece,
                        revision,
                    },
                );
                self.order.insert(idx + 1 + offset, new_id);
            }
            log::debug!("split oversized {id} into {count} chunks");
            idx += count;
        }

        // Merge undersized neighbours into the left chunk.
        let mut idx = 0;
        while idx + 1 < self.order.len() {
            let (left, right) = (self.order[idx], self.order[idx + 1]);
            let small = |id: &ChunkId| self.arena.get(id).is_some_and(|c| c.length < merge_below);
            if !(small(&left) && small(&right)) {
                idx += 1;
                continue;
            }
            if let Some(absorbed) = self.arena.remove(&right) {
                if let Some(chunk) = self.arena.get_mut(&left) {
                    chunk.content.push_str(&absorbed.content);
                    chunk.length += absorbed.length;
                    chunk.revision = revision;
                }
            }
            self.order.remove(idx + 1);
            log::debug!("merged {right} into {left}");
        }

        self.reindex(0);
    }

    /// Verify the partition invariant: contiguous, gap-free, ordered chunks
    /// whose lengths match their content and sum to the total.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.order.is_empty() {
            return Err("no chunks".into());
        }
        if self.order.len() != self.arena.len() {
            return Err(format!(
                "index has {} ids but arena holds {} chunks",
                self.order.len(),
                self.arena.len()
            ));
        }
        let mut expected = 0;
        for chunk in self.chunks() {
            if chunk.start_offset != expected {
                return Err(format!(
                    "{} starts at {} but previous chunk ended at {expected}",
                    chunk.chunk_id, chunk.start_offset
                ));
            }
            if text::char_len(&chunk.content) != chunk.length {
                return Err(format!("{} length does not match its content", chunk.chunk_id));
            }
            if chunk.length == 0 && self.order.len() > 1 {
                return Err(format!("{} is empty", chunk.chunk_id));
            }
            expected += chunk.length;
        }
        if expected != self.total_length {
            return Err(format!(
                "chunks cover {expected} chars, document has {}",
                self.total_length
            ));
        }
        Ok(())
    }
}
