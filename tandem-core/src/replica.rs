//! Client-side replica of a server document.
//!
//! ```text
//!   local edit ──► [ inflight ] ──► server          (one op outstanding)
//!                  [ buffer   ]                      (queued behind it)
//!
//!   remote op R ──► transform(inflight, R) ──► transform(buffer…, R′) ──► apply
//!   ack(v)      ──► inflight = buffer.pop_front() rebased on v
//! ```
//!
//! Because the server serializes operations and a replica never has more
//! than one operation in flight, every replica ends at the server's content
//! once all acks and remote operations are processed.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::error::CoreError;
use crate::operation::{OpKind, Operation};
use crate::text;
use crate::transform::{transform, transform_position_by};

#[derive(Debug, Clone)]
pub struct Replica {
    client_id: String,
    content: String,
    length: usize,
    server_version: u64,
    inflight: Option<Operation>,
    buffer: VecDeque<Operation>,
}

impl Replica {
    pub fn new(client_id: impl Into<String>, content: &str, server_version: u64) -> Self {
        Self {
            client_id: client_id.into(),
            content: content.to_string(),
            length: text::char_len(content),
            server_version,
            inflight: None,
            buffer: VecDeque::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Last server version this replica has incorporated.
    pub fn server_version(&self) -> u64 {
        self.server_version
    }

    pub fn inflight(&self) -> Option<&Operation> {
        self.inflight.as_ref()
    }

    /// True when no local edit awaits acknowledgement.
    pub fn is_synced(&self) -> bool {
        self.inflight.is_none() && self.buffer.is_empty()
    }

    /// Unacknowledged local operations, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.inflight.iter().chain(self.buffer.iter())
    }

    /// Apply a local edit optimistically.
    ///
    /// Returns the operation to send now, or `None` when it was queued
    /// behind the one already in flight.
    pub fn local_edit(&mut self, kind: OpKind) -> Result<Option<Operation>, CoreError> {
        let op = Operation::new(self.client_id.clone(), self.server_version, kind);
        self.apply_local(&op)?;
        if self.inflight.is_some() {
            self.buffer.push_back(op);
            return Ok(None);
        }
        self.inflight = Some(op.clone());
        Ok(Some(op))
    }

    fn apply_local(&mut self, op: &Operation) -> Result<(), CoreError> {
        self.content = op.apply_to_str(&self.content)?;
        self.length = (self.length as isize + op.len_delta()) as usize;
        Ok(())
    }

    /// The server accepted the in-flight operation `op_id` at `server_version`.
    ///
    /// Returns the next buffered operation to send, rebased on that version.
    /// Acks for any other id are ignored.
    pub fn acknowledge(&mut self, op_id: Uuid, server_version: u64) -> Option<Operation> {
        if self.inflight.as_ref().map(|op| op.id) != Some(op_id) {
            log::debug!("replica {} ignoring ack for {op_id}", self.client_id);
            return None;
        }
        self.inflight = None;
        self.server_version = self.server_version.max(server_version);
        let mut next = self.buffer.pop_front()?;
        next.base_version = self.server_version;
        self.inflight = Some(next.clone());
        Some(next)
    }

    /// Incorporate an operation the server applied at `server_version`.
    ///
    /// An echo of our own in-flight operation (seen after reconnecting)
    /// counts as its acknowledgement; the return value is then the next
    /// operation to send.
    pub fn apply_remote(
        &mut self,
        op: &Operation,
        server_version: u64,
    ) -> Result<Option<Operation>, CoreError> {
        if self.inflight.as_ref().is_some_and(|inflight| inflight.id == op.id) {
            return Ok(self.acknowledge(op.id, server_version));
        }
        if server_version <= self.server_version {
            log::debug!(
                "replica {} skipping already applied version {server_version}",
                self.client_id
            );
            return Ok(None);
        }

        let mut remote = op.clone();
        if let Some(inflight) = self.inflight.take() {
            let (inflight, transformed) = transform(&inflight, &remote);
            self.inflight = Some(inflight);
            remote = transformed;
        }
        for buffered in self.buffer.iter_mut() {
            let (local, transformed) = transform(buffered, &remote);
            *buffered = local;
            remote = transformed;
        }

        self.apply_local(&remote)?;
        self.server_version = server_version;
        Ok(None)
    }

    /// Map a cursor through a remote operation as this replica applies it.
    pub fn transform_cursor(&self, position: usize, remote: &Operation) -> usize {
        transform_position_by(position, remote, false).min(self.length)
    }

    /// Replace local state with a server snapshot. Pending local edits are
    /// dropped and returned.
    pub fn resync(&mut self, content: &str, server_version: u64) -> Vec<Operation> {
        let dropped: Vec<Operation> = self.pending().cloned().collect();
        if !dropped.is_empty() {
            log::warn!(
                "replica {} resynced at version {server_version}, dropping {} pending edits",
                self.client_id,
                dropped.len()
            );
        }
        self.content = content.to_string();
        self.length = text::char_len(content);
        self.server_version = server_version;
        self.inflight = None;
        self.buffer.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::transform::transform_against_history;
    use crate::ChunkConfig;

    #[test]
    fn test_local_edit_sends_then_buffers() {
        let mut r = Replica::new("a", "hello", 0);
        let first = r.local_edit(OpKind::insert(5, "!")).unwrap();
        assert!(first.is_some());
        let second = r.local_edit(OpKind::insert(0, ">")).unwrap();
        assert!(second.is_none());
        assert_eq!(r.content(), ">hello!");
        assert_eq!(r.pending().count(), 2);
    }

    #[test]
    fn test_ack_releases_buffered_with_new_base() {
        let mut r = Replica::new("a", "hello", 3);
        let first = r.local_edit(OpKind::insert(5, "!")).unwrap().unwrap();
        r.local_edit(OpKind::insert(0, ">")).unwrap();
        let next = r.acknowledge(first.id, 4).unwrap();
        assert_eq!(next.base_version, 4);
        assert_eq!(r.server_version(), 4);
        assert!(r.acknowledge(Uuid::new_v4(), 9).is_none());
        assert!(r.acknowledge(next.id, 5).is_none());
        assert!(r.is_synced());
    }

    #[test]
    fn test_remote_against_inflight_converges_with_server() {
        let mut server = Document::open("f", "hello", ChunkConfig::default());
        let mut a = Replica::new("a", "hello", 0);
        let mut b = Replica::new("b", "hello", 0);

        let op_a = a.local_edit(OpKind::insert(0, "X")).unwrap().unwrap();
        let op_b = b.local_edit(OpKind::delete(1, 3)).unwrap().unwrap();

        // Server receives b first, then a.
        let v1 = server.apply(&op_b).unwrap();
        let a_prime = transform_against_history(&op_a, [&op_b]);
        let v2 = server.apply(&a_prime).unwrap();

        b.acknowledge(op_b.id, v1);
        b.apply_remote(&a_prime, v2).unwrap();
        a.apply_remote(&op_b, v1).unwrap();
        a.acknowledge(op_a.id, v2);

        assert_eq!(server.content(), "Xho");
        assert_eq!(a.content(), server.content());
        assert_eq!(b.content(), server.content());
        assert_eq!(a.server_version(), 2);
    }

    #[test]
    fn test_echo_of_inflight_counts_as_ack() {
        let mut r = Replica::new("a", "abc", 0);
        let op = r.local_edit(OpKind::insert(3, "d")).unwrap().unwrap();
        r.apply_remote(&op, 1).unwrap();
        assert!(r.is_synced());
        assert_eq!(r.content(), "abcd");
        assert_eq!(r.server_version(), 1);
    }

    #[test]
    fn test_resync_drops_pending() {
        let mut r = Replica::new("a", "abc", 0);
        r.local_edit(OpKind::insert(0, "x")).unwrap();
        let dropped = r.resync("server", 7);
        assert_eq!(dropped.len(), 1);
        assert_eq!(r.content(), "server");
        assert_eq!(r.len(), 6);
        assert!(r.is_synced());
    }
}
