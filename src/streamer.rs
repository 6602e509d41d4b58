//! Per-connection value streamer
//!
//! Each client connection has a queue of entries whose value changed since
//! they were last delivered. Datastore observers [`publish`](ValueStreamer::publish)
//! into it, the client API drains it with
//! [`get_stream_chunk`](ValueStreamer::get_stream_chunk). An entry appears
//! at most once per queue, in first-publication order.
//!
//! A frozen connection keeps accumulating entries but delivers nothing until
//! it is unfrozen.

use crate::datastore::OwnerId;
use crate::types::EntryId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Client connection identifier. Connections watch entries under this id.
pub type ConnectionId = OwnerId;

/// Streamer shared between datastore observers and the client API
pub type SharedStreamer = Arc<Mutex<ValueStreamer>>;

/// Lock a shared streamer, recovering from poisoning
pub fn lock(streamer: &SharedStreamer) -> MutexGuard<'_, ValueStreamer> {
    streamer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ConnectionQueue {
    pending: Vec<EntryId>,
    queued: HashSet<EntryId>,
    frozen: bool,
}

impl ConnectionQueue {
    fn push(&mut self, id: EntryId) {
        if self.queued.insert(id) {
            self.pending.push(id);
        }
    }

    fn take(&mut self, max: usize) -> Vec<EntryId> {
        let n = max.min(self.pending.len());
        let chunk: Vec<EntryId> = self.pending.drain(..n).collect();
        for id in &chunk {
            self.queued.remove(id);
        }
        chunk
    }
}

/// Pending-update queues, one per connection
#[derive(Debug, Default)]
pub struct ValueStreamer {
    connections: HashMap<ConnectionId, ConnectionQueue>,
}

impl ValueStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedStreamer {
        Arc::new(Mutex::new(self))
    }

    /// Open a queue for `conn`. An existing queue is kept as is.
    pub fn new_connection(&mut self, conn: ConnectionId) {
        if self.connections.contains_key(&conn) {
            tracing::warn!("Streamer: connection {} already exists", conn);
            return;
        }
        self.connections.insert(conn, ConnectionQueue::default());
        tracing::debug!("Streamer: connection {} opened", conn);
    }

    /// Drop the queue of `conn` and everything pending in it
    pub fn clean_connection(&mut self, conn: ConnectionId) {
        if let Some(queue) = self.connections.remove(&conn) {
            tracing::debug!(
                "Streamer: connection {} closed with {} pending entries",
                conn,
                queue.pending.len()
            );
        }
    }

    pub fn has_connection(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Known connections, in no particular order
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Queue `entry` for `conn`. Unknown connections are ignored.
    pub fn publish(&mut self, entry: EntryId, conn: ConnectionId) {
        match self.connections.get_mut(&conn) {
            Some(queue) => queue.push(entry),
            None => tracing::trace!("Streamer: dropping {} for unknown connection {}", entry, conn),
        }
    }

    pub fn freeze_connection(&mut self, conn: ConnectionId) {
        if let Some(queue) = self.connections.get_mut(&conn) {
            queue.frozen = true;
        }
    }

    pub fn unfreeze_connection(&mut self, conn: ConnectionId) {
        if let Some(queue) = self.connections.get_mut(&conn) {
            queue.frozen = false;
        }
    }

    pub fn is_frozen(&self, conn: ConnectionId) -> bool {
        self.connections.get(&conn).is_some_and(|q| q.frozen)
    }

    /// Take every pending entry of `conn`. Empty when frozen or unknown.
    pub fn get_stream_chunk(&mut self, conn: ConnectionId) -> Vec<EntryId> {
        self.take_stream_chunk(conn, usize::MAX)
    }

    /// Take at most `max` pending entries of `conn`, oldest first
    pub fn take_stream_chunk(&mut self, conn: ConnectionId, max: usize) -> Vec<EntryId> {
        match self.connections.get_mut(&conn) {
            Some(queue) if !queue.frozen => queue.take(max),
            _ => Vec::new(),
        }
    }

    /// Number of entries queued for `conn`
    pub fn pending_count(&self, conn: ConnectionId) -> usize {
        self.connections.get(&conn).map_or(0, |q| q.pending.len())
    }

    /// True if any connection still has `entry` queued
    pub fn is_still_waiting_stream(&self, entry: EntryId) -> bool {
        self.connections.values().any(|q| q.queued.contains(&entry))
    }
}
