use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher, RandomState};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// Capacity of a connection's outbound buffer. A full buffer means the
/// consumer is too slow to keep up; delivery fails fast instead of queueing.
pub const OUTBOUND_BUFFER: usize = 64;

const SHARD_COUNT: usize = 16;

/// Messages pushed into a session's outbound channel.
#[derive(Debug)]
pub enum SessionMessage {
    /// Forward an event to the client.
    Event(GatewayEvent),
    /// A newer connection for the same user took over; close this transport.
    Superseded,
}

/// Handle to one live connection. Lives exactly as long as one physical
/// WebSocket; a reconnecting user gets a fresh handle with a fresh `conn_id`.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_id: Uuid,
    pub conn_id: Uuid,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<SessionMessage>,
}

impl ConnectionHandle {
    pub fn new(user_id: Uuid) -> (Self, mpsc::Receiver<SessionMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = Self {
            user_id,
            conn_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            tx,
        };
        (handle, rx)
    }

    /// Non-blocking push into the connection's outbound buffer. Errors on a
    /// full buffer or a torn-down connection; the caller decides what a
    /// failed push means.
    pub fn push(&self, msg: SessionMessage) -> Result<(), TrySendError<SessionMessage>> {
        self.tx.try_send(msg)
    }
}

/// Authoritative map from user to its single live connection.
///
/// Sharded so connect/disconnect traffic for unrelated users lands on
/// different locks. Every operation is a pure in-memory map op; no lock is
/// ever held across I/O — pushes go through the handle's channel after the
/// lookup returns.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    shards: Vec<RwLock<HashMap<Uuid, ConnectionHandle>>>,
    hasher: RandomState,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(RegistryInner {
                shards,
                hasher: RandomState::new(),
            }),
        }
    }

    fn shard(&self, user_id: &Uuid) -> &RwLock<HashMap<Uuid, ConnectionHandle>> {
        let mut hasher = self.inner.hasher.build_hasher();
        user_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % SHARD_COUNT;
        &self.inner.shards[idx]
    }

    /// Insert or replace the connection for `handle.user_id`. Returns the
    /// superseded handle, if any, so the caller can close its transport —
    /// last-connection-wins.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut shard = self
            .shard(&handle.user_id)
            .write()
            .expect("registry lock poisoned");
        shard.insert(handle.user_id, handle)
    }

    /// Remove the entry for `user_id` only if it is still owned by
    /// `conn_id`. A stale disconnect racing a quick reconnect is a no-op and
    /// leaves the newer connection in place. Returns whether removal happened.
    pub fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut shard = self.shard(&user_id).write().expect("registry lock poisoned");
        match shard.get(&user_id) {
            Some(current) if current.conn_id == conn_id => {
                shard.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Point read for dispatch. The result can be stale by the time it is
    /// used (the connection may have just closed) — delivery through it is
    /// best-effort by contract.
    pub fn lookup(&self, user_id: Uuid) -> Option<ConnectionHandle> {
        let shard = self.shard(&user_id).read().expect("registry lock poisoned");
        shard.get(&user_id).cloned()
    }

    /// Number of live connections, summed across shards.
    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.read().expect("registry lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_and_returns_old_handle() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (first, _rx1) = ConnectionHandle::new(user);
        let first_conn = first.conn_id;
        assert!(registry.register(first).is_none());

        let (second, _rx2) = ConnectionHandle::new(user);
        let second_conn = second.conn_id;
        let old = registry.register(second).expect("old handle returned");
        assert_eq!(old.conn_id, first_conn);

        // Never more than one handle per user.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(user).unwrap().conn_id, second_conn);
    }

    #[test]
    fn stale_unregister_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (old, _rx1) = ConnectionHandle::new(user);
        let old_conn = old.conn_id;
        registry.register(old);

        // User reconnects before the old session finished tearing down.
        let (new, _rx2) = ConnectionHandle::new(user);
        let new_conn = new.conn_id;
        registry.register(new);

        // The old session's cleanup must not evict the newer connection.
        assert!(!registry.unregister(user, old_conn));
        assert_eq!(registry.lookup(user).unwrap().conn_id, new_conn);

        assert!(registry.unregister(user, new_conn));
        assert!(registry.lookup(user).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_unknown_user_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup(Uuid::new_v4()).is_none());
    }

    #[test]
    fn handles_are_independent_across_users() {
        let registry = ConnectionRegistry::new();
        let users: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();
        let mut rxs = Vec::new();

        for &user in &users {
            let (handle, rx) = ConnectionHandle::new(user);
            rxs.push(rx);
            assert!(registry.register(handle).is_none());
        }

        assert_eq!(registry.len(), users.len());
        for &user in &users {
            assert_eq!(registry.lookup(user).unwrap().user_id, user);
        }
    }
}
