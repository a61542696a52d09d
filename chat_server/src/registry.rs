//! Live connection registry.
//!
//! Each user owns a bucket of connections (one per device or tab). Buckets live
//! in a sharded map so register/unregister/send for one user are serialized
//! while different users proceed independently. Sends are pushes onto each
//! connection's unbounded outbound channel and never wait on the socket.

use crate::model::{Identity, UserId};
use axum::extract::ws::Message;
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender half of a connection's outbound queue, drained by its writer task.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub id: ConnectionId,
    /// The user had no other live connection.
    pub first: bool,
}

#[derive(Debug, Clone)]
pub struct Departure {
    pub identity: Identity,
    /// The user has no live connection left.
    pub last: bool,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    by_user: DashMap<UserId, HashMap<ConnectionId, ConnectionSender>>,
    owners: DashMap<ConnectionId, Identity>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: &Identity, sender: ConnectionSender) -> Registration {
        let id = ConnectionId::new();
        self.owners.insert(id, identity.clone());
        let mut bucket = self.by_user.entry(identity.user_id.clone()).or_default();
        let first = bucket.is_empty();
        bucket.insert(id, sender);
        Registration { id, first }
    }

    /// Remove a connection. Returns `None` when the id is not (or no longer)
    /// registered, so repeated teardown is harmless.
    pub fn unregister(&self, id: ConnectionId) -> Option<Departure> {
        let (_, identity) = self.owners.remove(&id)?;
        let last = match self.by_user.entry(identity.user_id.clone()) {
            Entry::Occupied(mut bucket) => {
                bucket.get_mut().remove(&id);
                if bucket.get().is_empty() {
                    bucket.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };
        Some(Departure { identity, last })
    }

    /// Push `payload` to every live connection of `user_id`. Returns the
    /// connections whose queue is closed; delivery to the rest is unaffected.
    pub fn send_to_user(&self, user_id: &str, payload: &Message) -> Vec<ConnectionId> {
        let Some(bucket) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter(|(_, tx)| tx.send(payload.clone()).is_err())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    #[cfg(test)]
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map(|b| b.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn owner_of(&self, id: ConnectionId) -> Option<Identity> {
        self.owners.get(&id).map(|e| e.value().clone())
    }

    #[cfg(test)]
    pub fn online_users(&self) -> Vec<UserId> {
        self.by_user.iter().map(|e| e.key().clone()).collect()
    }
}
