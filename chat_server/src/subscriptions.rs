use crate::model::{ChatId, UserId};
use crate::registry::{ConnectionId, ConnectionRegistry};
use axum::extract::ws::Message;
use dashmap::DashMap;
use std::collections::HashSet;

/// Which users are listening to which chat in this process. Independent of
/// persisted membership; rebuilt from join/leave frames.
#[derive(Default)]
pub struct SubscriptionTable {
    rooms: DashMap<ChatId, HashSet<UserId>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: &str, chat_id: &str) {
        self.rooms
            .entry(chat_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn unsubscribe(&self, user_id: &str, chat_id: &str) {
        if let Some(mut listeners) = self.rooms.get_mut(chat_id) {
            listeners.remove(user_id);
        }
        self.rooms.remove_if(chat_id, |_, listeners| listeners.is_empty());
    }

    pub fn unsubscribe_all(&self, user_id: &str) {
        self.rooms.retain(|_, listeners| {
            listeners.remove(user_id);
            !listeners.is_empty()
        });
    }

    pub fn listeners(&self, chat_id: &str) -> Vec<UserId> {
        self.rooms
            .get(chat_id)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, user_id: &str, chat_id: &str) -> bool {
        self.rooms
            .get(chat_id)
            .map(|l| l.contains(user_id))
            .unwrap_or(false)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Deliver `payload` to every listener of `chat_id` except `exclude`.
    /// The listener set is snapshotted first so no table lock is held while
    /// the registry is touched. Returns connections whose delivery failed.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        chat_id: &str,
        payload: &Message,
        exclude: Option<&str>,
    ) -> Vec<ConnectionId> {
        self.listeners(chat_id)
            .iter()
            .filter(|user| Some(user.as_str()) != exclude)
            .flat_map(|user| registry.send_to_user(user, payload))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use tokio::sync::mpsc;

    #[test]
    fn join_leave_is_idempotent() {
        let table = SubscriptionTable::new();
        table.subscribe("alice", "r1");
        table.subscribe("alice", "r1");
        assert_eq!(table.listeners("r1"), vec!["alice"]);
        table.unsubscribe("alice", "r1");
        assert!(!table.is_subscribed("alice", "r1"));
        table.unsubscribe("alice", "r1");
        assert_eq!(table.room_count(), 0);

        // net effect of join, leave, join is joined
        table.subscribe("alice", "r1");
        table.unsubscribe("alice", "r1");
        table.subscribe("alice", "r1");
        assert!(table.is_subscribed("alice", "r1"));
    }

    #[test]
    fn unsubscribe_all_drops_empty_rooms() {
        let table = SubscriptionTable::new();
        table.subscribe("alice", "r1");
        table.subscribe("alice", "r2");
        table.subscribe("bob", "r2");
        table.unsubscribe_all("alice");
        assert_eq!(table.room_count(), 1);
        assert_eq!(table.listeners("r2"), vec!["bob"]);
        assert!(table.listeners("r1").is_empty());
    }

    #[test]
    fn broadcast_excludes_by_identity() {
        let registry = ConnectionRegistry::new();
        let table = SubscriptionTable::new();
        let (a1, mut a1_rx) = mpsc::unbounded_channel();
        let (a2, mut a2_rx) = mpsc::unbounded_channel();
        let (b1, mut b1_rx) = mpsc::unbounded_channel();
        registry.register(&Identity::new("alice", "Alice"), a1);
        registry.register(&Identity::new("alice", "Alice"), a2);
        registry.register(&Identity::new("bob", "Bob"), b1);
        table.subscribe("alice", "r1");
        table.subscribe("bob", "r1");

        let msg = Message::Text("hello".into());
        assert!(table.broadcast(&registry, "r1", &msg, Some("alice")).is_empty());
        assert!(a1_rx.try_recv().is_err());
        assert!(a2_rx.try_recv().is_err());
        assert_eq!(b1_rx.try_recv().unwrap(), msg);

        assert!(table.broadcast(&registry, "empty", &msg, None).is_empty());
    }
}
