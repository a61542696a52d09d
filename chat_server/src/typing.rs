use crate::model::{ChatId, Identity, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Mark {
    user_name: String,
    since: Instant,
}

/// Per-chat, per-user "is typing" marks.
pub struct TypingTracker {
    rooms: Mutex<HashMap<ChatId, HashMap<UserId, Mark>>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Record (or refresh) a start signal, or clear the mark on stop.
    pub fn set_typing(&self, chat_id: &str, user: &Identity, is_typing: bool) {
        self.set_typing_at(chat_id, user, is_typing, Instant::now());
    }

    fn set_typing_at(&self, chat_id: &str, user: &Identity, is_typing: bool, at: Instant) {
        let mut guard = self.rooms.lock();
        if is_typing {
            guard.entry(chat_id.to_string()).or_default().insert(
                user.user_id.clone(),
                Mark {
                    user_name: user.display_name.clone(),
                    since: at,
                },
            );
        } else if let Some(users) = guard.get_mut(chat_id) {
            users.remove(&user.user_id);
            if users.is_empty() {
                guard.remove(chat_id);
            }
        }
    }

    #[cfg(test)]
    pub fn is_typing(&self, chat_id: &str, user_id: &str) -> bool {
        self.rooms
            .lock()
            .get(chat_id)
            .map(|u| u.contains_key(user_id))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn typing_in(&self, chat_id: &str) -> Vec<UserId> {
        self.rooms
            .lock()
            .get(chat_id)
            .map(|u| u.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every mark held by `user_id`, returning the chats it was in.
    pub fn clear_user(&self, user_id: &str) -> Vec<ChatId> {
        let mut cleared = Vec::new();
        self.rooms.lock().retain(|chat_id, users| {
            if users.remove(user_id).is_some() {
                cleared.push(chat_id.clone());
            }
            !users.is_empty()
        });
        cleared
    }

    /// Drop marks older than `ttl`, returning who stopped typing where.
    pub fn expire(&self, ttl: Duration) -> Vec<(ChatId, Identity)> {
        self.expire_at(ttl, Instant::now())
    }

    fn expire_at(&self, ttl: Duration, now: Instant) -> Vec<(ChatId, Identity)> {
        let mut expired = Vec::new();
        self.rooms.lock().retain(|chat_id, users| {
            users.retain(|user_id, mark| {
                let stale = now.saturating_duration_since(mark.since) >= ttl;
                if stale {
                    expired.push((
                        chat_id.clone(),
                        Identity::new(user_id.clone(), mark.user_name.clone()),
                    ));
                }
                !stale
            });
            !users.is_empty()
        });
        expired
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn bob() -> Identity {
        Identity::new("bob", "Bob")
    }

    #[test]
    fn start_then_stop_leaves_nothing() {
        let tracker = TypingTracker::new();
        tracker.set_typing("r1", &alice(), true);
        tracker.set_typing("r1", &alice(), true);
        assert!(tracker.is_typing("r1", "alice"));
        tracker.set_typing("r1", &alice(), false);
        assert!(!tracker.is_typing("r1", "alice"));
        assert!(tracker.typing_in("r1").is_empty());
        // stop without start is fine
        tracker.set_typing("r2", &bob(), false);
        assert!(tracker.rooms.lock().is_empty());
    }

    #[test]
    fn stale_marks_expire() {
        let tracker = TypingTracker::new();
        let start = Instant::now();
        tracker.set_typing_at("r1", &alice(), true, start);
        tracker.set_typing_at("r1", &bob(), true, start + Duration::from_secs(8));
        let expired = tracker.expire_at(Duration::from_secs(5), start + Duration::from_secs(10));
        assert_eq!(expired, vec![("r1".to_string(), alice())]);
        assert_eq!(tracker.typing_in("r1"), vec!["bob"]);
    }

    #[test]
    fn clear_user_reports_rooms() {
        let tracker = TypingTracker::new();
        tracker.set_typing("r1", &alice(), true);
        tracker.set_typing("r2", &alice(), true);
        tracker.set_typing("r2", &bob(), true);
        let mut cleared = tracker.clear_user("alice");
        cleared.sort();
        assert_eq!(cleared, vec!["r1", "r2"]);
        assert_eq!(tracker.typing_in("r2"), vec!["bob"]);
        assert!(tracker.typing_in("r1").is_empty());
    }
}
