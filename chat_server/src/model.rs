pub use chat_proto::{
    ChatId, ChatMessage, ChatRoom, ChatType, ContentKind, MessageId, MessageStatus,
    PresenceStatus, UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Authenticated caller, resolved from a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A message about to be persisted. The sender's display name is captured here
/// so the stored row keeps the name used at send time.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub kind: ContentKind,
    pub reply_to: Option<MessageId>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChat {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default)]
    pub participants: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserPresence {
    pub user_id: UserId,
    pub is_online: bool,
    pub status: PresenceStatus,
    pub last_seen: i64,
}

/// Current wall clock in Unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
