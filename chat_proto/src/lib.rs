use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type ChatId = String;
pub type MessageId = String;

/// Kind of chat room.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
    Topical,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Topical => "topical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "topical" => Some(Self::Topical),
            _ => None,
        }
    }
}

/// What a message body carries.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    File,
    System,
    Typing,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
            Self::Typing => "typing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            "typing" => Some(Self::Typing),
            _ => None,
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// A persisted chat message as it travels over the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub message_type: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// A persisted conversation with its ordered participant list.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatRoom {
    pub chat_id: ChatId,
    pub name: Option<String>,
    pub chat_type: ChatType,
    pub participants: Vec<UserId>,
    pub created_by: UserId,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
}

/// Frames a client may send over the realtime connection.
///
/// Decoded once at the protocol boundary. A well-formed object with a `type`
/// this server does not know decodes to [`ClientFrame::Unknown`]; anything
/// else that fails to decode is a malformed frame.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinChat {
        chat_id: ChatId,
    },
    LeaveChat {
        chat_id: ChatId,
    },
    SendMessage {
        chat_id: ChatId,
        content: String,
        #[serde(default)]
        message_type: ContentKind,
        #[serde(default)]
        reply_to: Option<MessageId>,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
    },
    Typing {
        chat_id: ChatId,
        #[serde(default)]
        is_typing: bool,
    },
    MarkRead {
        chat_id: ChatId,
        #[serde(default)]
        message_ids: Vec<MessageId>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
}

/// Frames the server pushes to clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    JoinedChat {
        chat_id: ChatId,
        status: AckStatus,
    },
    LeftChat {
        chat_id: ChatId,
        status: AckStatus,
    },
    NewMessage {
        message: ChatMessage,
        timestamp: i64,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        user_name: String,
        is_typing: bool,
        timestamp: i64,
    },
    MessagesRead {
        chat_id: ChatId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: i64,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
