use crate::model::{
    ChatMessage, ChatRoom, Identity, MessageId, NewChat, NewMessage, UserId, UserPresence,
};
use crate::{db, messages, presence, reads, rooms};
use anyhow::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::{collections::HashMap, path::Path, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat not found")]
    ChatNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid input: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error("storage task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a soft delete.
#[derive(Debug, Clone)]
pub struct Deletion {
    pub message: ChatMessage,
    /// False when the message was already deleted before this call.
    pub newly_deleted: bool,
}

/// Durable chat rooms and messages.
///
/// Implementations are synchronous; async callers run them on the blocking
/// pool.
pub trait ChatStore: Send + Sync + 'static {
    fn create_chat(&self, creator: &Identity, chat: &NewChat) -> StoreResult<ChatRoom>;
    fn get_chat(&self, chat_id: &str) -> StoreResult<Option<ChatRoom>>;
    fn create_message(&self, message: &NewMessage) -> StoreResult<ChatMessage>;
    /// Newest `limit` messages after skipping `skip`, returned oldest first.
    fn list_messages(&self, chat_id: &str, skip: usize, limit: usize)
        -> StoreResult<Vec<ChatMessage>>;
    /// Soft delete; only the sender may delete. Repeating it is allowed and
    /// reports `newly_deleted: false`.
    fn delete_message(&self, chat_id: &str, message_id: &str, requester: &str)
        -> StoreResult<Deletion>;
    /// Mark messages in `chat_id` as read by `reader_id`. The reader's own
    /// messages are never touched. Returns the number of rows updated.
    fn mark_read(&self, chat_id: &str, reader_id: &str, message_ids: &[MessageId])
        -> StoreResult<usize>;
    fn unread_count(&self, chat_id: &str, user_id: &str) -> StoreResult<u32>;
    /// Active rooms the user participates in, most recently updated first.
    fn rooms_containing(&self, user_id: &str) -> StoreResult<Vec<ChatRoom>>;
    fn participants_of(&self, chat_id: &str) -> StoreResult<Vec<UserId>>;
}

/// Last-known presence per user.
pub trait PresenceStore: Send + Sync + 'static {
    fn set_online(&self, user_id: &str, online: bool) -> StoreResult<()>;
    fn presence_of(&self, user_ids: &[UserId]) -> StoreResult<HashMap<UserId, UserPresence>>;
    /// Users marked online whose presence was refreshed within `within`.
    fn online_users(&self, within: Duration) -> StoreResult<Vec<UserId>>;
}

/// SQLite-backed implementation of both stores.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::new(manager)?;
        pool.get()?.execute_batch(db::SCHEMA)?;
        Ok(Self { pool })
    }

    /// A private in-memory database. The pool holds a single connection so
    /// every caller sees the same data.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        pool.get()?.execute_batch(db::SCHEMA)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl ChatStore for SqliteStore {
    fn create_chat(&self, creator: &Identity, chat: &NewChat) -> StoreResult<ChatRoom> {
        rooms::create_chat(&mut *self.conn()?, &creator.user_id, chat)
    }

    fn get_chat(&self, chat_id: &str) -> StoreResult<Option<ChatRoom>> {
        rooms::get_chat(&*self.conn()?, chat_id)
    }

    fn create_message(&self, message: &NewMessage) -> StoreResult<ChatMessage> {
        messages::create_message(&mut *self.conn()?, message)
    }

    fn list_messages(
        &self,
        chat_id: &str,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<ChatMessage>> {
        messages::list_messages(&*self.conn()?, chat_id, skip, limit)
    }

    fn delete_message(
        &self,
        chat_id: &str,
        message_id: &str,
        requester: &str,
    ) -> StoreResult<Deletion> {
        messages::delete_message(&*self.conn()?, chat_id, message_id, requester)
    }

    fn mark_read(
        &self,
        chat_id: &str,
        reader_id: &str,
        message_ids: &[MessageId],
    ) -> StoreResult<usize> {
        reads::mark_messages_read(&*self.conn()?, chat_id, reader_id, message_ids)
    }

    fn unread_count(&self, chat_id: &str, user_id: &str) -> StoreResult<u32> {
        reads::unread_count(&*self.conn()?, chat_id, user_id)
    }

    fn rooms_containing(&self, user_id: &str) -> StoreResult<Vec<ChatRoom>> {
        rooms::rooms_containing(&*self.conn()?, user_id)
    }

    fn participants_of(&self, chat_id: &str) -> StoreResult<Vec<UserId>> {
        rooms::participants_of(&*self.conn()?, chat_id)
    }
}

impl PresenceStore for SqliteStore {
    fn set_online(&self, user_id: &str, online: bool) -> StoreResult<()> {
        presence::set_presence(&*self.conn()?, user_id, online)
    }

    fn presence_of(&self, user_ids: &[UserId]) -> StoreResult<HashMap<UserId, UserPresence>> {
        presence::presence_of(&*self.conn()?, user_ids)
    }

    fn online_users(&self, within: Duration) -> StoreResult<Vec<UserId>> {
        presence::online_users(&*self.conn()?, within)
    }
}
