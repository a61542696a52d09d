//! Shared fan-out service.
//!
//! The hub owns the live-connection registry, the subscription table and the
//! typing tracker, and talks to the chat and presence stores on the blocking
//! pool. Every operation that mutates durable state persists first and
//! broadcasts only after the store succeeded.
//!
//! Deliveries are fire-and-forget. Connections whose queue turned out to be
//! closed are handed to a reaper task which runs the normal disconnect cascade
//! for them, so a broadcast never recurses into teardown.

use crate::model::{
    now_millis, ChatMessage, ChatRoom, Identity, MessageId, NewMessage, PresenceStatus,
};
use crate::presence::presence_audience;
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionSender};
use crate::store::{ChatStore, PresenceStore, StoreError, StoreResult};
use crate::subscriptions::SubscriptionTable;
use crate::typing::TypingTracker;
use axum::extract::ws::Message;
use chat_proto::ServerFrame;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct HubOptions {
    /// Reject joins and sends from users outside the chat's participant list.
    pub enforce_membership: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("not a participant of this chat")]
    NotParticipant,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Hub {
    registry: ConnectionRegistry,
    subscriptions: SubscriptionTable,
    typing: TypingTracker,
    chats: Arc<dyn ChatStore>,
    presence: Arc<dyn PresenceStore>,
    options: HubOptions,
    reap_tx: mpsc::UnboundedSender<ConnectionId>,
}

impl Hub {
    /// Build the hub and start its reaper. Must be called inside a tokio
    /// runtime.
    pub fn new(
        chats: Arc<dyn ChatStore>,
        presence: Arc<dyn PresenceStore>,
        options: HubOptions,
    ) -> Arc<Self> {
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            registry: ConnectionRegistry::new(),
            subscriptions: SubscriptionTable::new(),
            typing: TypingTracker::new(),
            chats,
            presence,
            options,
            reap_tx,
        });
        tokio::spawn(reap_loop(Arc::downgrade(&hub), reap_rx));
        hub
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    /// Register a live connection. The user's first connection marks them
    /// online and notifies everyone who shares a room with them.
    pub async fn connect(&self, identity: &Identity, sender: ConnectionSender) -> ConnectionId {
        let registration = self.registry.register(identity, sender);
        info!(
            user_id = %identity.user_id,
            connection = %registration.id,
            first = registration.first,
            "connection registered"
        );
        if registration.first {
            self.record_presence(&identity.user_id, true).await;
            self.broadcast_user_status(&identity.user_id, PresenceStatus::Online)
                .await;
        }
        registration.id
    }

    /// Tear down a connection. Repeated calls for the same id are no-ops.
    /// When the user's last connection goes away their subscriptions and
    /// typing marks are dropped and an offline status is fanned out.
    pub async fn disconnect(&self, id: ConnectionId) {
        let Some(departure) = self.registry.unregister(id) else {
            return;
        };
        let user = departure.identity;
        info!(user_id = %user.user_id, connection = %id, last = departure.last, "connection closed");
        if !departure.last || self.registry.is_online(&user.user_id) {
            return;
        }
        self.subscriptions.unsubscribe_all(&user.user_id);
        for chat_id in self.typing.clear_user(&user.user_id) {
            self.broadcast_typing(&chat_id, &user, false);
        }
        self.record_presence(&user.user_id, false).await;
        // a reconnect may have raced the store write
        if self.registry.is_online(&user.user_id) {
            self.record_presence(&user.user_id, true).await;
            return;
        }
        self.broadcast_user_status(&user.user_id, PresenceStatus::Offline)
            .await;
    }

    /// Schedule a connection for teardown from a synchronous context.
    pub fn release(&self, id: ConnectionId) {
        if self.reap_tx.send(id).is_err() {
            debug!(connection = %id, "reaper gone, release dropped");
        }
    }

    fn reap(&self, dead: Vec<ConnectionId>) {
        for id in dead {
            warn!(connection = %id, "delivery failed, reaping connection");
            self.release(id);
        }
    }

    /// Send a frame to every subscriber of `chat_id`, optionally skipping one
    /// user (all of their connections).
    pub fn broadcast_to_chat(&self, chat_id: &str, frame: &ServerFrame, exclude: Option<&str>) {
        let Some(payload) = to_message(frame) else {
            return;
        };
        let dead = self
            .subscriptions
            .broadcast(&self.registry, chat_id, &payload, exclude);
        self.reap(dead);
    }

    /// Send a frame to every live connection of `user_id`.
    pub fn send_to_user(&self, user_id: &str, frame: &ServerFrame) {
        let Some(payload) = to_message(frame) else {
            return;
        };
        let dead = self.registry.send_to_user(user_id, &payload);
        self.reap(dead);
    }

    /// Tell each distinct co-participant of `user_id` about a status change,
    /// exactly once regardless of how many rooms they share.
    ///
    /// The status is dropped when the registry no longer agrees with it once
    /// the room lookup returns. Nothing awaits between that check and the
    /// sends, so a connect or disconnect landing during the lookup is left to
    /// announce itself.
    pub async fn broadcast_user_status(&self, user_id: &str, status: PresenceStatus) {
        let owner = user_id.to_string();
        let rooms: Vec<ChatRoom> = match self
            .with_chats(move |store| store.rooms_containing(&owner))
            .await
        {
            Ok(rooms) => rooms,
            Err(err) => {
                warn!(user_id = %user_id, "presence fan-out skipped: {err}");
                return;
            }
        };
        let online = self.registry.is_online(user_id);
        if online != (status == PresenceStatus::Online) {
            debug!(user_id = %user_id, status = status.as_str(), "stale presence fan-out dropped");
            return;
        }
        let frame = ServerFrame::UserStatus {
            user_id: user_id.to_string(),
            status,
            timestamp: now_millis(),
        };
        let Some(payload) = to_message(&frame) else {
            return;
        };
        let audience = presence_audience(user_id, &rooms);
        debug!(user_id = %user_id, status = status.as_str(), peers = audience.len(), "presence fan-out");
        let dead: Vec<ConnectionId> = audience
            .iter()
            .flat_map(|peer| self.registry.send_to_user(peer, &payload))
            .collect();
        self.reap(dead);
    }

    pub async fn join(&self, user_id: &str, chat_id: &str) -> Result<(), HubError> {
        if self.options.enforce_membership {
            self.ensure_participant(user_id, chat_id).await?;
        }
        self.subscriptions.subscribe(user_id, chat_id);
        debug!(user_id = %user_id, chat_id = %chat_id, "joined chat");
        Ok(())
    }

    pub fn leave(&self, user_id: &str, chat_id: &str) {
        self.subscriptions.unsubscribe(user_id, chat_id);
        debug!(user_id = %user_id, chat_id = %chat_id, "left chat");
    }

    /// Persist a message, then deliver `new_message` to every subscriber of
    /// the room, the sender's own connections included.
    pub async fn send_message(&self, message: NewMessage) -> Result<ChatMessage, HubError> {
        if self.options.enforce_membership {
            self.ensure_participant(&message.sender_id, &message.chat_id)
                .await?;
        }
        let stored = self
            .with_chats(move |store| store.create_message(&message))
            .await?;
        self.broadcast_to_chat(
            &stored.chat_id,
            &ServerFrame::NewMessage {
                message: stored.clone(),
                timestamp: now_millis(),
            },
            None,
        );
        Ok(stored)
    }

    /// Record a typing signal and relay it to the room, minus the typist.
    pub fn set_typing(&self, user: &Identity, chat_id: &str, is_typing: bool) {
        self.typing.set_typing(chat_id, user, is_typing);
        self.broadcast_typing(chat_id, user, is_typing);
    }

    fn broadcast_typing(&self, chat_id: &str, user: &Identity, is_typing: bool) {
        self.broadcast_to_chat(
            chat_id,
            &ServerFrame::Typing {
                chat_id: chat_id.to_string(),
                user_id: user.user_id.clone(),
                user_name: user.display_name.clone(),
                is_typing,
                timestamp: now_millis(),
            },
            Some(&user.user_id),
        );
    }

    /// Persist read receipts, then tell the rest of the room. None of the
    /// reader's connections receive the echo.
    pub async fn mark_read(
        &self,
        reader_id: &str,
        chat_id: &str,
        message_ids: Vec<MessageId>,
    ) -> Result<usize, HubError> {
        let (chat, reader, ids) = (
            chat_id.to_string(),
            reader_id.to_string(),
            message_ids.clone(),
        );
        let updated = self
            .with_chats(move |store| store.mark_read(&chat, &reader, &ids))
            .await?;
        self.broadcast_to_chat(
            chat_id,
            &ServerFrame::MessagesRead {
                chat_id: chat_id.to_string(),
                user_id: reader_id.to_string(),
                message_ids,
            },
            Some(reader_id),
        );
        Ok(updated)
    }

    /// Soft-delete a message the requester sent, then announce it to the room.
    /// Repeated deletes succeed without a second announcement.
    pub async fn delete_message(
        &self,
        requester: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<ChatMessage, HubError> {
        let (chat, msg, who) = (
            chat_id.to_string(),
            message_id.to_string(),
            requester.to_string(),
        );
        let deletion = self
            .with_chats(move |store| store.delete_message(&chat, &msg, &who))
            .await?;
        if deletion.newly_deleted {
            self.broadcast_to_chat(
                chat_id,
                &ServerFrame::MessageDeleted {
                    chat_id: chat_id.to_string(),
                    message_id: deletion.message.message_id.clone(),
                },
                None,
            );
        }
        Ok(deletion.message)
    }

    /// Drop typing marks older than `ttl` and announce that those users
    /// stopped typing. Returns how many marks expired.
    pub fn expire_typing(&self, ttl: Duration) -> usize {
        let expired = self.typing.expire(ttl);
        for (chat_id, user) in &expired {
            self.broadcast_typing(chat_id, user, false);
        }
        expired.len()
    }

    async fn ensure_participant(&self, user_id: &str, chat_id: &str) -> Result<(), HubError> {
        let chat = chat_id.to_string();
        let participants = self
            .with_chats(move |store| store.participants_of(&chat))
            .await?;
        if participants.iter().any(|p| p == user_id) {
            Ok(())
        } else {
            Err(HubError::NotParticipant)
        }
    }

    async fn record_presence(&self, user_id: &str, online: bool) {
        let store = self.presence.clone();
        let owner = user_id.to_string();
        let res = tokio::task::spawn_blocking(move || store.set_online(&owner, online))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|r| r);
        if let Err(err) = res {
            warn!(user_id = %user_id, online, "presence write failed: {err}");
        }
    }

    /// Run a chat-store call on the blocking pool.
    pub async fn with_chats<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn ChatStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.chats.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a presence-store call on the blocking pool.
    pub async fn with_presence<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn PresenceStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.presence.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

async fn reap_loop(hub: Weak<Hub>, mut rx: mpsc::UnboundedReceiver<ConnectionId>) {
    while let Some(id) = rx.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.disconnect(id).await;
    }
}

fn to_message(frame: &ServerFrame) -> Option<Message> {
    match frame.encode() {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!("failed to encode frame: {err}");
            None
        }
    }
}
