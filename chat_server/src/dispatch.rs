//! Per-connection session: authentication, frame dispatch and teardown.

use crate::auth::{AuthError, AuthResolver};
use crate::hub::{Hub, HubError};
use crate::model::{Identity, NewMessage};
use crate::registry::{ConnectionId, ConnectionSender};
use axum::extract::ws::Message;
use chat_proto::{AckStatus, ClientFrame, ServerFrame};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown frame type")]
    UnknownFrame,
    #[error("not a participant of this chat")]
    NotParticipant,
    #[error("could not join chat: {0}")]
    JoinFailed(HubError),
    #[error("message could not be sent: {0}")]
    SendFailed(HubError),
    #[error("messages could not be marked read: {0}")]
    MarkReadFailed(HubError),
}

impl DispatchError {
    /// Stable code carried by the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_frame",
            Self::UnknownFrame => "unknown_frame",
            Self::NotParticipant => "not_a_participant",
            Self::JoinFailed(_) => "join_failed",
            Self::SendFailed(_) => "send_failed",
            Self::MarkReadFailed(_) => "mark_read_failed",
        }
    }

    fn from_hub(err: HubError, wrap: fn(HubError) -> Self) -> Self {
        match err {
            HubError::NotParticipant => Self::NotParticipant,
            other => wrap(other),
        }
    }
}

/// One realtime connection. Dropping an active session hands its
/// registration to the hub's reaper, so teardown happens even when the
/// owning task is cancelled.
pub struct Session {
    hub: Arc<Hub>,
    identity: Identity,
    state: SessionState,
    connection: Option<ConnectionId>,
    outbox: ConnectionSender,
}

impl Session {
    /// Resolve the credential and register the connection. On failure nothing
    /// is registered and the caller closes the socket with the error's close
    /// code.
    pub async fn accept(
        hub: Arc<Hub>,
        auth: &dyn AuthResolver,
        credential: Option<&str>,
        outbox: ConnectionSender,
    ) -> Result<Self, AuthError> {
        let identity = auth.resolve(credential.ok_or(AuthError::Missing)?)?;
        let mut session = Self {
            hub,
            identity,
            state: SessionState::Authenticated,
            connection: None,
            outbox,
        };
        session.activate().await;
        Ok(session)
    }

    async fn activate(&mut self) {
        let id = self
            .hub
            .connect(&self.identity, self.outbox.clone())
            .await;
        self.connection = Some(id);
        self.state = SessionState::Active;
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Handle one inbound transport message. Failures are reported to this
    /// connection as `error` frames; the session stays open.
    pub async fn handle(&mut self, msg: Message) {
        if self.state != SessionState::Active {
            return;
        }
        let result = match msg {
            Message::Text(text) => match ClientFrame::decode(&text) {
                Ok(frame) => self.dispatch(frame).await,
                Err(err) => Err(DispatchError::Malformed(err.to_string())),
            },
            Message::Binary(_) => Err(DispatchError::Malformed("binary frames are not supported".into())),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => Ok(()),
        };
        if let Err(err) = result {
            debug!(user_id = %self.identity.user_id, code = err.code(), "frame rejected: {err}");
            self.reply(&ServerFrame::error(err.code(), err.to_string()));
        }
    }

    pub async fn dispatch(&mut self, frame: ClientFrame) -> Result<(), DispatchError> {
        let user_id = self.identity.user_id.clone();
        match frame {
            ClientFrame::JoinChat { chat_id } => {
                self.hub
                    .join(&user_id, &chat_id)
                    .await
                    .map_err(|e| DispatchError::from_hub(e, DispatchError::JoinFailed))?;
                self.reply(&ServerFrame::JoinedChat {
                    chat_id,
                    status: AckStatus::Success,
                });
            }
            ClientFrame::LeaveChat { chat_id } => {
                self.hub.leave(&user_id, &chat_id);
                self.reply(&ServerFrame::LeftChat {
                    chat_id,
                    status: AckStatus::Success,
                });
            }
            ClientFrame::SendMessage {
                chat_id,
                content,
                message_type,
                reply_to,
                file_url,
                file_name,
            } => {
                let message = NewMessage {
                    chat_id,
                    sender_id: user_id,
                    sender_name: self.identity.display_name.clone(),
                    content,
                    kind: message_type,
                    reply_to,
                    file_url,
                    file_name,
                };
                self.hub
                    .send_message(message)
                    .await
                    .map_err(|e| DispatchError::from_hub(e, DispatchError::SendFailed))?;
            }
            ClientFrame::Typing { chat_id, is_typing } => {
                self.hub.set_typing(&self.identity, &chat_id, is_typing);
            }
            ClientFrame::MarkRead {
                chat_id,
                message_ids,
            } => {
                self.hub
                    .mark_read(&user_id, &chat_id, message_ids)
                    .await
                    .map_err(|e| DispatchError::from_hub(e, DispatchError::MarkReadFailed))?;
            }
            ClientFrame::Unknown => return Err(DispatchError::UnknownFrame),
        }
        Ok(())
    }

    fn reply(&self, frame: &ServerFrame) {
        match frame.encode() {
            Ok(text) => {
                if self.outbox.send(Message::Text(text)).is_err() {
                    debug!(user_id = %self.identity.user_id, "reply dropped, writer gone");
                }
            }
            Err(err) => warn!("failed to encode reply: {err}"),
        }
    }

    /// Run the disconnect cascade now.
    pub async fn close(mut self) {
        if let Some(id) = self.connection.take() {
            self.hub.disconnect(id).await;
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(id) = self.connection.take() {
            self.hub.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubOptions;
    use crate::model::{ChatType, NewChat};
    use crate::store::{ChatStore, SqliteStore};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct StaticResolver;

    impl AuthResolver for StaticResolver {
        fn resolve(&self, credential: &str) -> Result<Identity, AuthError> {
            match credential {
                "expired" => Err(AuthError::Expired),
                "" => Err(AuthError::Missing),
                c => c
                    .strip_prefix("user:")
                    .map(|id| Identity::new(id, id.to_uppercase()))
                    .ok_or(AuthError::Invalid),
            }
        }
    }

    fn setup() -> (Arc<Hub>, SqliteStore, String) {
        let store = SqliteStore::in_memory().unwrap();
        let room = store
            .create_chat(
                &Identity::new("alice", "ALICE"),
                &NewChat {
                    name: Some("family".into()),
                    chat_type: ChatType::Group,
                    participants: vec!["bob".into()],
                },
            )
            .unwrap();
        let shared = Arc::new(store.clone());
        let hub = Hub::new(shared.clone(), shared, HubOptions::default());
        (hub, store, room.chat_id)
    }

    async fn open(hub: &Arc<Hub>, who: &str) -> (Session, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let credential = format!("user:{who}");
        let session = Session::accept(hub.clone(), &StaticResolver, Some(credential.as_str()), tx)
            .await
            .unwrap();
        (session, rx)
    }

    fn frames(rx: &mut UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(t)) = rx.try_recv() {
            out.push(serde_json::from_str(&t).unwrap());
        }
        out
    }

    fn text(v: Value) -> Message {
        Message::Text(v.to_string())
    }

    #[tokio::test]
    async fn auth_failure_registers_nothing() {
        let (hub, _, _) = setup();
        for (cred, code) in [(None, 4001), (Some("expired"), 4002), (Some("bogus"), 4001)] {
            let (tx, _rx) = mpsc::unbounded_channel();
            let err = Session::accept(hub.clone(), &StaticResolver, cred, tx)
                .await
                .err()
                .unwrap();
            assert_eq!(err.close_code(), code);
        }
        assert!(hub.registry().online_users().is_empty());
    }

    #[tokio::test]
    async fn join_send_and_leave() {
        let (hub, _, room) = setup();
        let (mut alice, mut alice_rx) = open(&hub, "alice").await;
        assert_eq!(alice.state(), SessionState::Active);
        assert!(alice.connection_id().is_some());

        alice
            .handle(text(serde_json::json!({"type": "join_chat", "chat_id": room})))
            .await;
        alice
            .handle(text(serde_json::json!({
                "type": "send_message", "chat_id": room, "content": "hello"
            })))
            .await;
        alice
            .handle(text(serde_json::json!({"type": "leave_chat", "chat_id": room})))
            .await;

        let got = frames(&mut alice_rx);
        let types: Vec<&str> = got.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(types, ["joined_chat", "new_message", "left_chat"]);
        assert_eq!(got[0]["status"], "success");
        assert_eq!(got[1]["message"]["sender_name"], "ALICE");
        assert!(!hub.subscriptions().is_subscribed("alice", &room));
    }

    #[tokio::test]
    async fn bad_frames_get_error_replies_and_keep_session() {
        let (hub, _, room) = setup();
        let (mut s, mut rx) = open(&hub, "alice").await;
        s.handle(Message::Text("{not json".into())).await;
        s.handle(text(serde_json::json!({"type": "join_chat"}))).await;
        s.handle(text(serde_json::json!({"type": "fly", "chat_id": room}))).await;
        s.handle(Message::Binary(vec![1, 2, 3])).await;
        s.handle(text(serde_json::json!({
            "type": "send_message", "chat_id": "missing", "content": "x"
        })))
        .await;
        s.handle(text(serde_json::json!({
            "type": "mark_read", "chat_id": room, "message_ids": ["m1"]
        })))
        .await;

        let codes: Vec<String> = frames(&mut rx)
            .iter()
            .filter(|f| f["type"] == "error")
            .map(|f| f["code"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            codes,
            ["malformed_frame", "malformed_frame", "unknown_frame", "malformed_frame", "send_failed"]
        );
        assert_eq!(s.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn close_runs_cascade_and_drop_releases() {
        let (hub, _, room) = setup();
        let (mut alice, _rx) = open(&hub, "alice").await;
        alice
            .handle(text(serde_json::json!({"type": "join_chat", "chat_id": room})))
            .await;
        alice.close().await;
        assert!(!hub.registry().is_online("alice"));
        assert_eq!(hub.subscriptions().room_count(), 0);

        let (bob, _rx) = open(&hub, "bob").await;
        assert!(hub.registry().is_online("bob"));
        drop(bob);
        for _ in 0..50 {
            if !hub.registry().is_online("bob") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!hub.registry().is_online("bob"));
    }
}
