//! WebSocket transport: upgrade, authentication close codes, writer task and
//! keepalive.

use crate::api::AppState;
use crate::auth::AuthResolver;
use crate::dispatch::Session;
use crate::hub::Hub;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Pull the token out of an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// GET /ws?token=JWT
///
/// The upgrade always succeeds; a bad credential is answered with a close
/// frame carrying 4001 or 4002.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = query
        .token
        .or_else(|| bearer_token(&headers).map(str::to_string));
    let hub = state.hub.clone();
    let auth = state.auth.clone();
    let ping_every = state.config.ping_interval;
    ws.on_upgrade(move |socket| run_connection(socket, hub, auth, credential, ping_every))
}

/// Drive one socket until it closes, fails, or misses a keepalive.
pub async fn run_connection(
    socket: WebSocket,
    hub: Arc<Hub>,
    auth: Arc<dyn AuthResolver>,
    credential: Option<String>,
    ping_every: Duration,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let mut session = match Session::accept(hub, auth.as_ref(), credential.as_deref(), tx.clone()).await {
        Ok(session) => session,
        Err(err) => {
            warn!(close_code = err.close_code(), "websocket auth failed: {err}");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: err.close_code(),
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };
    let user_id = session.identity().user_id.clone();
    info!(user_id = %user_id, "websocket session started");

    let mut writer = tokio::spawn(writer_task(sink, rx));
    let mut keepalive = interval(ping_every);
    // the first tick completes immediately
    keepalive.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    info!(user_id = %user_id, reason = ?frame, "client closed connection");
                    break;
                }
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                // pings are answered by the transport
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(msg)) => session.handle(msg).await,
                Some(Err(err)) => {
                    warn!(user_id = %user_id, error = %err, "websocket receive error");
                    break;
                }
                None => {
                    debug!(user_id = %user_id, "websocket stream ended");
                    break;
                }
            },
            _ = keepalive.tick() => {
                if awaiting_pong {
                    warn!(user_id = %user_id, "keepalive timeout, closing connection");
                    break;
                }
                awaiting_pong = true;
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            _ = &mut writer => {
                debug!(user_id = %user_id, "writer finished");
                break;
            }
        }
    }

    session.close().await;
    drop(tx);
    writer.abort();
    info!(user_id = %user_id, "websocket session ended");
}

/// Forward queued frames to the socket until the queue closes or a write
/// fails.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}
