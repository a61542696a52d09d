use crate::auth::{AuthResolver, JwtResolver};
use crate::config::Config;
use crate::housekeeping;
use crate::hub::{Hub, HubError, HubOptions};
use crate::model::{
    ChatMessage, ChatRoom, ContentKind, Identity, MessageId, NewChat, NewMessage, UserId,
    UserPresence,
};
use crate::store::{ChatStore, PresenceStore, SqliteStore, StoreError};
use crate::ws::{bearer_token, ws_handler};
use anyhow::Result;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, net::TcpListener, sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// How recently a presence row must have been written to count as online.
const ONLINE_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_PAGE: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub auth: Arc<dyn AuthResolver>,
    pub config: Config,
}

impl AppState {
    /// Open the on-disk store under the configured data directory.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let path = config.database_path();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(path)).await??;
        let store = Arc::new(store);
        let auth = Arc::new(JwtResolver::new(config.jwt_secret.expose()));
        Ok(Self::from_parts(config, store.clone(), store, auth))
    }

    pub fn from_parts(
        config: Config,
        chats: Arc<dyn ChatStore>,
        presence: Arc<dyn PresenceStore>,
        auth: Arc<dyn AuthResolver>,
    ) -> Self {
        let hub = Hub::new(
            chats,
            presence,
            HubOptions {
                enforce_membership: config.enforce_membership,
            },
        );
        Self { hub, auth, config }
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/me", get(me))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route(
            "/api/chats/:chat_id/messages",
            get(list_messages).post(post_message),
        )
        .route(
            "/api/chats/:chat_id/messages/:message_id",
            delete(delete_message),
        )
        .route("/api/chats/:chat_id/read", post(mark_read))
        .route("/api/presence", get(presence))
        .route("/api/presence/online", get(online_users))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let identity = bearer_token(req.headers())
        .ok_or(StatusCode::UNAUTHORIZED)
        .and_then(|token| {
            state
                .auth
                .resolve(token)
                .map_err(|_| StatusCode::UNAUTHORIZED)
        })?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn err(status: StatusCode, msg: &str) -> ApiError {
    (status, Json(ErrorResp { error: msg.into() }))
}

fn store_err(e: StoreError) -> ApiError {
    match e {
        StoreError::ChatNotFound => err(StatusCode::NOT_FOUND, "chat_not_found"),
        StoreError::MessageNotFound => err(StatusCode::NOT_FOUND, "message_not_found"),
        StoreError::Forbidden => err(StatusCode::FORBIDDEN, "forbidden"),
        StoreError::Invalid(what) => err(StatusCode::BAD_REQUEST, what),
        other => {
            error!("store failure: {other}");
            err(StatusCode::INTERNAL_SERVER_ERROR, "storage")
        }
    }
}

fn hub_err(e: HubError) -> ApiError {
    match e {
        HubError::NotParticipant => err(StatusCode::FORBIDDEN, "not_a_participant"),
        HubError::Store(e) => store_err(e),
    }
}

/// Load a chat and make sure the caller takes part in it.
async fn member_chat(state: &AppState, who: &Identity, chat_id: &str) -> Result<ChatRoom, ApiError> {
    let id = chat_id.to_string();
    let chat = state
        .hub
        .with_chats(move |store| store.get_chat(&id))
        .await
        .map_err(store_err)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "chat_not_found"))?;
    if !chat.participants.contains(&who.user_id) {
        return Err(err(StatusCode::FORBIDDEN, "not_a_participant"));
    }
    Ok(chat)
}

async fn me(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

#[derive(Serialize)]
struct ChatSummary {
    #[serde(flatten)]
    chat: ChatRoom,
    unread_count: u32,
}

async fn list_chats(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = identity.user_id;
    let summaries = state
        .hub
        .with_chats(move |store| {
            store
                .rooms_containing(&user_id)?
                .into_iter()
                .map(|chat| -> Result<ChatSummary, StoreError> {
                    let unread_count = store.unread_count(&chat.chat_id, &user_id)?;
                    Ok(ChatSummary { chat, unread_count })
                })
                .collect::<Result<Vec<_>, StoreError>>()
        })
        .await
        .map_err(store_err)?;
    Ok(Json(summaries))
}

async fn create_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<NewChat>,
) -> Result<impl IntoResponse, ApiError> {
    let creator = identity.clone();
    let chat = state
        .hub
        .with_chats(move |store| store.create_chat(&creator, &req))
        .await
        .map_err(store_err)?;
    info!(user_id = %identity.user_id, chat_id = %chat.chat_id, "chat created");
    Ok((StatusCode::CREATED, Json(chat)))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    skip: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    member_chat(&state, &identity, &chat_id).await?;
    let skip = page.skip.unwrap_or(0);
    let limit = page.limit.unwrap_or(DEFAULT_PAGE);
    let messages = state
        .hub
        .with_chats(move |store| store.list_messages(&chat_id, skip, limit))
        .await
        .map_err(store_err)?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct PostMessageReq {
    content: String,
    #[serde(default)]
    message_type: ContentKind,
    #[serde(default)]
    reply_to: Option<MessageId>,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

async fn post_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<String>,
    Json(req): Json<PostMessageReq>,
) -> Result<impl IntoResponse, ApiError> {
    member_chat(&state, &identity, &chat_id).await?;
    let message = state
        .hub
        .send_message(NewMessage {
            chat_id,
            sender_id: identity.user_id,
            sender_name: identity.display_name,
            content: req.content,
            kind: req.message_type,
            reply_to: req.reply_to,
            file_url: req.file_url,
            file_name: req.file_name,
        })
        .await
        .map_err(hub_err)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    member_chat(&state, &identity, &chat_id).await?;
    state
        .hub
        .delete_message(&identity.user_id, &chat_id, &message_id)
        .await
        .map_err(hub_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ReadReq {
    #[serde(default)]
    message_ids: Vec<MessageId>,
}

#[derive(Serialize)]
struct ReadResp {
    updated: usize,
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<String>,
    Json(req): Json<ReadReq>,
) -> Result<impl IntoResponse, ApiError> {
    member_chat(&state, &identity, &chat_id).await?;
    let updated = state
        .hub
        .mark_read(&identity.user_id, &chat_id, req.message_ids)
        .await
        .map_err(hub_err)?;
    Ok(Json(ReadResp { updated }))
}

#[derive(Deserialize)]
struct PresenceQuery {
    #[serde(default)]
    user_ids: String,
}

async fn presence(
    State(state): State<AppState>,
    Query(query): Query<PresenceQuery>,
) -> Result<Json<HashMap<UserId, UserPresence>>, ApiError> {
    let ids: Vec<UserId> = query
        .user_ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let map = state
        .hub
        .with_presence(move |store| store.presence_of(&ids))
        .await
        .map_err(store_err)?;
    Ok(Json(map))
}

async fn online_users(State(state): State<AppState>) -> Result<Json<Vec<UserId>>, ApiError> {
    let users = state
        .hub
        .with_presence(|store| store.online_users(ONLINE_WINDOW))
        .await
        .map_err(store_err)?;
    Ok(Json(users))
}

/// Serve on an already bound listener until ctrl-c.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    listener.set_nonblocking(true)?;
    housekeeping::spawn_typing_expiry(state.hub.clone(), state.config.typing_ttl);
    let app = build_router(state);
    axum::Server::from_tcp(listener)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

/// Run the HTTP server with the resolved configuration.
pub async fn run_http_server(config: Config) -> Result<()> {
    if config.jwt_secret_generated {
        warn!("no jwt secret configured, generated a random one; issued tokens will not survive a restart");
    }
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    let listener = TcpListener::bind(addr)?;
    info!("listening on {}", listener.local_addr()?);
    serve(listener, state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issue_jwt;
    use crate::config::Secret;
    use axum::http::header;
    use hyper::Body;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SECRET: &str = "unit-secret";

    fn state() -> AppState {
        let config = Config {
            bind: "127.0.0.1:0".into(),
            data_dir: std::env::temp_dir(),
            logging_enabled: false,
            jwt_secret: Secret::new(SECRET),
            jwt_secret_generated: false,
            typing_ttl: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            enforce_membership: false,
        };
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let auth = Arc::new(JwtResolver::new(SECRET));
        AppState::from_parts(config, store.clone(), store, auth)
    }

    fn bearer(user: &str) -> String {
        let token = issue_jwt(SECRET.as_bytes(), user, None, time::Duration::minutes(5)).unwrap();
        format!("Bearer {token}")
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn protected_routes_require_bearer() {
        let app = build_router(state());
        let resp = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::get("/api/me")
                    .header(header::AUTHORIZATION, bearer("alice"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"user_id": "alice", "display_name": "alice"}));
    }

    #[tokio::test]
    async fn created_chat_is_listed_for_participants() {
        let app = build_router(state());
        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/chats")
                    .header(header::AUTHORIZATION, bearer("alice"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"name": " Family ", "chat_type": "group", "participants": ["bob"]})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["name"], "Family");

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/chats")
                    .header(header::AUTHORIZATION, bearer("bob"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let chats = body_json(resp).await;
        assert_eq!(chats[0]["chat_id"], created["chat_id"]);
        assert_eq!(chats[0]["unread_count"], 0);

        let resp = app
            .oneshot(
                Request::get("/api/chats")
                    .header(header::AUTHORIZATION, bearer("carol"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, json!([]));
    }
}
