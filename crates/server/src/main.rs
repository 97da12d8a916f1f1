use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{AssistantConversationId, ConversationId, Identity},
    error::{ApiError, ErrorCode},
    protocol::{
        AssistantChatRequest, AssistantChatResponse, AssistantConversationDetail,
        AssistantConversationSummary, AssistantTitleRequest, ClientRequest, ConversationHistory,
        ConversationPreview, CreateConversationRequest, LoginRequest, LoginResponse,
        SuccessResponse, UserSummary,
    },
};
use storage::Storage;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod assistant;
mod config;
mod gate;
mod relay;
mod rooms;
mod session;

use api::{reject, ApiContext, ApiRejection};
use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};
use gate::{admit, AuthenticatedUser};
use relay::{MessageRelay, RelayError};
use rooms::RoomRouter;
use session::{mint_session_token, session_cookie, JwtSessionValidator, SessionConfig};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const MAX_USERNAME_CHARS: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    if settings.assistant_api_key.is_none() {
        warn!("no assistant API key configured; assistant chat requests will fail");
    }

    let state = build_state(storage, &settings)?;
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(storage: Storage, settings: &Settings) -> anyhow::Result<AppState> {
    let session = SessionConfig {
        secret: settings.session_secret.clone(),
        ttl_seconds: settings.session_ttl_seconds,
    };
    let rooms = RoomRouter::new();
    Ok(AppState {
        api: ApiContext {
            storage: storage.clone(),
            assistant: assistant::generator_from_settings(settings)?,
        },
        relay: MessageRelay::new(storage.clone(), rooms.clone(), settings.max_message_chars),
        rooms,
        validator: Arc::new(JwtSessionValidator::new(session.clone(), storage)),
        session,
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/users", get(http_list_users))
        .route(
            "/conversations",
            get(http_list_conversations).post(http_create_conversation),
        )
        .route("/conversations/:id", axum::routing::delete(http_delete_conversation))
        .route("/conversations/:id/messages", get(http_conversation_messages))
        .route(
            "/assistant/conversations",
            get(http_list_assistant_conversations).post(http_create_assistant_conversation),
        )
        .route(
            "/assistant/conversations/:id",
            get(http_get_assistant_conversation)
                .patch(http_rename_assistant_conversation)
                .delete(http_delete_assistant_conversation),
        )
        .route("/assistant/chat", post(http_assistant_chat))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<LoginResponse>), ApiRejection> {
    let username = req.username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(reject(ApiError::validation(format!(
            "username must be between 1 and {MAX_USERNAME_CHARS} characters"
        ))));
    }

    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| reject(api::internal(e)))?;
    let identity = Identity {
        user_id,
        name: username.to_string(),
    };
    let token = mint_session_token(&state.session, &identity).map_err(|e| {
        error!(user_id = user_id.0, error = %e, "session token mint failed");
        reject(ApiError::new(ErrorCode::Internal, "failed to issue session"))
    })?;

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = HeaderValue::from_str(&session_cookie(&token, state.session.ttl_seconds)) {
        headers.insert(header::SET_COOKIE, cookie);
    }
    info!(user_id = user_id.0, "session issued");
    Ok((
        headers,
        Json(LoginResponse {
            user_id,
            name: identity.name,
            token,
        }),
    ))
}

async fn http_list_users(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
) -> Result<Json<Vec<UserSummary>>, ApiRejection> {
    let users = api::list_users(&state.api, identity.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(users))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
) -> Result<Json<Vec<ConversationPreview>>, ApiRejection> {
    let previews = api::list_conversations(&state.api, identity.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(previews))
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ConversationHistory>, ApiRejection> {
    let history = api::create_or_get_conversation(&state.api, identity.user_id, req.peer_id)
        .await
        .map_err(reject)?;
    Ok(Json(history))
}

async fn http_conversation_messages(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ConversationHistory>, ApiRejection> {
    let history =
        api::conversation_history(&state.api, identity.user_id, ConversationId(conversation_id))
            .await
            .map_err(reject)?;
    Ok(Json(history))
}

async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiRejection> {
    match state
        .relay
        .delete_conversation(identity.user_id, ConversationId(conversation_id))
        .await
    {
        Ok(_) => Ok(Json(SuccessResponse { success: true })),
        Err(RelayError::NotParticipant) => Err(reject(ApiError::not_found("conversation"))),
        Err(_) => Err(reject(ApiError::new(
            ErrorCode::Internal,
            "failed to delete conversation",
        ))),
    }
}

async fn http_list_assistant_conversations(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
) -> Result<Json<Vec<AssistantConversationSummary>>, ApiRejection> {
    let conversations = api::list_assistant_conversations(&state.api, identity.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_create_assistant_conversation(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    body: Option<Json<AssistantTitleRequest>>,
) -> Result<Json<AssistantConversationDetail>, ApiRejection> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let created = api::create_assistant_conversation(&state.api, identity.user_id, req.title)
        .await
        .map_err(reject)?;
    Ok(Json(created))
}

async fn http_get_assistant_conversation(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<AssistantConversationDetail>, ApiRejection> {
    let detail = api::get_assistant_conversation(
        &state.api,
        identity.user_id,
        AssistantConversationId(conversation_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(detail))
}

async fn http_rename_assistant_conversation(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(conversation_id): Path<i64>,
    Json(req): Json<AssistantTitleRequest>,
) -> Result<Json<AssistantConversationSummary>, ApiRejection> {
    let renamed = api::rename_assistant_conversation(
        &state.api,
        identity.user_id,
        AssistantConversationId(conversation_id),
        req.title,
    )
    .await
    .map_err(reject)?;
    Ok(Json(renamed))
}

async fn http_delete_assistant_conversation(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiRejection> {
    api::delete_assistant_conversation(
        &state.api,
        identity.user_id,
        AssistantConversationId(conversation_id),
    )
    .await
    .map_err(reject)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn http_assistant_chat(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Json(req): Json<AssistantChatRequest>,
) -> Result<Json<AssistantChatResponse>, ApiRejection> {
    let response = api::assistant_chat(
        &state.api,
        identity.user_id,
        req.conversation_id,
        &req.content,
    )
    .await
    .map_err(reject)?;
    Ok(Json(response))
}

/// The gate runs before the upgrade: an unauthenticated handshake is answered
/// with 401 and never becomes a socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match admit(state.validator.as_ref(), &headers).await {
        Ok(identity) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, identity))
            .into_response(),
        Err(error) => reject(error).into_response(),
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, identity: Identity) {
    let user_id = identity.user_id;
    let (connection_id, events_rx) = state.rooms.admit(user_id).await;
    let rooms = state.rooms.room_count().await;
    info!(
        user_id = user_id.0,
        rooms = rooms,
        "realtime connection opened"
    );

    let (mut sender, mut receiver) = socket.split();
    let mut events = UnboundedReceiverStream::new(events_rx);

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(ClientRequest::SendIntent {
                    conversation_id,
                    content,
                }) => {
                    // Drops are logged by the relay and never echoed to the client.
                    let _ = state
                        .relay
                        .send_message(user_id, conversation_id, &content)
                        .await;
                }
                Err(error) => {
                    debug!(user_id = user_id.0, %error, "ignoring malformed realtime frame");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.rooms.remove(user_id, connection_id).await;
    send_task.abort();
    info!(user_id = user_id.0, "realtime connection closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
