use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, Identity, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        ClientRequest, ConversationHistory, ConversationPreview, CreateConversationRequest,
        LoginRequest, LoginResponse, ServerEvent, SuccessResponse, UserSummary,
    },
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

pub mod error;
pub mod sync;

pub use error::{ClientError, ClientResult};
pub use sync::{ChatState, LocalMessage, SyncAction, TempMessageId, ViewState};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type RealtimeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Point-in-time copy of the synchronization state, published on every change.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub user_id: UserId,
    pub previews: Vec<ConversationPreview>,
    pub view: ViewState,
    pub messages: Vec<LocalMessage>,
}

impl From<&ChatState> for ChatSnapshot {
    fn from(chat: &ChatState) -> Self {
        Self {
            user_id: chat.user_id(),
            previews: chat.previews().to_vec(),
            view: chat.view().clone(),
            messages: chat.messages().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ChatSnapshot),
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone)]
struct Session {
    server_url: String,
    token: String,
    identity: Identity,
}

#[derive(Default)]
struct RealtimeClientState {
    session: Option<Session>,
    chat: Option<ChatState>,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    realtime_task: Option<JoinHandle<()>>,
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, server_url: &str, username: &str) -> ClientResult<Identity>;
    async fn list_users(&self) -> ClientResult<Vec<UserSummary>>;
    async fn refresh_conversations(&self) -> ClientResult<Vec<ConversationPreview>>;
    async fn select_peer(&self, peer: UserSummary) -> ClientResult<()>;
    async fn send_message(&self, content: &str) -> ClientResult<()>;
    async fn delete_conversation(&self, conversation_id: ConversationId) -> ClientResult<()>;
    async fn snapshot(&self) -> Option<ChatSnapshot>;
    async fn disconnect(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct RealtimeClient {
    http: Client,
    inner: Mutex<RealtimeClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl RealtimeClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            inner: Mutex::new(RealtimeClientState::default()),
            events,
        })
    }

    async fn session(&self) -> ClientResult<Session> {
        self.inner
            .lock()
            .await
            .session
            .clone()
            .ok_or(ClientError::NotLoggedIn)
    }

    fn publish(&self, chat: &ChatState) {
        let _ = self
            .events
            .send(ClientEvent::StateChanged(ChatSnapshot::from(chat)));
    }

    fn report(&self, context: &str, err: &ClientError) {
        warn!(error = %err, "client: {context}");
        let _ = self.events.send(ClientEvent::Error(format!("{context}: {err}")));
    }

    /// Applies `apply` to the chat state and publishes the result. `None` when
    /// the session ended in the meantime.
    async fn with_chat<T>(&self, apply: impl FnOnce(&mut ChatState) -> T) -> Option<T> {
        let mut guard = self.inner.lock().await;
        let chat = guard.chat.as_mut()?;
        let out = apply(chat);
        self.publish(chat);
        Some(out)
    }

    async fn fetch_previews(&self) -> ClientResult<Vec<ConversationPreview>> {
        let session = self.session().await?;
        let previews: Vec<ConversationPreview> = decode(
            authorized(
                self.http
                    .get(format!("{}/conversations", session.server_url)),
                &session,
            )
            .send()
            .await?,
        )
        .await?;

        let replaced = previews.clone();
        self.with_chat(move |chat| chat.replace_previews(replaced))
            .await;
        Ok(previews)
    }

    async fn fetch_history(&self, conversation_id: ConversationId) -> ClientResult<()> {
        let session = self.session().await?;
        let history: ConversationHistory = decode(
            authorized(
                self.http.get(format!(
                    "{}/conversations/{}/messages",
                    session.server_url, conversation_id.0
                )),
                &session,
            )
            .send()
            .await?,
        )
        .await?;

        let applied = self
            .with_chat(|chat| chat.apply_history(conversation_id, history.messages))
            .await;
        if applied == Some(false) {
            info!(
                conversation_id = conversation_id.0,
                "client: ignoring history for a conversation no longer in view"
            );
        }
        Ok(())
    }

    async fn create_or_get_conversation(&self, peer_id: UserId) -> ClientResult<ConversationHistory> {
        let session = self.session().await?;
        decode(
            authorized(
                self.http
                    .post(format!("{}/conversations", session.server_url))
                    .json(&CreateConversationRequest {
                        peer_id: Some(peer_id),
                    }),
                &session,
            )
            .send()
            .await?,
        )
        .await
    }

    async fn run_action(&self, action: SyncAction) -> ClientResult<()> {
        match action {
            SyncAction::FetchHistory(conversation_id) => self.fetch_history(conversation_id).await,
            SyncAction::RefetchConversations => self.fetch_previews().await.map(|_| ()),
        }
    }

    /// Recovers whatever was missed while the realtime channel was down.
    async fn resync(&self) {
        let plan = {
            let guard = self.inner.lock().await;
            match guard.chat.as_ref() {
                Some(chat) => chat.resync_plan(),
                None => return,
            }
        };
        for action in plan {
            if let Err(err) = self.run_action(action).await {
                self.report("resync failed", &err);
            }
        }
    }

    /// Lets sends through on a connection that has finished its resync.
    /// Intents written to the previous connection can no longer be confirmed;
    /// the resync merge already settled every one of them that was stored.
    async fn open_send_path(&self, outbound: mpsc::UnboundedSender<ClientRequest>) {
        let mut guard = self.inner.lock().await;
        guard.outbound = Some(outbound);
        if let Some(chat) = guard.chat.as_mut() {
            let forgotten = chat.forget_unconfirmed_sends();
            if forgotten > 0 {
                info!(forgotten, "client: sends lost with the previous connection");
            }
        }
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        let action = self
            .with_chat(|chat| chat.apply_server_event(event))
            .await
            .flatten();
        if let Some(action) = action {
            if let Err(err) = self.run_action(action).await {
                self.report("failed to refresh after server event", &err);
            }
        }
    }

    /// Drives one realtime connection until it closes.
    async fn run_connection(&self, stream: RealtimeStream) {
        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();

        let writer_task = tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "client: failed to encode request");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Sends wait for the resync so history merges never race a new intent.
        self.resync().await;
        self.open_send_path(outbound_tx).await;
        let _ = self.events.send(ClientEvent::Connected);

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => self.handle_server_event(event).await,
                    Err(err) => {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(format!("invalid server event: {err}")));
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    self.report("realtime receive failed", &ClientError::Realtime(err));
                    break;
                }
            }
        }

        writer_task.abort();
        self.inner.lock().await.outbound = None;
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    /// Keeps the realtime channel up for the lifetime of the session. A refused
    /// handshake ends the session's realtime side for good.
    async fn supervise(self: Arc<Self>, session: Session, mut stream: RealtimeStream) {
        loop {
            self.run_connection(stream).await;
            stream = loop {
                tokio::time::sleep(RECONNECT_DELAY).await;
                match connect_realtime(&session.server_url, &session.token).await {
                    Ok(stream) => {
                        info!(user_id = session.identity.user_id.0, "client: realtime reconnected");
                        break stream;
                    }
                    Err(ClientError::Realtime(tungstenite::Error::Http(response)))
                        if response.status().as_u16() == 401 =>
                    {
                        self.report(
                            "realtime handshake refused",
                            &ClientError::Api(ApiError::unauthorized().into()),
                        );
                        return;
                    }
                    Err(err) => self.report("realtime reconnect failed", &err),
                }
            };
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<RealtimeClient> {
    async fn login(&self, server_url: &str, username: &str) -> ClientResult<Identity> {
        let server_url = normalize_server_url(server_url)?;
        let body: LoginResponse = decode(
            self.http
                .post(format!("{server_url}/login"))
                .json(&LoginRequest {
                    username: username.to_string(),
                })
                .send()
                .await?,
        )
        .await?;

        self.disconnect().await;
        let stream = connect_realtime(&server_url, &body.token).await?;

        let identity = Identity {
            user_id: body.user_id,
            name: body.name,
        };
        let session = Session {
            server_url,
            token: body.token,
            identity: identity.clone(),
        };
        let mut guard = self.inner.lock().await;
        guard.session = Some(session.clone());
        guard.chat = Some(ChatState::new(identity.user_id));
        guard.realtime_task = Some(tokio::spawn(Arc::clone(self).supervise(session, stream)));
        info!(user_id = identity.user_id.0, "client: logged in");
        Ok(identity)
    }

    async fn list_users(&self) -> ClientResult<Vec<UserSummary>> {
        let session = self.session().await?;
        decode(
            authorized(self.http.get(format!("{}/users", session.server_url)), &session)
                .send()
                .await?,
        )
        .await
    }

    async fn refresh_conversations(&self) -> ClientResult<Vec<ConversationPreview>> {
        self.fetch_previews().await
    }

    async fn select_peer(&self, peer: UserSummary) -> ClientResult<()> {
        let action = self
            .with_chat(|chat| chat.select_peer(peer))
            .await
            .ok_or(ClientError::NotLoggedIn)?;
        if let Some(action) = action {
            self.run_action(action).await?;
        }
        Ok(())
    }

    async fn send_message(&self, content: &str) -> ClientResult<()> {
        let pending = self
            .with_chat(|chat| chat.begin_send(content))
            .await
            .ok_or(ClientError::NotLoggedIn)??;

        let conversation_id = match pending.conversation_id {
            Some(conversation_id) => conversation_id,
            None => {
                let conversation = self.create_or_get_conversation(pending.peer_id).await?;
                let conversation_id = conversation.id;
                self.with_chat(|chat| chat.conversation_resolved(pending.peer_id, conversation))
                    .await;
                conversation_id
            }
        };

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Some(chat) = state.chat.as_mut() else {
            return Err(ClientError::NotLoggedIn);
        };
        chat.mark_emitted(conversation_id, pending.temp_id);
        let request = ClientRequest::SendIntent {
            conversation_id,
            content: pending.content,
        };
        let emitted = state
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(request).is_ok());
        if !emitted {
            chat.abandon_pending(conversation_id, pending.temp_id);
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> ClientResult<()> {
        let session = self.session().await?;
        let snapshot = self
            .with_chat(|chat| chat.begin_delete(conversation_id))
            .await
            .ok_or(ClientError::NotLoggedIn)?;

        let result: ClientResult<SuccessResponse> = async {
            decode(
                authorized(
                    self.http.delete(format!(
                        "{}/conversations/{}",
                        session.server_url, conversation_id.0
                    )),
                    &session,
                )
                .send()
                .await?,
            )
            .await
        }
        .await;

        if let Err(err) = result {
            warn!(
                conversation_id = conversation_id.0,
                error = %err,
                "client: delete failed, restoring conversation"
            );
            self.with_chat(|chat| chat.rollback_delete(snapshot)).await;
            return Err(err);
        }
        Ok(())
    }

    async fn snapshot(&self) -> Option<ChatSnapshot> {
        self.inner.lock().await.chat.as_ref().map(ChatSnapshot::from)
    }

    async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.realtime_task.take() {
            task.abort();
        }
        *guard = RealtimeClientState::default();
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

fn authorized(builder: RequestBuilder, session: &Session) -> RequestBuilder {
    builder.bearer_auth(&session.token)
}

fn normalize_server_url(raw: &str) -> ClientResult<String> {
    let parsed = Url::parse(raw.trim()).map_err(|_| ClientError::InvalidServerUrl(raw.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.as_str().trim_end_matches('/').to_string()),
        _ => Err(ClientError::InvalidServerUrl(raw.to_string())),
    }
}

fn realtime_url(server_url: &str) -> ClientResult<Url> {
    let mut url = Url::parse(&format!("{server_url}/ws"))
        .map_err(|_| ClientError::InvalidServerUrl(server_url.to_string()))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidServerUrl(server_url.to_string()))?;
    Ok(url)
}

async fn connect_realtime(server_url: &str, token: &str) -> ClientResult<RealtimeStream> {
    let url = realtime_url(server_url)?;
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|err| tungstenite::Error::HttpFormat(err.into()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

/// Decodes a success body, or turns an error response into `ClientError::Api`.
async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(code_for_status(status), body));
    Err(ClientError::Api(ApiException::from(error)))
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        status if status.is_client_error() => ErrorCode::Validation,
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
