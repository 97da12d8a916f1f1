use super::*;
use axum::{body, body::Body, http::Request};
use shared::protocol::{ConversationPreview, ServerEvent};
use std::time::Duration;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, http::HeaderValue as WsHeaderValue,
};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    storage: Storage,
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let settings = Settings {
        session_secret: "test-secret".into(),
        ..Settings::default()
    };
    let state = Arc::new(build_state(storage.clone(), &settings).expect("state"));
    TestApp {
        app: build_router(Arc::clone(&state)),
        state,
        storage,
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn login(app: &Router, username: &str) -> LoginResponse {
    let request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": username }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request")
}

async fn create_conversation(app: &Router, token: &str, peer: shared::domain::UserId) -> ConversationHistory {
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/conversations",
            token,
            Some(serde_json::json!({ "peerId": peer })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

async fn block_conversation_deletes(storage: &Storage) {
    sqlx::query(
        "CREATE TRIGGER block_conversation_delete BEFORE DELETE ON conversations
         BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
    )
    .execute(storage.pool())
    .await
    .expect("trigger");
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let t = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = t.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn healthz_reports_unavailable_when_pool_is_closed() {
    let t = test_app().await;
    t.storage.pool().close().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = t.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn login_sets_session_cookie_usable_for_rest_calls() {
    let t = test_app().await;
    let request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"username":"  alice  "}"#))
        .expect("request");
    let response = t.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("set-cookie")
        .to_string();
    assert!(cookie.starts_with("session="));
    assert!(cookie.contains("HttpOnly"));
    let dto: LoginResponse = json_body(response).await;
    assert_eq!(dto.name, "alice");

    login(&t.app, "bob").await;
    let session_pair = cookie.split(';').next().expect("pair").to_string();
    let users_request = Request::get("/users")
        .header("cookie", session_pair)
        .body(Body::empty())
        .expect("request");
    let users_response = t.app.oneshot(users_request).await.expect("response");
    assert_eq!(users_response.status(), StatusCode::OK);
    let users: Vec<UserSummary> = json_body(users_response).await;
    let names: Vec<String> = users.into_iter().map(|u| u.name).collect();
    assert_eq!(names, vec!["bob".to_string()]);
}

#[tokio::test]
async fn login_rejects_blank_and_oversized_usernames() {
    let t = test_app().await;
    for username in ["   ".to_string(), "x".repeat(65)] {
        let request = Request::post("/login")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "username": username }).to_string(),
            ))
            .expect("request");
        let response = t.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn protected_routes_require_a_session() {
    let t = test_app().await;
    for uri in ["/users", "/conversations", "/assistant/conversations"] {
        let response = t
            .app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        let error: ApiError = json_body(response).await;
        assert!(matches!(error.code, ErrorCode::Unauthorized));
    }

    let response = t
        .app
        .oneshot(authed("GET", "/conversations", "not-a-jwt", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let t = test_app().await;
    let huge = serde_json::json!({ "username": "x".repeat(MAX_REQUEST_BODY_BYTES + 1) });
    let request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(huge.to_string()))
        .expect("request");
    let response = t.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn create_or_get_twice_returns_identical_id() {
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;

    let first = create_conversation(&t.app, &alice.token, bob.user_id).await;
    let second = create_conversation(&t.app, &alice.token, bob.user_id).await;
    assert_eq!(first.id, second.id);

    let missing_peer = t
        .app
        .oneshot(authed(
            "POST",
            "/conversations",
            &alice.token,
            Some(serde_json::json!({})),
        ))
        .await
        .expect("response");
    assert_eq!(missing_peer.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_by_non_participant_is_not_found() {
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;
    let mallory = login(&t.app, "mallory").await;
    let conversation = create_conversation(&t.app, &alice.token, bob.user_id).await;

    let response = t
        .app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/conversations/{}", conversation.id.0),
            &mallory.token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let history = t
        .app
        .oneshot(authed(
            "GET",
            &format!("/conversations/{}/messages", conversation.id.0),
            &bob.token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(history.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_delete_returns_generic_500_and_notifies_nobody() {
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;
    let conversation = create_conversation(&t.app, &alice.token, bob.user_id).await;
    let (_connection, mut bob_rx) = t.state.rooms.admit(bob.user_id).await;

    block_conversation_deletes(&t.storage).await;

    let response = t
        .app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/conversations/{}", conversation.id.0),
            &alice.token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let error: ApiError = json_body(response).await;
    assert_eq!(error.message, "failed to delete conversation");
    assert!(bob_rx.try_recv().is_err());

    let previews = t
        .app
        .oneshot(authed("GET", "/conversations", &bob.token, None))
        .await
        .expect("response");
    let previews: Vec<ConversationPreview> = json_body(previews).await;
    assert_eq!(previews.len(), 1);
    assert_eq!(previews[0].id, conversation.id);
}

#[tokio::test]
async fn assistant_routes_require_ownership_and_validate_titles() {
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;

    let created = t
        .app
        .clone()
        .oneshot(authed("POST", "/assistant/conversations", &alice.token, None))
        .await
        .expect("response");
    assert_eq!(created.status(), StatusCode::OK);
    let created: AssistantConversationDetail = json_body(created).await;
    assert_eq!(created.title, "New AI chat");

    let uri = format!("/assistant/conversations/{}", created.id.0);
    let foreign = t
        .app
        .clone()
        .oneshot(authed("GET", &uri, &bob.token, None))
        .await
        .expect("response");
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);

    let blank = t
        .app
        .clone()
        .oneshot(authed(
            "PATCH",
            &uri,
            &alice.token,
            Some(serde_json::json!({ "title": "  " })),
        ))
        .await
        .expect("response");
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);

    // No API key is configured in tests, so generation fails and nothing is stored.
    let chat = t
        .app
        .clone()
        .oneshot(authed(
            "POST",
            "/assistant/chat",
            &alice.token,
            Some(serde_json::json!({ "conversationId": created.id, "content": "hi" })),
        ))
        .await
        .expect("response");
    assert_eq!(chat.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let deleted = t
        .app
        .oneshot(authed("DELETE", &uri, &alice.token, None))
        .await
        .expect("response");
    assert_eq!(deleted.status(), StatusCode::OK);
    let deleted: SuccessResponse = json_body(deleted).await;
    assert!(deleted.success);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn connect_ws(addr: SocketAddr, token: &str) -> WsStream {
    let mut request = format!("ws://{addr}/ws")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "authorization",
        WsHeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
    );
    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("connect");
    stream
}

async fn wait_for_connections(state: &AppState, user_id: shared::domain::UserId, count: usize) {
    for _ in 0..100 {
        if state.rooms.connection_count(user_id).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("user {} never reached {count} connections", user_id.0);
}

async fn next_event(stream: &mut WsStream) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("frame");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server event");
        }
    }
}

async fn send_intent(stream: &mut WsStream, conversation_id: ConversationId, content: &str) {
    let request = ClientRequest::SendIntent {
        conversation_id,
        content: content.to_string(),
    };
    stream
        .send(tungstenite::Message::Text(
            serde_json::to_string(&request).expect("json"),
        ))
        .await
        .expect("send");
}

#[tokio::test]
async fn realtime_handshake_without_credentials_is_refused() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let t = test_app().await;
    let addr = spawn_server(t.app.clone()).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect_err("refused");
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("unexpected handshake error: {other}"),
    }
    assert_eq!(t.state.rooms.room_count().await, 0);
}

#[tokio::test]
async fn connected_peer_receives_confirmed_message() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;
    let conversation = create_conversation(&t.app, &alice.token, bob.user_id).await;
    let addr = spawn_server(t.app.clone()).await;

    let mut alice_ws = connect_ws(addr, &alice.token).await;
    let mut bob_ws = connect_ws(addr, &bob.token).await;
    wait_for_connections(&t.state, alice.user_id, 1).await;
    wait_for_connections(&t.state, bob.user_id, 1).await;

    send_intent(&mut alice_ws, conversation.id, "hey").await;

    let ServerEvent::MessageConfirmed(received) = next_event(&mut bob_ws).await else {
        panic!("expected message-confirmed");
    };
    assert_eq!(received.content, "hey");
    assert_eq!(received.sender_id, alice.user_id);
    assert_eq!(received.conversation_id, conversation.id);

    let ServerEvent::MessageConfirmed(echo) = next_event(&mut alice_ws).await else {
        panic!("expected echo");
    };
    assert_eq!(echo.id, received.id);
}

#[tokio::test]
async fn offline_peer_sees_message_in_previews() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;
    let conversation = create_conversation(&t.app, &alice.token, bob.user_id).await;
    let addr = spawn_server(t.app.clone()).await;

    let mut alice_ws = connect_ws(addr, &alice.token).await;
    wait_for_connections(&t.state, alice.user_id, 1).await;
    send_intent(&mut alice_ws, conversation.id, "hi").await;
    next_event(&mut alice_ws).await;

    let response = t
        .app
        .oneshot(authed("GET", "/conversations", &bob.token, None))
        .await
        .expect("response");
    let previews: Vec<ConversationPreview> = json_body(response).await;
    assert_eq!(previews[0].last_message.as_deref(), Some("hi"));
    assert_eq!(previews[0].last_message_sender_id, Some(alice.user_id));
}

#[tokio::test]
async fn outsider_send_intent_is_silently_dropped() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;
    let mallory = login(&t.app, "mallory").await;
    let conversation = create_conversation(&t.app, &alice.token, bob.user_id).await;
    let addr = spawn_server(t.app.clone()).await;

    let mut mallory_ws = connect_ws(addr, &mallory.token).await;
    let mut bob_ws = connect_ws(addr, &bob.token).await;
    wait_for_connections(&t.state, mallory.user_id, 1).await;
    wait_for_connections(&t.state, bob.user_id, 1).await;

    send_intent(&mut mallory_ws, conversation.id, "sneaky").await;
    send_intent(&mut bob_ws, conversation.id, "legit").await;

    let ServerEvent::MessageConfirmed(first) = next_event(&mut bob_ws).await else {
        panic!("expected message-confirmed");
    };
    assert_eq!(first.content, "legit");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        t.storage
            .count_messages(conversation.id)
            .await
            .expect("count"),
        1
    );
}

#[tokio::test]
async fn deletion_reaches_connected_peer() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;
    let conversation = create_conversation(&t.app, &alice.token, bob.user_id).await;
    let addr = spawn_server(t.app.clone()).await;

    let mut bob_ws = connect_ws(addr, &bob.token).await;
    wait_for_connections(&t.state, bob.user_id, 1).await;

    let response = t
        .app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/conversations/{}", conversation.id.0),
            &alice.token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(
        next_event(&mut bob_ws).await,
        ServerEvent::ConversationDeleted {
            conversation_id: conversation.id
        }
    );

    let previews = t
        .app
        .oneshot(authed("GET", "/conversations", &bob.token, None))
        .await
        .expect("response");
    let previews: Vec<ConversationPreview> = json_body(previews).await;
    assert!(previews.is_empty());
}

#[tokio::test]
async fn closing_socket_drops_room() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let t = test_app().await;
    let alice = login(&t.app, "alice").await;
    let addr = spawn_server(t.app.clone()).await;

    let mut first = connect_ws(addr, &alice.token).await;
    let second = connect_ws(addr, &alice.token).await;
    wait_for_connections(&t.state, alice.user_id, 2).await;

    first.close(None).await.expect("close");
    wait_for_connections(&t.state, alice.user_id, 1).await;
    drop(second);
    wait_for_connections(&t.state, alice.user_id, 0).await;
    assert_eq!(t.state.rooms.room_count().await, 0);
}
