use super::*;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    auth_headers: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    uploads: Arc<Mutex<Vec<(String, String, usize)>>>,
}

impl ServerState {
    async fn record_auth(&self, headers: &HeaderMap) -> bool {
        let value = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let authorized = value == "Bearer good-token";
        self.auth_headers.lock().await.push(value);
        authorized
    }
}

fn chat_json(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("chat {id}"),
        "participants": [1, 2],
        "is_group": false,
        "created_at": "2024-05-01T10:00:00Z"
    })
}

fn message_json(id: i64, chat: i64, text: &str) -> Value {
    json!({
        "id": id,
        "sender": 1,
        "chat": chat,
        "text": text,
        "sent_at": "2024-05-01T10:05:00Z",
        "is_read": false
    })
}

async fn list_chats(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !state.record_auth(&headers).await {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Invalid token." })),
        ));
    }
    Ok(Json(json!([chat_json(1), chat_json(2)])))
}

async fn forbidden_chat(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(_id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    state.record_auth(&headers).await;
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "detail": "You do not have permission." })),
    )
}

async fn list_messages(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.record_auth(&headers).await;
    state.queries.lock().await.push(query);
    Json(json!([message_json(10, 3, "first"), message_json(11, 3, "second")]))
}

async fn create_message(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.record_auth(&headers).await;
    let chat = body["chat"].as_i64().unwrap_or_default();
    let text = body["text"].as_str().unwrap_or_default().to_string();
    state.bodies.lock().await.push(body);
    (StatusCode::CREATED, Json(message_json(99, chat, &text)))
}

async fn get_user(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Json<Value> {
    state.record_auth(&headers).await;
    let id = if id == "me" { 7 } else { id.parse().unwrap_or_default() };
    Json(json!({
        "id": id,
        "username": format!("user{id}"),
        "email": format!("user{id}@example.com"),
        "avatar": "avatars/u.png",
        "is_online": true
    }))
}

async fn upload_avatar(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Json<Value> {
    state.record_auth(&headers).await;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().unwrap_or_default().to_string();
        let len = field.bytes().await.map(|b| b.len()).unwrap_or_default();
        state.uploads.lock().await.push((name, filename, len));
    }
    Json(json!({
        "id": id,
        "username": "me",
        "avatar_url": "http://cdn.example.com/avatars/new.png",
        "is_online": true
    }))
}

async fn obtain_token(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["username"] == "alice" && body["password"] == "secret" {
        return (
            StatusCode::OK,
            Json(json!({ "access": "access-token", "refresh": "refresh-token" })),
        );
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "No active account found with the given credentials" })),
    )
}

async fn spawn_rest_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/auth/login/", post(obtain_token))
        .route("/api/chats/", get(list_chats))
        .route("/api/chats/:id/", get(forbidden_chat))
        .route("/api/messages/", get(list_messages).post(create_message))
        .route("/api/users/:id/", get(get_user))
        .route("/api/users/:id/upload_avatar/", post(upload_avatar))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api/"), state)
}

async fn gateway_with_token(api_url: &str, token: Option<&str>) -> RestGateway {
    let session = Arc::new(SessionContext::new());
    if let Some(token) = token {
        session.begin(token, Some(UserId(7))).await;
    }
    RestGateway::new(api_url, session)
}

#[tokio::test]
async fn list_chats_attaches_bearer_credential() {
    let (api_url, state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("good-token")).await;

    let chats = gateway.list_chats().await.expect("list chats");

    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].id, ChatId(1));
    assert_eq!(chats[0].name.as_deref(), Some("chat 1"));
    assert_eq!(
        state.auth_headers.lock().await.as_slice(),
        ["Bearer good-token".to_string()]
    );
}

#[tokio::test]
async fn missing_credential_fails_fast_without_a_request() {
    let (api_url, state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, None).await;

    let err = gateway.list_chats().await.expect_err("must fail");

    assert!(matches!(err, ClientError::Authentication(_)));
    assert!(err.requires_login());
    assert!(state.auth_headers.lock().await.is_empty());
}

#[tokio::test]
async fn rejected_credential_surfaces_unauthorized() {
    let (api_url, _state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("stale-token")).await;

    let err = gateway.list_chats().await.expect_err("must fail");

    assert!(err.requires_login());
    assert!(matches!(
        err,
        ClientError::Request { status: Some(401), ref message, .. } if message == "Invalid token."
    ));
}

#[tokio::test]
async fn forbidden_is_distinguished_from_unauthorized() {
    let (api_url, _state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("good-token")).await;

    let err = gateway.get_chat(ChatId(5)).await.expect_err("must fail");

    assert!(err.is_forbidden());
    assert!(!err.requires_login());
}

#[tokio::test]
async fn list_messages_filters_by_chat_query() {
    let (api_url, state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("good-token")).await;

    let messages = gateway.list_messages(ChatId(3)).await.expect("messages");

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, "second");
    assert_eq!(
        messages[0].sent_at,
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap()
    );
    let queries = state.queries.lock().await;
    assert_eq!(queries[0].get("chat").map(String::as_str), Some("3"));
}

#[tokio::test]
async fn create_message_posts_chat_and_text() {
    let (api_url, state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("good-token")).await;

    let message = gateway
        .create_message(&CreateMessageRequest {
            chat: ChatId(4),
            text: "hello over rest".into(),
        })
        .await
        .expect("create message");

    assert_eq!(message.id, shared::domain::MessageId(99));
    assert_eq!(message.chat, ChatId(4));
    assert_eq!(
        state.bodies.lock().await[0],
        json!({ "chat": 4, "text": "hello over rest" })
    );
}

#[tokio::test]
async fn current_user_reads_me_endpoint() {
    let (api_url, _state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("good-token")).await;

    let me = gateway.current_user().await.expect("me");

    assert_eq!(me.id, UserId(7));
    assert_eq!(me.avatar.as_deref(), Some("avatars/u.png"));
}

#[tokio::test]
async fn upload_avatar_sends_multipart_file() {
    let (api_url, state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, Some("good-token")).await;

    let record = gateway
        .upload_avatar(
            UserId(7),
            AvatarUpload {
                filename: "me.png".into(),
                mime_type: Some("image/png".into()),
                bytes: vec![0u8; 16],
            },
        )
        .await
        .expect("upload");

    assert_eq!(
        record.avatar_url.as_deref(),
        Some("http://cdn.example.com/avatars/new.png")
    );
    assert_eq!(
        state.uploads.lock().await.as_slice(),
        [("avatar".to_string(), "me.png".to_string(), 16)]
    );
}

#[tokio::test]
async fn token_exchange_needs_no_session() {
    let (api_url, state) = spawn_rest_server().await;
    let gateway = gateway_with_token(&api_url, None).await;

    let pair = gateway.obtain_token("alice", "secret").await.expect("token");
    assert_eq!(pair.access, "access-token");
    assert_eq!(pair.refresh, "refresh-token");

    let err = gateway
        .obtain_token("alice", "wrong")
        .await
        .expect_err("bad password");
    assert!(err.requires_login());
    assert!(state.auth_headers.lock().await.is_empty());
}
