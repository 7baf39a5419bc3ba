//! Fakes for the `ChatApi` and `Transport` seams shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::{
    domain::{Chat, ChatId, Message, MessageId, UserId, UserRecord},
    error::ErrorCode,
    protocol::{ClientRequest, CreateChatRequest, CreateMessageRequest, ProfileUpdate},
};
use tokio::{net::TcpListener, sync::broadcast, sync::watch};

use crate::{
    error::{ClientError, ClientResult},
    gateway::{AvatarUpload, ChatApi},
    transport::{ConnectionState, Transport},
};

pub const ME: UserId = UserId(1);

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

pub fn chat(id: i64, participants: &[i64], is_group: bool) -> Chat {
    Chat {
        id: ChatId(id),
        name: None,
        participants: participants.iter().copied().map(UserId).collect(),
        is_group,
        created_at: base_time(),
        last_message: None,
    }
}

pub fn named_chat(id: i64, name: &str, participants: &[i64]) -> Chat {
    Chat {
        name: Some(name.to_string()),
        ..chat(id, participants, participants.len() != 2)
    }
}

pub fn message(id: i64, chat: i64, sender: i64, offset_secs: i64) -> Message {
    Message {
        id: MessageId(id),
        sender: UserId(sender),
        chat: ChatId(chat),
        text: format!("message {id}"),
        image: None,
        sent_at: base_time() + Duration::seconds(offset_secs),
        is_read: false,
        sender_username: None,
    }
}

pub fn user(id: i64, username: &str) -> UserRecord {
    UserRecord {
        id: UserId(id),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        bio: None,
        avatar: None,
        avatar_url: None,
        is_online: false,
    }
}

pub fn rest_error(status: u16) -> ClientError {
    ClientError::Request {
        code: ErrorCode::from_status(status),
        status: Some(status),
        message: format!("status {status}"),
    }
}

pub struct TestChatApi {
    pub chats: Mutex<Vec<Chat>>,
    pub history: Mutex<HashMap<ChatId, Vec<Message>>>,
    pub users: Mutex<HashMap<UserId, UserRecord>>,
    pub create_chat_error: Mutex<Option<ClientError>>,
    pub create_message_error: Mutex<Option<ClientError>>,
    pub history_error: Mutex<Option<ClientError>>,
    pub created_chats: Mutex<Vec<CreateChatRequest>>,
    pub created_messages: Mutex<Vec<CreateMessageRequest>>,
    pub profile_updates: Mutex<Vec<(UserId, ProfileUpdate)>>,
    pub uploads: Mutex<Vec<(UserId, String)>>,
    pub deleted: Mutex<Vec<UserId>>,
    pub user_lookups: AtomicUsize,
    pub history_calls: AtomicUsize,
    users_open: watch::Sender<bool>,
    history_open: watch::Sender<bool>,
    next_chat_id: AtomicI64,
    next_message_id: AtomicI64,
}

impl TestChatApi {
    pub fn new() -> Self {
        Self {
            chats: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::from([(ME, user(ME.0, "me"))])),
            create_chat_error: Mutex::new(None),
            create_message_error: Mutex::new(None),
            history_error: Mutex::new(None),
            created_chats: Mutex::new(Vec::new()),
            created_messages: Mutex::new(Vec::new()),
            profile_updates: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            user_lookups: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
            users_open: watch::channel(true).0,
            history_open: watch::channel(true).0,
            next_chat_id: AtomicI64::new(100),
            next_message_id: AtomicI64::new(500),
        }
    }

    pub fn add_user(&self, record: UserRecord) {
        self.users.lock().insert(record.id, record);
    }

    /// Holds `get_user` calls until [`Self::release_lookups`].
    pub fn hold_lookups(&self) {
        self.users_open.send_replace(false);
    }

    pub fn release_lookups(&self) {
        self.users_open.send_replace(true);
    }

    /// Holds `list_messages` calls until [`Self::release_history`].
    pub fn hold_history(&self) {
        self.history_open.send_replace(false);
    }

    pub fn release_history(&self) {
        self.history_open.send_replace(true);
    }

    pub fn lookups(&self) -> usize {
        self.user_lookups.load(Ordering::SeqCst)
    }
}

async fn wait_open(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    let _ = rx.wait_for(|open| *open).await;
}

#[async_trait]
impl ChatApi for TestChatApi {
    async fn list_chats(&self) -> ClientResult<Vec<Chat>> {
        Ok(self.chats.lock().clone())
    }

    async fn get_chat(&self, chat_id: ChatId) -> ClientResult<Chat> {
        self.chats
            .lock()
            .iter()
            .find(|chat| chat.id == chat_id)
            .cloned()
            .ok_or_else(|| rest_error(404))
    }

    async fn create_chat(&self, request: &CreateChatRequest) -> ClientResult<Chat> {
        self.created_chats.lock().push(request.clone());
        if let Some(err) = self.create_chat_error.lock().clone() {
            return Err(err);
        }
        let mut participants = vec![ME];
        participants.extend(request.participants.iter().copied());
        Ok(Chat {
            id: ChatId(self.next_chat_id.fetch_add(1, Ordering::SeqCst)),
            name: (!request.name.is_empty()).then(|| request.name.clone()),
            participants,
            is_group: request.is_group,
            created_at: base_time(),
            last_message: None,
        })
    }

    async fn list_messages(&self, chat_id: ChatId) -> ClientResult<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        wait_open(&self.history_open).await;
        if let Some(err) = self.history_error.lock().clone() {
            return Err(err);
        }
        Ok(self
            .history
            .lock()
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_message(&self, request: &CreateMessageRequest) -> ClientResult<Message> {
        self.created_messages.lock().push(request.clone());
        if let Some(err) = self.create_message_error.lock().clone() {
            return Err(err);
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            text: request.text.clone(),
            ..message(id, request.chat.0, ME.0, 3_600)
        })
    }

    async fn get_user(&self, user_id: UserId) -> ClientResult<UserRecord> {
        self.user_lookups.fetch_add(1, Ordering::SeqCst);
        wait_open(&self.users_open).await;
        self.users
            .lock()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| rest_error(404))
    }

    async fn current_user(&self) -> ClientResult<UserRecord> {
        self.get_user(ME).await
    }

    async fn update_user(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> ClientResult<UserRecord> {
        self.profile_updates.lock().push((user_id, update.clone()));
        let mut users = self.users.lock();
        let record = users.get_mut(&user_id).ok_or_else(|| rest_error(404))?;
        if let Some(username) = &update.username {
            record.username = username.clone();
        }
        if let Some(bio) = &update.bio {
            record.bio = Some(bio.clone());
        }
        Ok(record.clone())
    }

    async fn delete_user(&self, user_id: UserId) -> ClientResult<()> {
        self.deleted.lock().push(user_id);
        Ok(())
    }

    async fn upload_avatar(
        &self,
        user_id: UserId,
        upload: AvatarUpload,
    ) -> ClientResult<UserRecord> {
        self.uploads.lock().push((user_id, upload.filename.clone()));
        let mut users = self.users.lock();
        let record = users.get_mut(&user_id).ok_or_else(|| rest_error(404))?;
        record.avatar = Some(format!("avatars/{}", upload.filename));
        Ok(record.clone())
    }
}

pub struct TestTransport {
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<ClientRequest>>,
}

impl TestTransport {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for TestTransport {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn send(&self, request: ClientRequest) -> bool {
        if self.state() != ConnectionState::Authenticated {
            return false;
        }
        self.sent.lock().push(request);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReply {
    /// `auth_success` for `good-token`, `auth_error` for anything else.
    Accept,
    /// Never answers the auth frame.
    Silent,
}

/// In-process WebSocket endpoint speaking the chat frame protocol.
#[derive(Clone)]
pub struct SocketServer {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<Value>>>,
    push: broadcast::Sender<String>,
    reply: AuthReply,
    close_first_after_auth: bool,
}

impl SocketServer {
    /// Sends a frame to every connected client.
    pub fn push(&self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data });
        let _ = self.push.send(frame.to_string());
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received_events(&self) -> Vec<Value> {
        self.received.lock().clone()
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SocketServer>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(server, socket))
}

async fn ws_connection(server: SocketServer, socket: WebSocket) {
    let connection = server.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut sender, mut receiver) = socket.split();
    let mut pushed = server.push.subscribe();
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(WsMessage::Text(text))) = incoming else { break };
                let frame: Value = serde_json::from_str(&text).unwrap_or_default();
                server.received.lock().push(frame.clone());
                if frame["event"] != "auth" || server.reply == AuthReply::Silent {
                    continue;
                }
                let reply = if frame["data"]["token"] == "good-token" {
                    json!({ "event": "auth_success", "data": { "user_id": ME.0 } })
                } else {
                    json!({ "event": "auth_error", "data": { "message": "Invalid token" } })
                };
                if sender.send(WsMessage::Text(reply.to_string())).await.is_err() {
                    break;
                }
                if server.close_first_after_auth && connection == 1 {
                    break;
                }
            }
            text = pushed.recv() => {
                let Ok(text) = text else { break };
                if sender.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

pub async fn spawn_socket_server(reply: AuthReply, close_first_after_auth: bool) -> SocketServer {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = SocketServer {
        url: format!("ws://{addr}/ws"),
        connections: Arc::new(AtomicUsize::new(0)),
        received: Arc::new(Mutex::new(Vec::new())),
        push: broadcast::channel(64).0,
        reply,
        close_first_after_auth,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(server.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    server
}

/// Accepts TCP connections and drops them before the WebSocket upgrade,
/// counting attempts.
pub async fn spawn_refusing_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (format!("ws://{addr}/ws"), attempts)
}
