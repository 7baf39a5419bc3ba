use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Chat, ChatId, Message, UserId, UserRecord};

/// Event names carried in the `event` field of every transport frame.
pub mod events {
    pub const AUTH: &str = "auth";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const MESSAGE_CREATE: &str = "message_create";
    pub const CHAT_CREATE: &str = "chat_create";
    pub const SEARCH_USERS: &str = "search_users";
    pub const GET_ONLINE_USERS: &str = "get_online_users";

    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const MESSAGE_CREATED: &str = "message:created";
    pub const CHAT_CREATED: &str = "chat:created";
    pub const USER_STATUS_CHANGED: &str = "user_status_changed";
    pub const ONLINE_USERS: &str = "online_users";
    pub const SEARCH_RESULTS: &str = "search_results";
    pub const ERROR: &str = "error";
}

/// Outbound transport frames. Every frame carries the session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    Auth {
        token: String,
    },
    Heartbeat {
        token: String,
    },
    MessageCreate {
        token: String,
        chat_id: ChatId,
        text: String,
    },
    ChatCreate {
        token: String,
        participants: Vec<UserId>,
        is_group: bool,
        name: String,
    },
    SearchUsers {
        token: String,
        search: String,
    },
    GetOnlineUsers {
        token: String,
        user_ids: Vec<UserId>,
    },
}

impl ClientRequest {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => events::AUTH,
            Self::Heartbeat { .. } => events::HEARTBEAT,
            Self::MessageCreate { .. } => events::MESSAGE_CREATE,
            Self::ChatCreate { .. } => events::CHAT_CREATE,
            Self::SearchUsers { .. } => events::SEARCH_USERS,
            Self::GetOnlineUsers { .. } => events::GET_ONLINE_USERS,
        }
    }
}

/// An inbound frame before it has been routed: the discriminator tag plus an
/// untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Typed inbound events after routing. Handshake frames are consumed by the
/// transport and have no variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:created")]
    MessageCreated(Message),
    #[serde(rename = "chat:created")]
    ChatCreated(Chat),
    #[serde(rename = "user_status_changed")]
    UserStatusChanged { user_id: UserId, is_online: bool },
    #[serde(rename = "online_users")]
    OnlineUsers(HashMap<UserId, bool>),
    #[serde(rename = "search_results")]
    SearchResults { users: Vec<UserRecord> },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub name: String,
    pub participants: Vec<UserId>,
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub chat: ChatId,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: String,
}
