use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.trim().is_empty()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatShapeError {
    #[error("chat {0} has no participants")]
    NoParticipants(ChatId),
    #[error("direct chat {chat_id} must have exactly two participants, found {found}")]
    DirectChatSize { chat_id: ChatId, found: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(
        default,
        deserialize_with = "empty_string_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

impl Chat {
    /// Drops repeated participant ids, keeping the first occurrence of each.
    pub fn dedup_participants(&mut self) {
        let mut seen = std::collections::HashSet::with_capacity(self.participants.len());
        self.participants.retain(|id| seen.insert(*id));
    }

    pub fn validate(&self) -> Result<(), ChatShapeError> {
        if self.participants.is_empty() {
            return Err(ChatShapeError::NoParticipants(self.id));
        }
        if !self.is_group && self.participants.len() != 2 {
            return Err(ChatShapeError::DirectChatSize {
                chat_id: self.id,
                found: self.participants.len(),
            });
        }
        Ok(())
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub chat: ChatId,
    #[serde(default)]
    pub text: String,
    /// Attachment reference (media path or URL) as stored by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
}

/// User record as the backend serializes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub id: UserId,
    pub display_name: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub avatar_url: String,
    pub is_online: bool,
}

impl PeerProfile {
    /// Stand-in returned while the real profile is still being fetched.
    pub fn placeholder(id: UserId, default_avatar_url: impl Into<String>) -> Self {
        Self {
            id,
            display_name: String::new(),
            handle: String::new(),
            bio: None,
            avatar_url: default_avatar_url.into(),
            is_online: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.display_name.is_empty() && self.handle.is_empty()
    }
}
