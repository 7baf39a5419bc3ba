use shared::domain::{Chat, ChatId, Message, PeerProfile, UserId};

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod router;
pub mod session;
pub mod signal;
pub mod store;
pub mod transport;

pub use client::ChatClient;
pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, ClientResult};
pub use gateway::{AvatarUpload, ChatApi, RestGateway};
pub use router::{ErrorNotice, PresenceChange};
pub use store::{ChatPhase, CreateOutcome, SendOutcome};
pub use transport::{ChannelFault, ConnectionState, ConnectionStatus};

/// UI-facing notifications re-published by [`ChatClient`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionStatus),
    /// Chat list contents or order changed; re-read `chats()`.
    ChatListChanged,
    ChatSelected(ChatId),
    MessagesLoaded {
        chat_id: ChatId,
        count: usize,
    },
    MessageAppended(Message),
    ChatCreated(Chat),
    PresenceChanged(Vec<UserId>),
    DirectoryUpdated(PeerProfile),
    AvatarsInvalidated(Option<UserId>),
    SearchResults(Vec<PeerProfile>),
    Desync {
        entity: &'static str,
        id: i64,
    },
    RemoteError(ErrorNotice),
    /// The server refused the credential; the user has to log in again.
    SessionExpired,
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
