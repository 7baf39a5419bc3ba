use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{Chat, Message, UserId, UserRecord},
    protocol::{events, RawFrame, ServerEvent},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Single { user_id: UserId, is_online: bool },
    /// Answer to a bulk status query; authoritative for the ids it contains.
    Bulk(HashMap<UserId, bool>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    /// Tag of the frame that produced the notice; `error` for server errors.
    pub source_event: String,
    pub message: String,
}

/// Fans decoded inbound frames out to per-kind subscriber streams.
///
/// Each kind has its own broadcast channel so any number of consumers can
/// subscribe without knowing about each other. Frames are routed in arrival
/// order and a frame that fails to decode never stops the ones after it.
pub struct EventRouter {
    all: broadcast::Sender<ServerEvent>,
    messages: broadcast::Sender<Message>,
    chats: broadcast::Sender<Chat>,
    presence: broadcast::Sender<PresenceChange>,
    search: broadcast::Sender<Vec<UserRecord>>,
    errors: broadcast::Sender<ErrorNotice>,
    /// Count of inbound frames this router missed; consumers reload state.
    lagged: broadcast::Sender<u64>,
}

impl EventRouter {
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(16);
        Self {
            all: broadcast::channel(buffer).0,
            messages: broadcast::channel(buffer).0,
            chats: broadcast::channel(buffer).0,
            presence: broadcast::channel(buffer).0,
            search: broadcast::channel(buffer).0,
            errors: broadcast::channel(buffer).0,
            lagged: broadcast::channel(16).0,
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ServerEvent> {
        self.all.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    pub fn subscribe_chats(&self) -> broadcast::Receiver<Chat> {
        self.chats.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    pub fn subscribe_search(&self) -> broadcast::Receiver<Vec<UserRecord>> {
        self.search.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorNotice> {
        self.errors.subscribe()
    }

    /// Fires when the router itself fell behind the transport and dropped
    /// frames before they could be routed.
    pub fn subscribe_lagged(&self) -> broadcast::Receiver<u64> {
        self.lagged.subscribe()
    }

    pub fn route_frame(&self, frame: RawFrame) {
        self.route(&frame.event, frame.data);
    }

    /// Decodes one frame and publishes it to the matching stream.
    pub fn route(&self, tag: &str, data: Value) {
        match tag {
            events::MESSAGE_CREATED => {
                if let Some(message) = self.decode::<Message>(tag, data) {
                    let _ = self.all.send(ServerEvent::MessageCreated(message.clone()));
                    let _ = self.messages.send(message);
                }
            }
            events::CHAT_CREATED => {
                if let Some(chat) = self.decode::<Chat>(tag, data) {
                    let _ = self.all.send(ServerEvent::ChatCreated(chat.clone()));
                    let _ = self.chats.send(chat);
                }
            }
            events::USER_STATUS_CHANGED => {
                #[derive(serde::Deserialize)]
                struct StatusChange {
                    user_id: UserId,
                    is_online: bool,
                }
                if let Some(change) = self.decode::<StatusChange>(tag, data) {
                    let _ = self.all.send(ServerEvent::UserStatusChanged {
                        user_id: change.user_id,
                        is_online: change.is_online,
                    });
                    let _ = self.presence.send(PresenceChange::Single {
                        user_id: change.user_id,
                        is_online: change.is_online,
                    });
                }
            }
            events::ONLINE_USERS => {
                if let Some(snapshot) = self.decode::<HashMap<UserId, bool>>(tag, data) {
                    let _ = self.all.send(ServerEvent::OnlineUsers(snapshot.clone()));
                    let _ = self.presence.send(PresenceChange::Bulk(snapshot));
                }
            }
            events::SEARCH_RESULTS => {
                #[derive(serde::Deserialize)]
                struct SearchResults {
                    #[serde(default)]
                    users: Vec<UserRecord>,
                }
                if let Some(results) = self.decode::<SearchResults>(tag, data) {
                    let _ = self.all.send(ServerEvent::SearchResults {
                        users: results.users.clone(),
                    });
                    let _ = self.search.send(results.users);
                }
            }
            events::ERROR => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified server error")
                    .to_string();
                warn!(%message, "router: server reported an error");
                let _ = self.all.send(ServerEvent::Error {
                    message: message.clone(),
                });
                let _ = self.errors.send(ErrorNotice {
                    source_event: tag.to_string(),
                    message,
                });
            }
            events::AUTH_SUCCESS | events::AUTH_ERROR => {
                debug!(event = tag, "router: handshake frame ignored");
            }
            other => debug!(event = other, "router: ignoring unknown event"),
        }
    }

    fn decode<T: DeserializeOwned>(&self, tag: &str, data: Value) -> Option<T> {
        match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(event = tag, error = %err, "router: malformed payload");
                let _ = self.errors.send(ErrorNotice {
                    source_event: tag.to_string(),
                    message: format!("malformed {tag} payload: {err}"),
                });
                None
            }
        }
    }

    /// Routes every frame from `frames` until the channel closes.
    pub fn attach(
        self: &std::sync::Arc<Self>,
        mut frames: broadcast::Receiver<RawFrame>,
    ) -> JoinHandle<()> {
        let router = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => router.route_frame(frame),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "router: inbound frames dropped; consumer lagging");
                        let _ = router.lagged.send(skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
