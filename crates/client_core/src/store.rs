use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::{
    domain::{Chat, ChatId, Message, MessageId, UserId},
    protocol::{ClientRequest, CreateChatRequest, CreateMessageRequest},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    directory::DirectoryCache,
    error::{ClientError, ClientResult},
    gateway::ChatApi,
    presence::PresenceTracker,
    session::SessionContext,
    transport::{ConnectionState, Transport},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatPhase {
    #[default]
    Idle,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Queued on the transport; the message shows up when its
    /// `message:created` event arrives.
    Dispatched,
    /// Created over REST and already appended.
    Delivered(Message),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Chat),
    /// REST failed and the request went out over the transport instead; the
    /// chat arrives as a `chat:created` event.
    Requested,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub appended: bool,
    pub moved_to_head: bool,
    pub known_chat: bool,
}

#[derive(Default)]
struct StoreState {
    chats: Vec<Chat>,
    phases: HashMap<ChatId, ChatPhase>,
    selected: Option<ChatId>,
    messages: Vec<Message>,
    message_ids: HashSet<MessageId>,
    draft: String,
}

impl StoreState {
    /// Inserts into the active list keeping `(sent_at, id)` order. Returns
    /// false for a message that is already present.
    fn append(&mut self, message: &Message) -> bool {
        if !self.message_ids.insert(message.id) {
            return false;
        }
        let key = (message.sent_at, message.id);
        let pos = self
            .messages
            .partition_point(|existing| (existing.sent_at, existing.id) <= key);
        self.messages.insert(pos, message.clone());
        true
    }

    fn chat_index(&self, chat_id: ChatId) -> Option<usize> {
        self.chats.iter().position(|chat| chat.id == chat_id)
    }
}

/// In-memory model of the chat list and the selected conversation.
///
/// REST responses and transport events both land here. Messages are keyed by
/// id so the same message delivered through both paths is kept once.
pub struct ConversationStore {
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionContext>,
    presence: Arc<PresenceTracker>,
    directory: Arc<DirectoryCache>,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<StoreState>,
}

fn normalize_chat(mut chat: Chat) -> Option<Chat> {
    chat.dedup_participants();
    match chat.validate() {
        Ok(()) => Some(chat),
        Err(err) => {
            warn!(chat_id = %chat.id, error = %err, "store: dropping invalid chat");
            None
        }
    }
}

impl ConversationStore {
    pub fn new(
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn Transport>,
        session: Arc<SessionContext>,
        presence: Arc<PresenceTracker>,
        directory: Arc<DirectoryCache>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            transport,
            session,
            presence,
            directory,
            events,
            inner: Mutex::new(StoreState::default()),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_current(&self, generation: u64) -> ClientResult<()> {
        if self.session.is_current(generation) {
            return Ok(());
        }
        debug!(generation, "store: discarding result from an ended session");
        Err(ClientError::SessionEnded)
    }

    async fn peers_of<'a>(&self, chats: impl IntoIterator<Item = &'a Chat>) -> Vec<UserId> {
        let me = self.session.user_id().await;
        let mut seen = HashSet::new();
        chats
            .into_iter()
            .flat_map(|chat| chat.participants.iter().copied())
            .filter(|id| Some(*id) != me && seen.insert(*id))
            .collect()
    }

    async fn warm_peers(&self, peers: &[UserId]) {
        self.presence.request_bulk_status(peers).await;
        self.directory.warm(peers.iter().copied());
    }

    /// Replaces the chat list with the server's and warms presence and
    /// profiles for every peer in it.
    pub async fn load_chats(&self) -> ClientResult<Vec<Chat>> {
        let generation = self.session.generation();
        let chats = self.api.list_chats().await?;
        self.ensure_current(generation)?;

        let chats: Vec<Chat> = chats.into_iter().filter_map(normalize_chat).collect();
        {
            let mut guard = self.inner.lock().await;
            guard.chats = chats.clone();
            let known: HashSet<ChatId> = chats.iter().map(|chat| chat.id).collect();
            guard.phases.retain(|id, _| known.contains(id));
        }
        info!(count = chats.len(), "store: chat list loaded");
        self.emit(ClientEvent::ChatListChanged);

        let peers = self.peers_of(&chats).await;
        self.warm_peers(&peers).await;
        Ok(chats)
    }

    /// Makes `chat_id` the active conversation and loads its history.
    pub async fn select_chat(&self, chat_id: ChatId) -> ClientResult<Vec<Message>> {
        let generation = self.session.generation();
        {
            let mut guard = self.inner.lock().await;
            guard.selected = Some(chat_id);
            guard.phases.insert(chat_id, ChatPhase::Loading);
            guard.messages.clear();
            guard.message_ids.clear();
        }
        self.emit(ClientEvent::ChatSelected(chat_id));

        let result = self.api.list_messages(chat_id).await;
        self.ensure_current(generation)?;

        let (messages, participants) = {
            let mut guard = self.inner.lock().await;
            let history = match result {
                Ok(history) => history,
                Err(err) => {
                    guard.phases.insert(chat_id, ChatPhase::Idle);
                    return Err(err);
                }
            };
            if guard.selected != Some(chat_id) {
                debug!(%chat_id, "store: selection changed while loading; history dropped");
                guard.phases.insert(chat_id, ChatPhase::Idle);
                return Ok(history);
            }
            // Events that arrived while loading are already in the list.
            for message in history.iter().filter(|message| message.chat == chat_id) {
                guard.append(message);
            }
            guard.phases.insert(chat_id, ChatPhase::Loaded);
            let participants = guard
                .chat_index(chat_id)
                .map(|idx| guard.chats[idx].participants.clone())
                .unwrap_or_default();
            (guard.messages.clone(), participants)
        };

        debug!(%chat_id, count = messages.len(), "store: history loaded");
        self.emit(ClientEvent::MessagesLoaded {
            chat_id,
            count: messages.len(),
        });
        self.directory.warm(participants);
        Ok(messages)
    }

    /// Sends over the transport when it is authenticated, otherwise over
    /// REST. The draft is cleared once either path accepted the message and
    /// kept when both failed.
    pub async fn send_message(&self, chat_id: ChatId, text: &str) -> ClientResult<SendOutcome> {
        if text.trim().is_empty() {
            return Err(ClientError::InvalidInput("message text is empty".into()));
        }

        if self.transport.state() == ConnectionState::Authenticated {
            let token = self.session.credential().await.ok_or_else(|| {
                ClientError::Authentication("no session credential available".into())
            })?;
            let request = ClientRequest::MessageCreate {
                token,
                chat_id,
                text: text.to_string(),
            };
            if self.transport.send(request).await {
                self.inner.lock().await.draft.clear();
                debug!(%chat_id, "store: message dispatched over transport");
                return Ok(SendOutcome::Dispatched);
            }
            debug!(%chat_id, "store: transport refused message; using REST");
        }

        let generation = self.session.generation();
        let message = self
            .api
            .create_message(&CreateMessageRequest {
                chat: chat_id,
                text: text.to_string(),
            })
            .await?;
        self.ensure_current(generation)?;

        self.handle_message_created(message.clone()).await;
        self.inner.lock().await.draft.clear();
        info!(%chat_id, message_id = %message.id, "store: message delivered over REST");
        Ok(SendOutcome::Delivered(message))
    }

    /// Creates a chat over REST, falling back to the transport when REST
    /// fails for a reason other than authentication.
    pub async fn create_chat(
        &self,
        participant_ids: &[UserId],
        name: Option<&str>,
        is_group: bool,
    ) -> ClientResult<CreateOutcome> {
        let me = self.session.user_id().await;
        let mut seen = HashSet::new();
        if participant_ids.iter().any(|id| !seen.insert(*id)) {
            return Err(ClientError::InvalidInput(
                "participant ids must be unique".into(),
            ));
        }
        let peers: Vec<UserId> = participant_ids
            .iter()
            .copied()
            .filter(|id| Some(*id) != me)
            .collect();
        if peers.is_empty() {
            return Err(ClientError::InvalidInput(
                "a chat needs at least one other participant".into(),
            ));
        }
        if !is_group && peers.len() != 1 {
            return Err(ClientError::InvalidInput(format!(
                "a direct chat needs exactly one other participant, got {}",
                peers.len()
            )));
        }
        let name = name.map(str::trim).unwrap_or_default().to_string();

        let generation = self.session.generation();
        let request = CreateChatRequest {
            name: name.clone(),
            participants: peers.clone(),
            is_group,
        };
        let result = self.api.create_chat(&request).await;
        self.ensure_current(generation)?;

        let err = match result {
            Ok(chat) => {
                let chat = normalize_chat(chat).ok_or_else(|| {
                    ClientError::InvalidInput("server returned an invalid chat".into())
                })?;
                {
                    let mut guard = self.inner.lock().await;
                    if let Some(idx) = guard.chat_index(chat.id) {
                        guard.chats.remove(idx);
                    }
                    guard.chats.insert(0, chat.clone());
                }
                info!(chat_id = %chat.id, "store: chat created");
                self.emit(ClientEvent::ChatCreated(chat.clone()));
                self.emit(ClientEvent::ChatListChanged);
                // Creation succeeded; a history error is reported, not returned.
                if let Err(err) = self.select_chat(chat.id).await {
                    warn!(chat_id = %chat.id, error = %err, "store: created chat could not be opened");
                    self.emit(ClientEvent::Error(format!(
                        "chat {} created but its history could not be loaded: {err}",
                        chat.id
                    )));
                }
                self.presence.request_bulk_status(&peers).await;
                return Ok(CreateOutcome::Created(chat));
            }
            Err(err) => err,
        };

        if err.requires_login() || self.transport.state() != ConnectionState::Authenticated {
            return Err(err);
        }
        let Some(token) = self.session.credential().await else {
            return Err(err);
        };
        let sent = self
            .transport
            .send(ClientRequest::ChatCreate {
                token,
                participants: peers,
                is_group,
                name,
            })
            .await;
        if !sent {
            return Err(err);
        }
        warn!(error = %err, "store: REST chat creation failed; requested over transport");
        Ok(CreateOutcome::Requested)
    }

    /// Applies a `message:created` event (or a REST-created message).
    pub async fn handle_message_created(&self, message: Message) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        {
            let mut guard = self.inner.lock().await;
            if guard.selected == Some(message.chat) {
                outcome.appended = guard.append(&message);
            }
            if let Some(idx) = guard.chat_index(message.chat) {
                outcome.known_chat = true;
                // Replays and late arrivals must not reorder the list.
                let stale = guard.chats[idx].last_message.as_ref().is_some_and(|last| {
                    last.id == message.id || (last.sent_at, last.id) > (message.sent_at, message.id)
                });
                if !stale {
                    let mut chat = guard.chats.remove(idx);
                    chat.last_message = Some(message.clone());
                    guard.chats.insert(0, chat);
                    outcome.moved_to_head = true;
                }
            }
        }

        if !outcome.known_chat {
            warn!(
                chat_id = %message.chat,
                message_id = %message.id,
                "store: desync; message for unknown chat"
            );
            self.emit(ClientEvent::Desync {
                entity: "chat",
                id: message.chat.0,
            });
        }
        if outcome.moved_to_head {
            self.emit(ClientEvent::ChatListChanged);
        }
        if outcome.appended {
            self.emit(ClientEvent::MessageAppended(message));
        }
        outcome
    }

    /// Applies a `chat:created` event. Returns false for a chat that is
    /// already known.
    pub async fn handle_chat_created(&self, chat: Chat) -> bool {
        let Some(chat) = normalize_chat(chat) else {
            return false;
        };
        {
            let mut guard = self.inner.lock().await;
            if guard.chat_index(chat.id).is_some() {
                debug!(chat_id = %chat.id, "store: duplicate chat:created ignored");
                return false;
            }
            guard.chats.insert(0, chat.clone());
        }
        self.emit(ClientEvent::ChatCreated(chat.clone()));
        self.emit(ClientEvent::ChatListChanged);
        let peers = self.peers_of([&chat]).await;
        self.warm_peers(&peers).await;
        true
    }

    /// Fetches one chat and merges it into the list; used to heal a desync.
    pub async fn refresh_chat(&self, chat_id: ChatId) -> ClientResult<Chat> {
        let generation = self.session.generation();
        let chat = self.api.get_chat(chat_id).await?;
        self.ensure_current(generation)?;
        let mut chat = normalize_chat(chat)
            .ok_or_else(|| ClientError::InvalidInput(format!("chat {chat_id} is invalid")))?;
        {
            let mut guard = self.inner.lock().await;
            match guard.chat_index(chat_id) {
                Some(idx) => {
                    if chat.last_message.is_none() {
                        chat.last_message = guard.chats[idx].last_message.clone();
                    }
                    guard.chats[idx] = chat.clone();
                }
                None => guard.chats.insert(0, chat.clone()),
            }
        }
        info!(%chat_id, "store: chat refreshed");
        self.emit(ClientEvent::ChatListChanged);
        let peers = self.peers_of([&chat]).await;
        self.warm_peers(&peers).await;
        Ok(chat)
    }

    /// Chats matching `query` by name, a peer's cached display name, or the
    /// last message text. An empty query returns every chat.
    pub async fn filtered_chats(&self, query: &str) -> Vec<Chat> {
        let chats = self.chats().await;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return chats;
        }
        let me = self.session.user_id().await;
        chats
            .into_iter()
            .filter(|chat| {
                chat.name
                    .as_deref()
                    .is_some_and(|name| name.to_lowercase().contains(&query))
                    || chat
                        .participants
                        .iter()
                        .filter(|id| Some(**id) != me)
                        .filter_map(|id| self.directory.cached_profile(*id))
                        .any(|profile| profile.display_name.to_lowercase().contains(&query))
                    || chat
                        .last_message
                        .as_ref()
                        .is_some_and(|message| message.text.to_lowercase().contains(&query))
            })
            .collect()
    }

    pub async fn chats(&self) -> Vec<Chat> {
        self.inner.lock().await.chats.clone()
    }

    /// Distinct participants across every chat, excluding the signed-in user.
    pub async fn known_peers(&self) -> Vec<UserId> {
        let chats = self.chats().await;
        self.peers_of(&chats).await
    }

    pub async fn active_messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn selected_chat(&self) -> Option<ChatId> {
        self.inner.lock().await.selected
    }

    pub async fn chat_phase(&self, chat_id: ChatId) -> ChatPhase {
        self.inner
            .lock()
            .await
            .phases
            .get(&chat_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_draft(&self, text: impl Into<String>) {
        self.inner.lock().await.draft = text.into();
    }

    pub async fn draft(&self) -> String {
        self.inner.lock().await.draft.clone()
    }

    /// Cached display name for a peer, starting a lookup when it is unknown.
    pub fn peer_display_name(&self, user_id: UserId) -> Option<String> {
        match self.directory.cached_profile(user_id) {
            Some(profile) => Some(profile.display_name),
            None => {
                self.directory.warm([user_id]);
                None
            }
        }
    }

    /// Chat name, or the other participant's display name for an unnamed
    /// direct chat.
    pub async fn chat_title(&self, chat_id: ChatId) -> Option<String> {
        let chat = {
            let guard = self.inner.lock().await;
            let idx = guard.chat_index(chat_id)?;
            guard.chats[idx].clone()
        };
        if let Some(name) = chat.name {
            return Some(name);
        }
        let me = self.session.user_id().await;
        chat.participants
            .iter()
            .find(|id| Some(**id) != me)
            .and_then(|id| self.peer_display_name(*id))
    }

    pub async fn clear(&self) {
        *self.inner.lock().await = StoreState::default();
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
