//! Client facade: owns every component, runs the single event pump and
//! re-publishes UI-facing [`ClientEvent`]s.

use std::sync::Arc;

use shared::{
    domain::{Chat, ChatId, Message, PeerProfile, UserId, UserRecord},
    protocol::{ClientRequest, ProfileUpdate, ServerEvent, TokenPair},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    config::ClientSettings,
    directory::DirectoryCache,
    error::{ClientError, ClientResult},
    gateway::{AvatarUpload, ChatApi, RestGateway},
    presence::PresenceTracker,
    router::{EventRouter, PresenceChange},
    session::SessionContext,
    signal::{InvalidationSignal, SignalRecord},
    store::{ChatPhase, ConversationStore, CreateOutcome, SendOutcome},
    transport::{ConnectionStatus, Transport, TransportChannel},
    ClientEvent,
};

pub struct ChatClient {
    session: Arc<SessionContext>,
    api: Arc<dyn ChatApi>,
    auth: RestGateway,
    channel: Arc<TransportChannel>,
    router: Arc<EventRouter>,
    presence: Arc<PresenceTracker>,
    directory: Arc<DirectoryCache>,
    store: Arc<ConversationStore>,
    signal: InvalidationSignal,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(settings: &ClientSettings) -> Arc<Self> {
        let session = Arc::new(SessionContext::new());
        let api = Arc::new(RestGateway::new(&settings.api_url, session.clone()));
        Self::new_with_dependencies(settings, session, api)
    }

    pub fn new_with_dependencies(
        settings: &ClientSettings,
        session: Arc<SessionContext>,
        api: Arc<dyn ChatApi>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));
        let channel = TransportChannel::new(settings.transport_settings());
        let transport: Arc<dyn Transport> = channel.clone();
        let presence = Arc::new(PresenceTracker::new(transport.clone(), session.clone()));
        let directory =
            DirectoryCache::new(settings.directory_settings(), api.clone(), session.clone());
        let store = Arc::new(ConversationStore::new(
            api.clone(),
            transport,
            session.clone(),
            presence.clone(),
            directory.clone(),
            events.clone(),
        ));
        Arc::new(Self {
            auth: RestGateway::new(&settings.api_url, session.clone()),
            session,
            api,
            channel,
            router: Arc::new(EventRouter::new(settings.event_buffer)),
            presence,
            directory,
            store,
            signal: InvalidationSignal::new(
                settings.signal_path.clone(),
                settings.signal_poll_interval(),
            ),
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn directory(&self) -> &Arc<DirectoryCache> {
        &self.directory
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<ConnectionStatus> {
        self.channel.subscribe_status()
    }

    /// Exchanges username/password for a credential; does not start a
    /// session.
    pub async fn obtain_token(&self, username: &str, password: &str) -> ClientResult<TokenPair> {
        self.auth.obtain_token(username, password).await
    }

    /// Starts a session with `credential`: resolves the signed-in user, starts
    /// the event pump and connects the transport.
    pub async fn login(&self, credential: impl Into<String>) -> ClientResult<UserRecord> {
        let credential = credential.into();
        self.channel.disconnect().await;
        self.stop_tasks().await;
        self.session.end().await;
        self.clear_state().await;
        self.session.begin(credential.clone(), None).await;

        let me = match self.api.current_user().await {
            Ok(me) => me,
            Err(err) => {
                warn!(error = %err, "client: login failed");
                self.session.end().await;
                return Err(err);
            }
        };
        self.session.set_user_id(me.id).await;
        self.directory.store_record(&me);

        // Subscribers first, so nothing routed after connect is missed.
        let tasks = vec![
            self.spawn_event_pump(),
            self.router.attach(self.channel.subscribe_frames()),
            self.spawn_status_relay(),
            self.spawn_directory_relay(),
            self.spawn_signal_watcher(),
        ];
        *self.tasks.lock().await = tasks;

        self.channel.connect(credential).await;
        info!(user_id = %me.id, username = %me.username, "client: logged in");
        Ok(me)
    }

    /// Ends the session: disconnects, stops background tasks and clears all
    /// cached state. In-flight REST completions are discarded.
    pub async fn logout(&self) {
        self.channel.disconnect().await;
        self.stop_tasks().await;
        self.session.end().await;
        self.clear_state().await;
        let _ = self
            .events
            .send(ClientEvent::ConnectionChanged(self.channel.status()));
        info!("client: logged out");
    }

    /// Drops everything cached for the previous session.
    async fn clear_state(&self) {
        self.store.clear().await;
        self.presence.clear();
        self.directory.clear();
    }

    async fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }
    }

    pub async fn load_chats(&self) -> ClientResult<Vec<Chat>> {
        self.store.load_chats().await
    }

    pub async fn select_chat(&self, chat_id: ChatId) -> ClientResult<Vec<Message>> {
        self.store.select_chat(chat_id).await
    }

    pub async fn send_message(&self, chat_id: ChatId, text: &str) -> ClientResult<SendOutcome> {
        self.store.send_message(chat_id, text).await
    }

    pub async fn create_chat(
        &self,
        participant_ids: &[UserId],
        name: Option<&str>,
        is_group: bool,
    ) -> ClientResult<CreateOutcome> {
        self.store.create_chat(participant_ids, name, is_group).await
    }

    pub async fn filtered_chats(&self, query: &str) -> Vec<Chat> {
        self.store.filtered_chats(query).await
    }

    pub async fn chat_phase(&self, chat_id: ChatId) -> ChatPhase {
        self.store.chat_phase(chat_id).await
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn resolve_profile(&self, user_id: UserId) -> PeerProfile {
        self.directory.resolve_profile(user_id)
    }

    /// Asks the server for users matching `term`; results arrive as
    /// [`ClientEvent::SearchResults`].
    pub async fn search_users(&self, term: &str) -> bool {
        let term = term.trim();
        if term.is_empty() {
            return false;
        }
        let Some(token) = self.session.credential().await else {
            return false;
        };
        self.channel
            .send(ClientRequest::SearchUsers {
                token,
                search: term.to_string(),
            })
            .await
    }

    async fn current_user_id(&self) -> ClientResult<UserId> {
        self.session
            .user_id()
            .await
            .ok_or_else(|| ClientError::Authentication("not logged in".to_string()))
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> ClientResult<PeerProfile> {
        let user_id = self.current_user_id().await?;
        let record = self.api.update_user(user_id, update).await?;
        let profile = self.directory.store_record(&record);
        let _ = self
            .events
            .send(ClientEvent::DirectoryUpdated(profile.clone()));
        Ok(profile)
    }

    /// Uploads a new avatar and tells other running instances to drop their
    /// cached copy.
    pub async fn upload_avatar(&self, upload: AvatarUpload) -> ClientResult<PeerProfile> {
        let user_id = self.current_user_id().await?;
        let record = self.api.upload_avatar(user_id, upload).await?;
        self.directory.invalidate(Some(user_id));
        let profile = self.directory.store_record(&record);
        if let Err(err) = self.signal.publish(Some(user_id)).await {
            warn!(error = %err, "client: failed to publish avatar invalidation");
        }
        let _ = self
            .events
            .send(ClientEvent::DirectoryUpdated(profile.clone()));
        Ok(profile)
    }

    pub async fn delete_account(&self) -> ClientResult<()> {
        let user_id = self.current_user_id().await?;
        self.api.delete_user(user_id).await?;
        info!(%user_id, "client: account deleted");
        self.logout().await;
        Ok(())
    }

    /// Invalidates cached avatars here and in every other running instance.
    pub async fn invalidate_avatars(&self, user_id: Option<UserId>) -> anyhow::Result<SignalRecord> {
        self.directory.invalidate(user_id);
        self.signal.publish(user_id).await
    }

    fn spawn_event_pump(&self) -> JoinHandle<()> {
        let pump = EventPump {
            store: self.store.clone(),
            presence: self.presence.clone(),
            directory: self.directory.clone(),
            events: self.events.clone(),
        };
        let mut inbound = self.router.subscribe_all();
        let mut notices = self.router.subscribe_errors();
        let mut router_lag = self.router.subscribe_lagged();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = inbound.recv() => match event {
                        Ok(event) => pump.handle(event).await,
                        Err(RecvError::Lagged(skipped)) => pump.resync(skipped).await,
                        Err(RecvError::Closed) => break,
                    },
                    skipped = router_lag.recv() => match skipped {
                        Ok(skipped) => pump.resync(skipped).await,
                        Err(RecvError::Lagged(_)) => pump.resync(0).await,
                        Err(RecvError::Closed) => break,
                    },
                    notice = notices.recv() => match notice {
                        Ok(notice) => pump.emit(ClientEvent::RemoteError(notice)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client: error notices dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_status_relay(&self) -> JoinHandle<()> {
        let mut status = self.channel.subscribe_status();
        let store = self.store.clone();
        let presence = self.presence.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut was_authenticated = false;
            loop {
                let current = status.borrow_and_update().clone();
                let _ = events.send(ClientEvent::ConnectionChanged(current.clone()));
                if current.is_authenticated() && !was_authenticated {
                    // Presence may have changed while the channel was down.
                    let peers = store.known_peers().await;
                    presence.request_bulk_status(&peers).await;
                }
                if current.credential_rejected() {
                    warn!("client: credential rejected by the server");
                    let _ = events.send(ClientEvent::SessionExpired);
                }
                was_authenticated = current.is_authenticated();
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_directory_relay(&self) -> JoinHandle<()> {
        let mut updates = self.directory.subscribe_updates();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(profile) => {
                        let _ = events.send(ClientEvent::DirectoryUpdated(profile));
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_signal_watcher(&self) -> JoinHandle<()> {
        let directory = self.directory.clone();
        let events = self.events.clone();
        self.signal.watch(move |record| {
            directory.invalidate(record.user_id);
            let _ = events.send(ClientEvent::AvatarsInvalidated(record.user_id));
        })
    }
}

/// The single consumer of routed server events; every transport-driven state
/// change goes through here in arrival order.
struct EventPump {
    store: Arc<ConversationStore>,
    presence: Arc<PresenceTracker>,
    directory: Arc<DirectoryCache>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventPump {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageCreated(message) => {
                let chat_id = message.chat;
                let outcome = self.store.handle_message_created(message).await;
                if !outcome.known_chat {
                    if let Err(err) = self.store.refresh_chat(chat_id).await {
                        warn!(%chat_id, error = %err, "client: could not heal desync");
                    }
                }
            }
            ServerEvent::ChatCreated(chat) => {
                self.store.handle_chat_created(chat).await;
            }
            ServerEvent::UserStatusChanged { user_id, is_online } => {
                self.apply_presence(PresenceChange::Single { user_id, is_online });
            }
            ServerEvent::OnlineUsers(snapshot) => {
                self.apply_presence(PresenceChange::Bulk(snapshot));
            }
            ServerEvent::SearchResults { users } => {
                let profiles = users
                    .iter()
                    .map(|record| self.directory.store_record(record))
                    .collect();
                self.emit(ClientEvent::SearchResults(profiles));
            }
            // Reported through the router's error stream.
            ServerEvent::Error { .. } => {}
        }
    }

    fn apply_presence(&self, change: PresenceChange) {
        let changed = self.presence.apply(&change);
        if !changed.is_empty() {
            self.emit(ClientEvent::PresenceChanged(changed));
        }
    }

    /// Events were dropped; reload the chat list so the model converges.
    async fn resync(&self, skipped: u64) {
        warn!(skipped, "client: event pump lagged; reloading chats");
        if let Err(err) = self.store.load_chats().await {
            error!(error = %err, "client: resync failed");
            self.emit(ClientEvent::Error(format!("resync failed: {err}")));
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
