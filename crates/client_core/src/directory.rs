//! Peer profile directory.
//!
//! Lookups go through the REST gateway and are memoized per user. At most one
//! fetch per user is outstanding at a time and the number of concurrent
//! fetches is bounded by a semaphore. Invalidation drops cached entries and
//! retires any fetch that was already running, so a response that raced an
//! invalidation can never repopulate the cache.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use shared::domain::{PeerProfile, UserId, UserRecord};
use tokio::sync::{broadcast, oneshot, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    gateway::ChatApi,
    session::SessionContext,
};

#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub media_root: String,
    pub default_avatar_url: String,
    pub max_concurrent_lookups: usize,
}

/// Picks the avatar URL for a user record: the server-supplied absolute URL
/// first, then the raw avatar path joined with the media root, then the
/// default placeholder.
pub fn resolve_avatar_url(record: &UserRecord, media_root: &str, default_avatar_url: &str) -> String {
    if let Some(url) = non_empty(record.avatar_url.as_deref()) {
        return url.to_string();
    }
    let Some(avatar) = non_empty(record.avatar.as_deref()) else {
        return default_avatar_url.to_string();
    };
    if Url::parse(avatar).is_ok() {
        return avatar.to_string();
    }
    if avatar.starts_with('/') {
        return match Url::parse(media_root) {
            Ok(root) => format!("{}{avatar}", root.origin().ascii_serialization()),
            Err(_) => avatar.to_string(),
        };
    }
    format!("{}/{avatar}", media_root.trim_end_matches('/'))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

type Waiter = oneshot::Sender<ClientResult<PeerProfile>>;

struct Inflight {
    ticket: u64,
    /// Cleared by an invalidation that happens while the fetch is running.
    fresh: bool,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct DirectoryState {
    profiles: HashMap<UserId, PeerProfile>,
    inflight: HashMap<UserId, Inflight>,
    next_ticket: u64,
}

pub struct DirectoryCache {
    settings: DirectorySettings,
    api: Arc<dyn ChatApi>,
    session: Arc<SessionContext>,
    state: Mutex<DirectoryState>,
    lookups: Semaphore,
    updates: broadcast::Sender<PeerProfile>,
}

impl DirectoryCache {
    pub fn new(
        settings: DirectorySettings,
        api: Arc<dyn ChatApi>,
        session: Arc<SessionContext>,
    ) -> Arc<Self> {
        let lookups = Semaphore::new(settings.max_concurrent_lookups.max(1));
        let (updates, _) = broadcast::channel(256);
        Arc::new(Self {
            settings,
            api,
            session,
            state: Mutex::new(DirectoryState::default()),
            lookups,
            updates,
        })
    }

    /// Profiles that were fetched (or re-fetched) successfully.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<PeerProfile> {
        self.updates.subscribe()
    }

    /// Returns the cached profile, or a placeholder while a lookup runs in the
    /// background.
    pub fn resolve_profile(self: &Arc<Self>, user_id: UserId) -> PeerProfile {
        self.lookup(user_id, None).unwrap_or_else(|| {
            PeerProfile::placeholder(user_id, self.settings.default_avatar_url.clone())
        })
    }

    /// Waits for the profile, joining an outstanding fetch when there is one.
    pub async fn resolve_profile_now(self: &Arc<Self>, user_id: UserId) -> ClientResult<PeerProfile> {
        let (tx, rx) = oneshot::channel();
        if let Some(profile) = self.lookup(user_id, Some(tx)) {
            return Ok(profile);
        }
        rx.await.map_err(|_| ClientError::SessionEnded)?
    }

    pub fn warm(self: &Arc<Self>, user_ids: impl IntoIterator<Item = UserId>) {
        for user_id in user_ids {
            self.lookup(user_id, None);
        }
    }

    pub fn cached_profile(&self, user_id: UserId) -> Option<PeerProfile> {
        self.state.lock().profiles.get(&user_id).cloned()
    }

    pub fn avatar_url(&self, user_id: UserId) -> String {
        self.state
            .lock()
            .profiles
            .get(&user_id)
            .map(|profile| profile.avatar_url.clone())
            .unwrap_or_else(|| self.settings.default_avatar_url.clone())
    }

    /// Drops one (`Some`) or every (`None`) cached entry. The next resolve
    /// for an affected user fetches again.
    pub fn invalidate(&self, user_id: Option<UserId>) {
        let mut state = self.state.lock();
        match user_id {
            Some(user_id) => {
                state.profiles.remove(&user_id);
                if let Some(inflight) = state.inflight.get_mut(&user_id) {
                    inflight.fresh = false;
                }
            }
            None => {
                state.profiles.clear();
                for inflight in state.inflight.values_mut() {
                    inflight.fresh = false;
                }
            }
        }
        info!(user_id = ?user_id, "directory: cache invalidated");
    }

    /// Forgets everything, including outstanding waiters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.profiles.clear();
        state.inflight.clear();
    }

    pub fn profile_from_record(&self, record: &UserRecord) -> PeerProfile {
        PeerProfile {
            id: record.id,
            display_name: record.username.clone(),
            handle: record.email.clone(),
            bio: record.bio.clone(),
            avatar_url: resolve_avatar_url(
                record,
                &self.settings.media_root,
                &self.settings.default_avatar_url,
            ),
            is_online: record.is_online,
        }
    }

    /// Caches a record that arrived through another path (search results,
    /// profile updates).
    pub fn store_record(&self, record: &UserRecord) -> PeerProfile {
        let profile = self.profile_from_record(record);
        self.state.lock().profiles.insert(record.id, profile.clone());
        profile
    }

    fn lookup(self: &Arc<Self>, user_id: UserId, waiter: Option<Waiter>) -> Option<PeerProfile> {
        let mut state = self.state.lock();
        if let Some(profile) = state.profiles.get(&user_id) {
            return Some(profile.clone());
        }

        let mut waiters: Vec<Waiter> = waiter.into_iter().collect();
        if let Some(inflight) = state.inflight.get_mut(&user_id) {
            if inflight.fresh {
                inflight.waiters.append(&mut waiters);
                return None;
            }
            // Retired by an invalidation; its result will be discarded.
            waiters.append(&mut inflight.waiters);
        }

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.inflight.insert(
            user_id,
            Inflight {
                ticket,
                fresh: true,
                waiters,
            },
        );
        drop(state);

        debug!(%user_id, ticket, "directory: lookup started");
        let generation = self.session.generation();
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.fetch(user_id, ticket, generation).await });
        None
    }

    async fn fetch(self: Arc<Self>, user_id: UserId, ticket: u64, generation: u64) {
        let result = match self.lookups.acquire().await {
            Ok(_permit) => self
                .api
                .get_user(user_id)
                .await
                .map(|record| self.profile_from_record(&record)),
            Err(_) => Err(ClientError::SessionEnded),
        };
        self.complete(user_id, ticket, generation, result);
    }

    fn complete(
        &self,
        user_id: UserId,
        ticket: u64,
        generation: u64,
        result: ClientResult<PeerProfile>,
    ) {
        let mut state = self.state.lock();
        let inflight = match state.inflight.remove(&user_id) {
            Some(inflight) if inflight.ticket == ticket => inflight,
            Some(other) => {
                state.inflight.insert(user_id, other);
                debug!(%user_id, ticket, "directory: superseded lookup discarded");
                return;
            }
            None => return,
        };

        let result = if self.session.is_current(generation) {
            result
        } else {
            Err(ClientError::SessionEnded)
        };
        let mut announce = None;
        match &result {
            Ok(profile) if inflight.fresh => {
                state.profiles.insert(user_id, profile.clone());
                announce = Some(profile.clone());
            }
            Ok(_) => debug!(%user_id, "directory: lookup finished after invalidation; not cached"),
            Err(err) => warn!(%user_id, error = %err, "directory: lookup failed"),
        }
        drop(state);

        for waiter in inflight.waiters {
            let _ = waiter.send(result.clone());
        }
        if let Some(profile) = announce {
            let _ = self.updates.send(profile);
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
