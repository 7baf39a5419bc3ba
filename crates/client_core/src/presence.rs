use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use shared::{domain::UserId, protocol::ClientRequest};
use tracing::debug;

use crate::{
    router::PresenceChange,
    session::SessionContext,
    transport::{ConnectionState, Transport},
};

/// Online/offline state of peers, fed by single-user deltas and bulk
/// snapshots. Unknown users read as offline.
pub struct PresenceTracker {
    statuses: RwLock<HashMap<UserId, bool>>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionContext>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionContext>) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            transport,
            session,
        }
    }

    /// Applies a change and returns the ids whose status actually flipped.
    /// A bulk snapshot only touches the ids it names.
    pub fn apply(&self, change: &PresenceChange) -> Vec<UserId> {
        let mut statuses = self.statuses.write();
        let mut changed = Vec::new();
        let mut set = |user_id: UserId, is_online: bool| {
            let previous = statuses.insert(user_id, is_online).unwrap_or(false);
            if previous != is_online {
                changed.push(user_id);
            }
        };
        match change {
            PresenceChange::Single { user_id, is_online } => set(*user_id, *is_online),
            PresenceChange::Bulk(snapshot) => {
                for (user_id, is_online) in snapshot {
                    set(*user_id, *is_online);
                }
            }
        }
        changed.sort();
        changed
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.statuses.read().get(&user_id).copied().unwrap_or(false)
    }

    pub fn online_peers(&self) -> Vec<UserId> {
        let mut online: Vec<UserId> = self
            .statuses
            .read()
            .iter()
            .filter_map(|(id, online)| online.then_some(*id))
            .collect();
        online.sort();
        online
    }

    pub fn clear(&self) {
        self.statuses.write().clear();
    }

    /// Asks the server for the current status of `user_ids`. The answer
    /// arrives later as an `online_users` snapshot. Does nothing for an empty
    /// list or while the transport is not authenticated.
    pub async fn request_bulk_status(&self, user_ids: &[UserId]) -> bool {
        if user_ids.is_empty() {
            return false;
        }
        if self.transport.state() != ConnectionState::Authenticated {
            debug!(count = user_ids.len(), "presence: transport not ready; skipping bulk query");
            return false;
        }
        let Some(token) = self.session.credential().await else {
            return false;
        };
        let mut seen = HashSet::with_capacity(user_ids.len());
        let user_ids: Vec<UserId> = user_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        debug!(count = user_ids.len(), "presence: requesting bulk status");
        self.transport
            .send(ClientRequest::GetOnlineUsers { token, user_ids })
            .await
    }
}
