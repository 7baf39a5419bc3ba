use std::sync::atomic::{AtomicU64, Ordering};

use shared::domain::UserId;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Session {
    pub credential: String,
    pub user_id: Option<UserId>,
}

/// Client-wide session state: the bearer credential, the signed-in identity
/// and a generation counter bumped on every login/logout. Asynchronous
/// completions capture the generation when they start and compare it before
/// mutating state.
#[derive(Debug, Default)]
pub struct SessionContext {
    current: RwLock<Option<Session>>,
    generation: AtomicU64,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, credential: impl Into<String>, user_id: Option<UserId>) -> u64 {
        let mut guard = self.current.write().await;
        *guard = Some(Session {
            credential: credential.into(),
            user_id,
        });
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn end(&self) {
        let mut guard = self.current.write().await;
        if guard.take().is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub async fn set_user_id(&self, user_id: UserId) {
        if let Some(session) = self.current.write().await.as_mut() {
            session.user_id = Some(user_id);
        }
    }

    pub async fn credential(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|session| session.credential.clone())
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.current
            .read()
            .await
            .as_ref()
            .and_then(|session| session.user_id)
    }

    pub async fn is_active(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }
}
