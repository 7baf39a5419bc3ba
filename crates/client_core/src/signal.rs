//! Cross-instance avatar invalidation.
//!
//! Every running client watches one small JSON file. Writing a new record to
//! it tells the others to drop cached avatars, either for one user or for
//! everyone.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tokio::{fs, task::JoinHandle, time};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub written_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Process id of the publisher.
    #[serde(default)]
    pub writer: u32,
    /// Per-process publish counter; keeps records written within the same
    /// millisecond distinct.
    #[serde(default)]
    pub seq: u64,
}

static PUBLISH_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct InvalidationSignal {
    path: PathBuf,
    poll_interval: Duration,
}

impl InvalidationSignal {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a new record. The file is replaced atomically so watchers never
    /// observe a partial write.
    pub async fn publish(&self, user_id: Option<UserId>) -> anyhow::Result<SignalRecord> {
        let record = SignalRecord {
            written_at_ms: now_ms(),
            user_id,
            writer: std::process::id(),
            seq: PUBLISH_SEQ.fetch_add(1, Ordering::Relaxed) + 1,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create '{}'", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&record)?)
            .await
            .with_context(|| format!("failed to write '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace '{}'", self.path.display()))?;
        info!(user_id = ?user_id, path = %self.path.display(), "signal: invalidation published");
        Ok(record)
    }

    /// Current record, or `None` when the file is missing or unreadable.
    pub async fn read(&self) -> Option<SignalRecord> {
        let raw = fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "signal: unreadable record");
                None
            }
        }
    }

    /// Polls the file and calls `on_signal` with every record that differs
    /// from the last one seen. Whatever is on disk when the watcher starts is
    /// treated as already seen.
    pub fn watch<F>(&self, on_signal: F) -> JoinHandle<()>
    where
        F: Fn(SignalRecord) + Send + 'static,
    {
        let signal = self.clone();
        tokio::spawn(async move {
            let mut last = signal.read().await;
            let mut ticker = time::interval(signal.poll_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = signal.read().await;
                if current.is_some() && current != last {
                    if let Some(record) = current {
                        debug!(written_at_ms = record.written_at_ms, "signal: change observed");
                        on_signal(record);
                    }
                    last = current;
                }
            }
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
