use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{
    directory::DirectorySettings,
    transport::{ReconnectBackoff, TransportSettings},
};

pub const DEFAULT_SETTINGS_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_url: String,
    pub socket_url: String,
    pub media_root: String,
    pub default_avatar_url: String,
    pub signal_path: PathBuf,
    pub signal_poll_ms: u64,
    pub heartbeat_secs: u64,
    pub handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: ReconnectBackoff,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_concurrent_lookups: usize,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".into(),
            socket_url: "ws://localhost:5000".into(),
            media_root: "http://localhost:8000/media".into(),
            default_avatar_url: "assets/default-avatar.png".into(),
            signal_path: std::env::temp_dir().join("chat_client_avatar_cache_invalidated"),
            signal_poll_ms: 1_000,
            heartbeat_secs: 30,
            handshake_timeout_secs: 10,
            connect_timeout_secs: 10,
            reconnect_attempts: 5,
            reconnect_backoff: ReconnectBackoff::Fixed,
            reconnect_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_concurrent_lookups: 4,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    /// Overlays `CHAT_*` / `APP__*` variables; the `APP__` spelling wins when
    /// both are set.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(&format!("APP__{key}")).or_else(|| lookup(&format!("CHAT_{key}")))
        };

        if let Some(v) = var("API_URL") {
            self.api_url = v;
        }
        if let Some(v) = var("SOCKET_URL") {
            self.socket_url = v;
        }
        if let Some(v) = var("MEDIA_ROOT") {
            self.media_root = v;
        }
        if let Some(v) = var("DEFAULT_AVATAR") {
            self.default_avatar_url = v;
        }
        if let Some(v) = var("SIGNAL_PATH") {
            self.signal_path = PathBuf::from(v);
        }
        if let Some(v) = var("HEARTBEAT_SECS") {
            match v.parse() {
                Ok(parsed) => self.heartbeat_secs = parsed,
                Err(_) => warn!(value = %v, "config: ignoring non-numeric HEARTBEAT_SECS"),
            }
        }
        if let Some(v) = var("RECONNECT_ATTEMPTS") {
            match v.parse() {
                Ok(parsed) => self.reconnect_attempts = parsed,
                Err(_) => warn!(value = %v, "config: ignoring non-numeric RECONNECT_ATTEMPTS"),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("api_url", &self.api_url),
            ("socket_url", &self.socket_url),
            ("media_root", &self.media_root),
        ] {
            Url::parse(value).with_context(|| format!("{name} is not a valid URL: '{value}'"))?;
        }
        let socket = Url::parse(&self.socket_url)?;
        if !matches!(socket.scheme(), "ws" | "wss") {
            return Err(anyhow!(
                "socket_url must use ws:// or wss://, got '{}'",
                self.socket_url
            ));
        }
        if self.reconnect_attempts == 0 {
            return Err(anyhow!("reconnect_attempts must be at least 1"));
        }
        if self.heartbeat_secs == 0 {
            return Err(anyhow!("heartbeat_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            socket_url: self.socket_url.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_attempts: self.reconnect_attempts,
            backoff: self.reconnect_backoff,
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            frame_buffer: self.event_buffer,
        }
    }

    pub fn directory_settings(&self) -> DirectorySettings {
        DirectorySettings {
            media_root: self.media_root.clone(),
            default_avatar_url: self.default_avatar_url.clone(),
            max_concurrent_lookups: self.max_concurrent_lookups.max(1),
        }
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms.max(10))
    }
}

/// Reads settings from `path` (or [`DEFAULT_SETTINGS_FILE`]), then applies
/// environment overrides. A missing file is not an error.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let path = path.map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE), Path::to_path_buf);
    let mut settings = match fs::read_to_string(&path) {
        Ok(raw) => parse_settings(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => ClientSettings::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    };
    settings.apply_env(|name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn parse_settings(raw: &str) -> anyhow::Result<ClientSettings> {
    Ok(toml::from_str::<ClientSettings>(raw)?)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let settings = ClientSettings::default();
        assert_eq!(settings.api_url, "http://localhost:8000/api");
        assert_eq!(settings.heartbeat_secs, 30);
        assert_eq!(settings.reconnect_attempts, 5);
        assert_eq!(settings.reconnect_delay_ms, 1_000);
        settings.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let settings = parse_settings(
            r#"
            api_url = "https://chat.example.com/api"
            reconnect_attempts = 3
            reconnect_backoff = "exponential"
            "#,
        )
        .expect("parse");
        assert_eq!(settings.api_url, "https://chat.example.com/api");
        assert_eq!(settings.reconnect_attempts, 3);
        assert_eq!(settings.reconnect_backoff, ReconnectBackoff::Exponential);
        assert_eq!(settings.socket_url, "ws://localhost:5000");
    }

    #[test]
    fn env_overrides_prefer_app_prefix() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CHAT_API_URL", "http://chat-prefix/api"),
            ("APP__API_URL", "http://app-prefix/api"),
            ("CHAT_RECONNECT_ATTEMPTS", "7"),
            ("CHAT_HEARTBEAT_SECS", "soon"),
        ]);
        let mut settings = ClientSettings::default();
        settings.apply_env(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings.api_url, "http://app-prefix/api");
        assert_eq!(settings.reconnect_attempts, 7);
        assert_eq!(settings.heartbeat_secs, 30);
    }

    #[test]
    fn rejects_http_socket_url() {
        let settings = ClientSettings {
            socket_url: "http://localhost:5000".into(),
            ..ClientSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings =
            load_settings(Some(&dir.path().join("absent.toml"))).expect("load defaults");
        assert_eq!(settings.media_root, ClientSettings::default().media_root);
    }
}
