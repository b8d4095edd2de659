use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not read settings from {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid settings: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Everything needed to run progress sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub channel: ChannelSettings,
    pub snapshot: SnapshotSettings,
    pub session: SessionSettings,
}

impl SyncSettings {
    pub fn from_ron_str(text: &str) -> Result<Self, SettingsError> {
        Ok(ron::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&text)
    }
}

/// Push transport settings. Credentials come from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Websocket base, e.g. `wss://ws-eu.pusher.com`.
    pub endpoint: String,
    pub app_key: String,
    /// Channel name is this prefix followed by the workspace id.
    pub channel_prefix: String,
    pub event_buffer: usize,
    #[serde(rename = "min_backoff_ms", with = "duration_ms")]
    pub min_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    /// Consecutive failed connection attempts before giving up; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,
    #[serde(rename = "activity_timeout_ms", with = "duration_ms")]
    pub activity_timeout: Duration,
    #[serde(rename = "pong_timeout_ms", with = "duration_ms")]
    pub pong_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            endpoint: "wss://ws-mt1.pusher.com".to_string(),
            app_key: String::new(),
            channel_prefix: "workspace-".to_string(),
            event_buffer: 64,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: None,
            handshake_timeout: Duration::from_secs(10),
            activity_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

/// System-of-record query settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub base_url: String,
    pub auth_token: Option<String>,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    pub max_bytes: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(rename = "fetch_timeout_ms", with = "duration_ms")]
    pub fetch_timeout: Duration,
    /// Failed fetches in a row before consumers are told the session is degraded.
    pub max_consecutive_failures: u32,
    pub notice_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(10),
            max_consecutive_failures: 5,
            notice_buffer: 64,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
