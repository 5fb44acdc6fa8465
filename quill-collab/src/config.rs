//! Session configuration.
//!
//! Loads from JSON with camelCase keys; every key is optional and
//! durations are given in milliseconds:
//!
//! ```json
//! {
//!   "serverUrl": "ws://127.0.0.1:9090",
//!   "documentId": "notes",
//!   "heartbeatInterval": 30000,
//!   "user": { "name": "Ada" }
//! }
//! ```

use quill_crdt::{ReplicaConfig, SiteId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SessionError;
use crate::reconnect::ReconnectPolicy;

/// Identity of the local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    /// Site id to use; a random one is generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<SiteId>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            id: None,
            name: "Anonymous".to_string(),
            avatar: None,
        }
    }
}

/// Collaboration session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Channel endpoint; required to connect
    pub server_url: Option<String>,
    /// Room name appended to `server_url`
    pub document_id: String,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis")]
    pub sync_interval: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    #[serde(with = "millis")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "millis")]
    pub reconnect_max_delay: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub user: UserProfile,
    /// Generated from the site id when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_color: Option<String>,
    /// Minimum spacing between outgoing cursor updates
    #[serde(with = "millis")]
    pub cursor_throttle: Duration,
    /// Remote users silent for longer than this are shown offline
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    pub max_pending_operations: usize,
    #[serde(with = "millis")]
    pub dependency_timeout: Duration,
    /// Local operations kept while disconnected
    pub offline_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            document_id: "default".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(5),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user: UserProfile::default(),
            cursor_color: None,
            cursor_throttle: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(90),
            max_pending_operations: 1024,
            dependency_timeout: Duration::from_secs(30),
            offline_queue_capacity: 10_000,
        }
    }
}

impl SessionConfig {
    /// Config pointing at `server_url`, defaults elsewhere.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: Some(server_url.into()),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.heartbeat_interval.is_zero() {
            return Err(SessionError::InvalidConfig("heartbeatInterval must be positive".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(SessionError::InvalidConfig("syncInterval must be positive".into()));
        }
        if self.document_id.is_empty() {
            return Err(SessionError::InvalidConfig("documentId must not be empty".into()));
        }
        Ok(())
    }

    /// `{serverUrl}/{documentId}`.
    pub fn channel_url(&self) -> Result<String, SessionError> {
        let server = self
            .server_url
            .as_deref()
            .ok_or_else(|| SessionError::InvalidConfig("serverUrl is required to connect".into()))?;
        Ok(format!("{}/{}", server.trim_end_matches('/'), self.document_id))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: if self.auto_reconnect {
                self.max_reconnect_attempts
            } else {
                0
            },
        }
    }

    pub fn replica_config(&self) -> ReplicaConfig {
        ReplicaConfig {
            max_pending: self.max_pending_operations,
            dependency_timeout: self.dependency_timeout,
        }
    }
}

/// `Duration` as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
