//! Client configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable                          | Default               |
//! |-----------------------------------|-----------------------|
//! | `COWHITEBOARD_SERVER_URL`         | `ws://localhost:8000` |
//! | `COWHITEBOARD_RECONNECT_DELAY_MS` | `2000`                |

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::RoomId;
use crate::supervisor::DEFAULT_RECONNECT_DELAY;
use crate::transport::endpoint;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8000";

const ENV_PREFIX: &str = "COWHITEBOARD_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay base URL; rooms live under `{server_url}/ws/{room}`.
    pub server_url: String,
    pub room_id: RoomId,
    /// Delay between a dropped connection and the next attempt.
    pub reconnect_delay: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    server_url: Option<String>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment configuration: {0}")]
    Env(#[from] envy::Error),
    #[error("Server URL must start with ws:// or wss://, got {0:?}")]
    InvalidServerUrl(String),
}

impl ClientConfig {
    pub fn new(room_id: impl Into<RoomId>) -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            room_id: room_id.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Defaults overridden by `COWHITEBOARD_*` environment variables.
    pub fn from_env(room_id: impl Into<RoomId>) -> Result<Self, ConfigError> {
        let overrides = envy::prefixed(ENV_PREFIX).from_env::<EnvOverrides>()?;
        Self::new(room_id).apply(overrides)
    }

    /// Same as [`from_env`](Self::from_env) but reading from `vars`.
    pub fn from_vars<I>(room_id: impl Into<RoomId>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides = envy::prefixed(ENV_PREFIX).from_iter::<_, EnvOverrides>(vars)?;
        Self::new(room_id).apply(overrides)
    }

    fn apply(mut self, overrides: EnvOverrides) -> Result<Self, ConfigError> {
        if let Some(url) = overrides.server_url {
            self.server_url = url;
        }
        if let Some(ms) = overrides.reconnect_delay_ms {
            self.reconnect_delay = Duration::from_millis(ms);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://") {
            Ok(())
        } else {
            Err(ConfigError::InvalidServerUrl(self.server_url.clone()))
        }
    }

    /// Full URL of this room's endpoint.
    pub fn endpoint(&self) -> String {
        endpoint(&self.server_url, &self.room_id)
    }
}
