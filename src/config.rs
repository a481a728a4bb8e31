//! Client configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::Session;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_MATCH_WINDOW_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Push-channel reconnect bounds. Delays double from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// HTTP base URL without a trailing slash; the websocket URL derives from it.
    pub base_url: String,
    pub user_id: String,
    pub token: String,
    /// Maximum distance between a draft's send time and an echo's server timestamp.
    pub match_window: Duration,
    pub reconnect: ReconnectPolicy,
    pub timeouts: HttpTimeouts,
    /// Directory confirmed downloads are written into.
    pub download_dir: PathBuf,
}

impl ChatConfig {
    /// Build a config with every optional setting at its default.
    #[must_use]
    pub fn new(base_url: &str, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            user_id: user_id.into(),
            token: token.into(),
            match_window: Duration::from_millis(DEFAULT_MATCH_WINDOW_MS),
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
                max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            },
            timeouts: HttpTimeouts {
                request: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
                connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            download_dir: PathBuf::from("."),
        }
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `STORECHAT_TOKEN`
    /// - `STORECHAT_USER_ID`
    ///
    /// Optional:
    /// - `STORECHAT_BASE_URL`: default `http://127.0.0.1:3000`
    /// - `STORECHAT_MATCH_WINDOW_MS`: default 5000
    /// - `STORECHAT_RECONNECT_INITIAL_MS` / `STORECHAT_RECONNECT_MAX_MS`: default 1000 / 10000
    /// - `STORECHAT_REQUEST_TIMEOUT_SECS` / `STORECHAT_CONNECT_TIMEOUT_SECS`: default 30 / 10
    /// - `STORECHAT_DOWNLOAD_DIR`: default `.`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for absent required variables and
    /// [`ConfigError::Invalid`] for numbers that do not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = required("STORECHAT_TOKEN")?;
        let user_id = required("STORECHAT_USER_ID")?;
        let base_url = std::env::var("STORECHAT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());

        let mut config = Self::new(&base_url, user_id, token);
        config.match_window = Duration::from_millis(env_u64("STORECHAT_MATCH_WINDOW_MS", DEFAULT_MATCH_WINDOW_MS)?);

        let initial = Duration::from_millis(env_u64("STORECHAT_RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS)?);
        let max = Duration::from_millis(env_u64("STORECHAT_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?);
        config.reconnect = ReconnectPolicy { initial, max: max.max(initial) };

        config.timeouts = HttpTimeouts {
            request: Duration::from_secs(env_u64("STORECHAT_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?),
            connect: Duration::from_secs(env_u64("STORECHAT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?),
        };
        if let Ok(dir) = std::env::var("STORECHAT_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    #[must_use]
    pub fn session(&self) -> Session {
        Session::new(self.user_id.clone(), self.token.clone())
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(default);
    };
    raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid { var, value: raw })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
