use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default command server the Python side listens on.
pub const DEFAULT_URL: &str = "ws://localhost:8001/";

/// Client identifier sent in the handshake frame.
pub const DEFAULT_CLIENT_NAME: &str = "visualizer";

/// Default delay between a close and the next connection attempt.
pub const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 1000;

/// Connection settings. Loadable from a JSON file; CLI flags override it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// Fixed delay before every reconnect attempt, in milliseconds.
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Directory GLTF `path`s are resolved against (native only).
    #[serde(default)]
    pub asset_root: Option<PathBuf>,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_reconnect_timeout_ms() -> u64 {
    DEFAULT_RECONNECT_TIMEOUT_MS
}

fn default_client_name() -> String {
    DEFAULT_CLIENT_NAME.to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            client_name: default_client_name(),
            asset_root: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
