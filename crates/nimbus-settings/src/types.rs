//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a partial
//! settings file only needs the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type for the Nimbus client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NimbusSettings {
    /// Backend API settings.
    pub api: ApiSettings,
    /// Streaming and cancellation settings.
    pub stream: StreamSettings,
    /// Interruption recovery settings.
    pub recovery: RecoverySettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Backend API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// API root, including the `/api` prefix.
    pub base_url: String,
    /// Connection-level timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bearer token for authenticated calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Refresh token used after a 401.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            connect_timeout_ms: 10_000,
            access_token: None,
            refresh_token: None,
        }
    }
}

impl ApiSettings {
    /// Connection timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Streaming and cancellation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// How long a finished cancellation keeps absorbing repeat requests.
    pub cancel_cooldown_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            cancel_cooldown_ms: 3_000,
        }
    }
}

impl StreamSettings {
    /// Cancellation cool-down as a [`Duration`].
    pub fn cancel_cooldown(&self) -> Duration {
        Duration::from_millis(self.cancel_cooldown_ms)
    }
}

/// Interruption recovery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoverySettings {
    /// Whether partial answers are persisted on teardown.
    pub enabled: bool,
    /// Maximum age of a recovery record that is still offered back.
    pub freshness_ms: u64,
    /// Recovery file name (relative to `~/.nimbus`).
    pub file: String,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            freshness_ms: 300_000,
            file: "recovery.json".to_string(),
        }
    }
}

impl RecoverySettings {
    /// Freshness window as a [`Duration`].
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
