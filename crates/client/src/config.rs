// Local configuration file for the client.
//
// Default location: `~/.tandem/client.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sync::{EngineConfig, ResolutionStrategy};
use crate::transport::{ConnectionConfig, ReconnectPolicy};

/// Root directory for tandem state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tandem"))
}

/// Path to the client config file: `~/.tandem/client.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("client.toml"))
}

// ── Client config ───────────────────────────────────────────────────

/// Client configuration at `~/.tandem/client.toml`. Every field has a
/// default, so a partial file or no file at all is fine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Transport settings.
    pub connection: ConnectionSettings,
    /// Synchronization engine settings.
    pub sync: SyncSettings,
}

impl ClientConfig {
    /// Load from `~/.tandem/client.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        default_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Transport configuration, when the file names a server and user.
    pub fn connection_config(&self) -> Option<ConnectionConfig> {
        let url = self.connection.url.clone()?;
        let user_id = self.connection.user_id.clone()?;
        let mut config = ConnectionConfig::new(url, user_id);
        config.queue_capacity = self.connection.queue_capacity;
        config.heartbeat_interval = Duration::from_millis(self.connection.heartbeat_interval_ms);
        config.reconnect = ReconnectPolicy {
            enabled: self.connection.reconnect.enabled,
            base_delay: Duration::from_millis(self.connection.reconnect.base_delay_ms),
            decay: self.connection.reconnect.decay,
            max_delay: Duration::from_millis(self.connection.reconnect.max_delay_ms),
            max_attempts: self.connection.reconnect.max_attempts,
        };
        Some(config)
    }

    /// Engine configuration derived from the `[sync]` table.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            strategy: self.sync.strategy,
            auto_resolve: self.sync.auto_resolve,
            conflict_window: Duration::from_millis(self.sync.conflict_window_ms),
            history_limit: self.sync.history_limit,
            resync_interval: Duration::from_millis(self.sync.resync_interval_ms),
            lock_timeout: Duration::from_millis(self.sync.lock_timeout_ms),
        }
    }
}

/// Transport settings in the `[connection]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Server URL (e.g. `wss://hub.example.com/ws`).
    pub url: Option<String>,
    /// User this client connects as.
    pub user_id: Option<String>,
    /// Offline send queue capacity.
    pub queue_capacity: usize,
    /// Heartbeat ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Reconnection policy.
    pub reconnect: ReconnectSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: None,
            user_id: None,
            queue_capacity: 100,
            heartbeat_interval_ms: 30_000,
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Backoff settings in the `[connection.reconnect]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per failed attempt.
    pub decay: f64,
    /// Delay ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Consecutive failures before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1000,
            decay: 1.5,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

/// Engine settings in the `[sync]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Conflict resolution strategy: `last-write-wins`,
    /// `operational-transformation`, `lock-based`, or `manual`.
    pub strategy: ResolutionStrategy,
    /// Settle conflicts immediately instead of surfacing them.
    pub auto_resolve: bool,
    /// Same-path edits closer than this conflict, in milliseconds.
    pub conflict_window_ms: u64,
    /// Bounded change history cap.
    pub history_limit: usize,
    /// Snapshot re-request period in milliseconds.
    pub resync_interval_ms: u64,
    /// Advisory lock lifetime in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::LastWriteWins,
            auto_resolve: true,
            conflict_window_ms: 5000,
            history_limit: 100,
            resync_interval_ms: 5000,
            lock_timeout_ms: 30_000,
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ── Tests ───────────────────────────────────────────────────────────
