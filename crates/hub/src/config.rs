// Hub configuration.
//
// Environment variables with defaults for local development. The sweep
// settings govern the liveness timer in `sweep`; everything else about
// routing is protocol-defined and not configurable.

use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND: &str = "0.0.0.0:4600";
/// Default liveness sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Default idle time before a client is forcibly disconnected.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Core hub settings, constructed via [`HubConfig::from_env`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address (host:port).
    pub bind: String,
    /// How often the liveness sweep runs.
    pub sweep_interval: Duration,
    /// Idle time after which the sweep terminates a client.
    pub client_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_owned(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

impl HubConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_HUB_BIND` | `0.0.0.0:4600` |
    /// | `TANDEM_HUB_SWEEP_INTERVAL_MS` | `30000` |
    /// | `TANDEM_HUB_CLIENT_TIMEOUT_MS` | `60000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let bind = env("TANDEM_HUB_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_owned());

        let sweep_interval = env("TANDEM_HUB_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);

        let client_timeout = env("TANDEM_HUB_CLIENT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CLIENT_TIMEOUT);

        Self { bind, sweep_interval, client_timeout }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
