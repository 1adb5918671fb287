//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.hark/config.json`) and environment.
//! Every field has a default so an empty `{}` file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Status endpoint bind and port.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Platform application credentials and bot identity.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Admission and deduplication windows.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Connection watchdog timing.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Message classification options.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Where handoffs are delivered.
    #[serde(default)]
    pub downstream: DownstreamConfig,
}

/// Status endpoint bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP status endpoint (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Platform application credentials. Long-lived; reused across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    /// Overridden by HARK_APP_ID env.
    pub app_id: Option<String>,
    /// Overridden by HARK_APP_SECRET env.
    pub app_secret: Option<String>,
    /// Open API base URL used for endpoint discovery.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// The bot's own open id; used for mention detection and self-message suppression.
    pub bot_id: Option<String>,
}

fn default_api_base() -> String {
    "https://open.feishu.cn".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            api_base: default_api_base(),
            bot_id: None,
        }
    }
}

/// Admission staleness budget and deduplication window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfig {
    /// How long a delivery identity is remembered (default 30 minutes).
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Minimum time between expiry sweeps unless the cache is full (default 60s).
    #[serde(default = "default_dedup_cleanup_interval_secs")]
    pub dedup_cleanup_interval_secs: u64,
    /// Hard cap on remembered identities (default 10000).
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
    /// Events older than this are rejected as stale (default 5 minutes).
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: u64,
    /// Events dated further ahead than this are rejected (default 10s).
    #[serde(default = "default_future_tolerance_secs")]
    pub future_tolerance_secs: u64,
}

fn default_dedup_ttl_secs() -> u64 {
    30 * 60
}

fn default_dedup_cleanup_interval_secs() -> u64 {
    60
}

fn default_dedup_max_entries() -> usize {
    10_000
}

fn default_max_event_age_secs() -> u64 {
    5 * 60
}

fn default_future_tolerance_secs() -> u64 {
    10
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: default_dedup_ttl_secs(),
            dedup_cleanup_interval_secs: default_dedup_cleanup_interval_secs(),
            dedup_max_entries: default_dedup_max_entries(),
            max_event_age_secs: default_max_event_age_secs(),
            future_tolerance_secs: default_future_tolerance_secs(),
        }
    }
}

/// Watchdog timing. The stale threshold must stay generous: quiet rooms are normal,
/// and every forced reconnect invites a redelivery burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogConfig {
    /// Tick interval (default 60s).
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
    /// Restart when no event has arrived for this long (default 30 minutes).
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Restart once this many consecutive starts have failed (default 3).
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Upper bound on a graceful stop before it is abandoned (default 5s).
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Upper bound on opening a connection, endpoint discovery included (default 30s).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

fn default_stale_threshold_secs() -> u64 {
    30 * 60
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stop_timeout_secs: default_stop_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Message classification options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Commands accepted from any thread, even one the bot never joined.
    #[serde(default = "default_bypass_commands")]
    pub bypass_commands: Vec<String>,
    /// How many participated threads the in-memory store remembers (default 5000).
    #[serde(default = "default_participation_capacity")]
    pub participation_capacity: usize,
}

fn default_bypass_commands() -> Vec<String> {
    vec!["/new".to_string(), "/status".to_string(), "/help".to_string()]
}

fn default_participation_capacity() -> usize {
    5_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bypass_commands: default_bypass_commands(),
            participation_capacity: default_participation_capacity(),
        }
    }
}

/// Downstream delivery of handoffs. Without a URL handoffs are only logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamConfig {
    pub url: Option<String>,
    #[serde(default = "default_downstream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_downstream_timeout_secs() -> u64 {
    30
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_downstream_timeout_secs(),
        }
    }
}

/// Trimmed, non-empty env var value.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the app id: env HARK_APP_ID overrides config.
pub fn resolve_app_id(config: &Config) -> Option<String> {
    env_override("HARK_APP_ID").or_else(|| trimmed(config.platform.app_id.as_ref()))
}

/// Resolve the app secret: env HARK_APP_SECRET overrides config.
pub fn resolve_app_secret(config: &Config) -> Option<String> {
    env_override("HARK_APP_SECRET").or_else(|| trimmed(config.platform.app_secret.as_ref()))
}

/// Resolve the bot's open id (config only; it is not a secret).
pub fn resolve_bot_id(config: &Config) -> Option<String> {
    trimmed(config.platform.bot_id.as_ref())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HARK_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".hark").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
