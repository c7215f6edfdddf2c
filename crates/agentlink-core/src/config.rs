//! Configuration resolution for the agentlink relay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/agentlink/relay.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`AGENTLINK_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are deep-merged as JSON, so an overlay only needs to name the keys
//! it changes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

/// Listener and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub database_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            database_path: None,
        }
    }
}

/// Credential issuance settings. The signing secret is deliberately absent:
/// it is only accepted from the command line or the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub issuer: String,
    pub access_ttl_secs: i64,
    pub agent_token_ttl_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "agentlink-relay".to_string(),
            access_ttl_secs: 3600,
            agent_token_ttl_secs: 30 * 24 * 60 * 60, // 30 days
        }
    }
}

/// Connection and tool-call behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    pub default_tool_timeout_secs: f64,
    pub max_tool_timeout_secs: f64,
    pub heartbeat_interval_secs: u64,
    /// Silent intervals tolerated before a connection is dropped.
    pub missed_heartbeats: u32,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue: usize,
    /// Tools that may run while the agent has no editor tool server.
    pub tools_without_tool_server: Vec<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_tool_timeout_secs: 30.0,
            max_tool_timeout_secs: 300.0,
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            outbound_queue: 128,
            tools_without_tool_server: vec!["ping".to_string()],
        }
    }
}

impl RelaySettings {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Longest silence a connection may keep before it is considered dead.
    pub fn silence_limit(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats.max(1)
    }

    /// Falls back to 30s when the configured value is not a positive number.
    pub fn default_tool_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_tool_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(30))
    }
}

/// Per-user circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown_secs: 30,
            max_cooldown_secs: 300,
        }
    }
}

impl BreakerConfig {
    pub const fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.base_cooldown_secs)
    }

    pub const fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is the file passed on the command line; it must exist when
/// given. The global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<RelayConfig> {
    let mut merged = serde_json::to_value(RelayConfig::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_json(&mut merged, read_config_value(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, read_config_value(path)?);
    }

    let mut config: RelayConfig = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".agentlink").join("relay.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/agentlink/relay.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("agentlink").join("relay.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`. Objects merge key by key,
/// everything else replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `AGENTLINK_*` overrides read through `lookup`.
///
/// Unparseable values are ignored so a typo never prevents startup.
pub fn apply_env_overrides(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = lookup("AGENTLINK_ADDR").and_then(|v| v.parse().ok()) {
        config.server.addr = addr;
    }
    if let Some(path) = lookup("AGENTLINK_DATABASE_PATH") {
        config.server.database_path = Some(PathBuf::from(path));
    }
    if let Some(issuer) = lookup("AGENTLINK_ISSUER") {
        config.auth.issuer = issuer;
    }
    if let Some(secs) = lookup("AGENTLINK_TOOL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.relay.default_tool_timeout_secs = secs;
    }
    if let Some(secs) = lookup("AGENTLINK_HEARTBEAT_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.relay.heartbeat_interval_secs = secs;
    }
    if let Some(n) = lookup("AGENTLINK_BREAKER_THRESHOLD").and_then(|v| v.parse().ok()) {
        config.breaker.failure_threshold = n;
    }
    if let Some(secs) = lookup("AGENTLINK_BREAKER_COOLDOWN_SECS").and_then(|v| v.parse().ok()) {
        config.breaker.base_cooldown_secs = secs;
    }
}
