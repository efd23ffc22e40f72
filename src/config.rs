//! Hub Configuration
//!
//! Environment-driven configuration with production defaults. Every timing
//! knob of the room lifecycle lives here so tests can shrink them.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9175;

/// Development signing key used when `TOKEN_SIGNING_KEY` is absent.
pub const DEV_SIGNING_KEY: &str = "kyro-hub-dev-signing-key-change-in-production";

/// Hard ceiling on room capacity.
pub const MAX_CAPACITY: u32 = 50;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// TCP port for the WebSocket listener
    pub port: u16,
    /// Document store location (`memory:` or a SQLite path/URL)
    pub docstore_url: String,
    /// HS256 key for bearer tokens
    pub token_signing_key: String,
    /// Exact origin allowed on the WebSocket handshake, if restricted
    pub cors_origin: Option<String>,
    /// Default room capacity when the control plane does not pick one
    pub capacity_default: u32,
    /// Quiet period before a debounced save fires
    pub debounce: Duration,
    /// Upper bound on persisted-state staleness under continuous edits
    pub max_staleness: Duration,
    /// How long an empty room stays resident before teardown
    pub idle_grace: Duration,
    /// Typing indicator expiry without a refresh
    pub typing_ttl: Duration,
    /// Server ping cadence
    pub heartbeat_interval: Duration,
    /// Close a session after this long without any client frame
    pub heartbeat_timeout: Duration,
    /// Failed save attempts before the room degrades
    pub save_retry_budget: u32,
    /// First save retry delay; doubles per attempt
    pub save_backoff_initial: Duration,
    /// Retry delay ceiling
    pub save_backoff_cap: Duration,
    /// Per-session outbound frame queue bound
    pub outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            docstore_url: "kyro-hub.db".to_string(),
            token_signing_key: DEV_SIGNING_KEY.to_string(),
            cors_origin: None,
            capacity_default: 10,
            debounce: Duration::from_secs(1),
            max_staleness: Duration::from_secs(30),
            idle_grace: Duration::from_secs(300),
            typing_ttl: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            save_retry_budget: 5,
            save_backoff_initial: Duration::from_millis(500),
            save_backoff_cap: Duration::from_secs(30),
            outbox_capacity: 256,
        }
    }
}

impl HubConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT: {}", port)))?;
        }
        if let Ok(url) = std::env::var("DOCSTORE_URL") {
            config.docstore_url = url;
        }
        if let Ok(key) = std::env::var("TOKEN_SIGNING_KEY") {
            if key.is_empty() {
                return Err(Error::Config("TOKEN_SIGNING_KEY must not be empty".to_string()));
            }
            config.token_signing_key = key;
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            config.cors_origin = Some(origin);
        }
        if let Some(ms) = env_millis("DEBOUNCE_MS")? {
            config.debounce = ms;
        }
        if let Some(ms) = env_millis("MAX_STALENESS_MS")? {
            config.max_staleness = ms;
        }
        if let Some(ms) = env_millis("IDLE_GRACE_MS")? {
            config.idle_grace = ms;
        }
        if let Ok(capacity) = std::env::var("CAPACITY_DEFAULT") {
            let capacity: u32 = capacity
                .parse()
                .map_err(|_| Error::Config(format!("invalid CAPACITY_DEFAULT: {}", capacity)))?;
            if capacity == 0 || capacity > MAX_CAPACITY {
                return Err(Error::Config(format!(
                    "CAPACITY_DEFAULT must be between 1 and {}",
                    MAX_CAPACITY
                )));
            }
            config.capacity_default = capacity;
        }
        if config.debounce > config.max_staleness {
            return Err(Error::Config(
                "DEBOUNCE_MS must not exceed MAX_STALENESS_MS".to_string(),
            ));
        }

        Ok(config)
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => {
            let ms: u64 = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid {}: {}", name, value)))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}
