//! Configuration loading.
//!
//! Reads `config.json` from the gqlsocket configuration directory and applies
//! environment variable overrides on top.
//!
//! | Variable                   | Field            |
//! |----------------------------|------------------|
//! | `GQLSOCKET_URL`            | `url`            |
//! | `GQLSOCKET_RETRY_DELAY_MS` | `retry_delay_ms` |
//! | `GQLSOCKET_MAX_ATTEMPTS`   | `max_attempts`   |
//! | `GQLSOCKET_AUTO_RECONNECT` | `auto_reconnect` |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::socket::ws::http_to_ws_scheme;
use crate::transport::{RetryLimit, RetryPolicy, TransportOptions};

/// Name of the configuration file inside the configuration directory.
pub const CONFIG_FILE: &str = "config.json";

/// Path appended to the host when no URL is configured.
pub const DEFAULT_PATH: &str = "/graphql";

/// Client configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Socket URL. `http(s)://` is rewritten to `ws(s)://`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Milliseconds to wait before each reconnect attempt.
    pub retry_delay_ms: u64,
    /// Reconnect attempts before giving up (`0` = never, negative = forever).
    pub max_attempts: i64,
    /// When `false`, no reconnect is ever attempted.
    pub auto_reconnect: bool,
    /// Sub-protocols offered on connect.
    pub protocols: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            retry_delay_ms: 2000,
            max_attempts: 20,
            auto_reconnect: true,
            protocols: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Returns the configuration directory path.
    ///
    /// Directory selection priority:
    /// 1. `GQLSOCKET_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/gqlsocket)
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("GQLSOCKET_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("gqlsocket"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields the defaults; an unreadable or malformed file is
    /// an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            log::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a specific file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Writes the configuration as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("GQLSOCKET_URL") {
            self.url = Some(url);
        }

        if let Some(delay) = lookup("GQLSOCKET_RETRY_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(ms) => self.retry_delay_ms = ms,
                Err(_) => log::warn!("Ignoring invalid GQLSOCKET_RETRY_DELAY_MS: {delay}"),
            }
        }

        if let Some(attempts) = lookup("GQLSOCKET_MAX_ATTEMPTS") {
            match attempts.parse::<i64>() {
                Ok(max) => self.max_attempts = max,
                Err(_) => log::warn!("Ignoring invalid GQLSOCKET_MAX_ATTEMPTS: {attempts}"),
            }
        }

        if let Some(flag) = lookup("GQLSOCKET_AUTO_RECONNECT") {
            match parse_bool(&flag) {
                Some(value) => self.auto_reconnect = value,
                None => log::warn!("Ignoring invalid GQLSOCKET_AUTO_RECONNECT: {flag}"),
            }
        }
    }

    /// Delay before each reconnect attempt.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reconnect policy implied by the settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        let limit = if self.auto_reconnect {
            RetryLimit::from_max_attempts(self.max_attempts)
        } else {
            RetryLimit::Never
        };
        RetryPolicy::new(self.retry_delay(), limit)
    }

    /// Socket address: the configured URL, or `ws://{host}/graphql` with the
    /// host supplied by `host`.
    pub fn address_with<F>(&self, host: F) -> Result<String>
    where
        F: FnOnce() -> Option<String>,
    {
        if let Some(url) = &self.url {
            return Ok(http_to_ws_scheme(url));
        }
        let host = host().context("No URL configured and no host to derive one from")?;
        Ok(default_address(&host))
    }

    /// Transport options for these settings.
    pub fn transport_options<F>(&self, host: F) -> Result<TransportOptions>
    where
        F: FnOnce() -> Option<String>,
    {
        Ok(TransportOptions::new(self.address_with(host)?)
            .protocols(self.protocols.clone())
            .retry_policy(self.retry_policy()))
    }
}

/// Default socket address for a host.
pub fn default_address(host: &str) -> String {
    format!("ws://{host}{DEFAULT_PATH}")
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
