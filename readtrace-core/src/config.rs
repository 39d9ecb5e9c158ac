//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/readtrace/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/readtrace/` (~/.config/readtrace/)
//! - State/Logs: `$XDG_STATE_HOME/readtrace/` (~/.local/state/readtrace/)
//!
//! The store credentials can also come from `READTRACE_STORE_URL` and
//! `READTRACE_ANON_KEY`, which take precedence over the file.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `store.url`
pub const STORE_URL_ENV: &str = "READTRACE_STORE_URL";
/// Environment variable overriding `store.anon_key`
pub const ANON_KEY_ENV: &str = "READTRACE_ANON_KEY";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Remote analytics store
    #[serde(default)]
    pub store: StoreConfig,

    /// Engagement thresholds and timers
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Page controls the event tracker recognizes
    #[serde(default)]
    pub selectors: SelectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Analytics store connection
///
/// Both `url` and `anon_key` must be present for tracking to run; otherwise
/// the tracker is built inert.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Base URL of the REST store (e.g., `https://project.example.co`)
    pub url: Option<String>,

    /// Anonymous API key sent as `apikey` and bearer token
    pub anon_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            timeout_secs: default_store_timeout(),
        }
    }
}

impl StoreConfig {
    /// Check if both credentials are present and non-empty
    pub fn is_ready(&self) -> bool {
        non_empty(&self.url) && non_empty(&self.anon_key)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !non_empty(&self.url) {
            return Err(Error::Config("store.url is required".to_string()));
        }
        if !non_empty(&self.anon_key) {
            return Err(Error::Config("store.anon_key is required".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "store.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `READTRACE_STORE_URL` / `READTRACE_ANON_KEY` when set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(STORE_URL_ENV) {
            if !url.is_empty() {
                self.url = Some(url);
            }
        }
        if let Ok(key) = std::env::var(ANON_KEY_ENV) {
            if !key.is_empty() {
                self.anon_key = Some(key);
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn default_store_timeout() -> u64 {
    10
}

/// Engagement thresholds and timers
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    /// Seconds between engagement revisions
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Minutes of inactivity after which a new session starts
    #[serde(default = "default_session_timeout")]
    pub session_timeout_mins: u64,

    /// Scroll depth (percent) at which a page counts as read
    #[serde(default = "default_read_complete_depth")]
    pub read_complete_depth: u8,

    /// A visit below this depth and below `bounce_secs` counts as a bounce
    #[serde(default = "default_bounce_depth")]
    pub bounce_depth: u8,

    #[serde(default = "default_bounce_secs")]
    pub bounce_secs: u64,

    /// Mix the canvas signature into the visitor fingerprint
    #[serde(default = "default_canvas_fingerprint")]
    pub canvas_fingerprint: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            session_timeout_mins: default_session_timeout(),
            read_complete_depth: default_read_complete_depth(),
            bounce_depth: default_bounce_depth(),
            bounce_secs: default_bounce_secs(),
            canvas_fingerprint: default_canvas_fingerprint(),
        }
    }
}

impl TrackingConfig {
    /// Revision period, never shorter than one second
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }

    /// Reject timers of zero length and depths outside 0..=100
    pub fn validate(&self) -> Result<()> {
        if self.update_interval_secs == 0 {
            return Err(Error::Config(
                "tracking.update_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.session_timeout_mins == 0 {
            return Err(Error::Config(
                "tracking.session_timeout_mins must be at least 1".to_string(),
            ));
        }
        for (name, depth) in [
            ("read_complete_depth", self.read_complete_depth),
            ("bounce_depth", self.bounce_depth),
        ] {
            if depth > 100 {
                return Err(Error::Config(format!(
                    "tracking.{} must be 0..=100, got {}",
                    name, depth
                )));
            }
        }
        Ok(())
    }

    /// Session inactivity window in milliseconds
    pub fn session_timeout_ms(&self) -> i64 {
        (self.session_timeout_mins as i64) * 60 * 1000
    }
}

fn default_update_interval() -> u64 {
    10
}

fn default_session_timeout() -> u64 {
    30
}

fn default_read_complete_depth() -> u8 {
    90
}

fn default_bounce_depth() -> u8 {
    25
}

fn default_bounce_secs() -> u64 {
    10
}

fn default_canvas_fingerprint() -> bool {
    true
}

/// Page controls recognized by the event tracker
#[derive(Debug, Deserialize, Clone)]
pub struct SelectorConfig {
    /// Element id of the share control
    #[serde(default = "default_share_button_id")]
    pub share_button_id: String,

    /// Class marking inline subscription forms
    #[serde(default = "default_subscribe_form_class")]
    pub subscribe_form_class: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            share_button_id: default_share_button_id(),
            subscribe_form_class: default_subscribe_form_class(),
        }
    }
}

fn default_share_button_id() -> String {
    "share-btn".to_string()
}

fn default_subscribe_form_class() -> String {
    "subscribe-inline".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path, then apply env overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.store.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.tracking.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/readtrace/config.toml` (~/.config/readtrace/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("readtrace").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/readtrace/` (~/.local/state/readtrace/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("readtrace")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/readtrace/readtrace.log` (~/.local/state/readtrace/readtrace.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("readtrace.log")
    }
}
