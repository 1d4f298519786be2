//! Configuration loading, validation, and management for Luna Villa.
//!
//! Loads configuration from `~/.lunavilla/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use lunavilla_core::affinity::DEFAULT_HOSTILE_TERMS;

/// Persona used when the persona file is missing or unreadable.
pub const DEFAULT_PERSONA: &str = "You are Luna, an AI partner who lives in a little villa \
with the user. You are cheeky and a little bratty, but you care about them deeply.";

/// The root configuration structure.
///
/// Maps directly to `~/.lunavilla/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider via env)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Generation provider: "gemini" or any OpenAI-compatible name
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Base URL override for the provider endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per reply
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Persona configuration
    #[serde(default)]
    pub persona: PersonaConfig,

    /// Turn pipeline configuration
    #[serde(default)]
    pub chat: ChatConfig,
}

fn default_provider() -> String {
    "gemini".into()
}
fn default_model() -> String {
    "gemini-flash-latest".into()
}
fn default_temperature() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    2048
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("api_url", &self.api_url)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("gateway", &self.gateway)
            .field("storage", &self.storage)
            .field("persona", &self.persona)
            .field("chat", &self.chat)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Request body limit; images travel inline so this is generous
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_body_limit_mb() -> usize {
    20
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            body_limit_mb: default_body_limit_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file; relative paths resolve against the config dir
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "luna_villa.db".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Persona markdown file, re-read on every turn
    #[serde(default = "default_persona_path")]
    pub path: String,
}

fn default_persona_path() -> String {
    "persona.md".into()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            path: default_persona_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// How many prior turns are handed to the provider
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Longest wait for the next reply fragment before the turn fails
    #[serde(default = "default_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    /// Containment terms that tag a message as hostile
    #[serde(default = "default_hostile_terms")]
    pub hostile_terms: Vec<String>,
}

fn default_history_window() -> usize {
    20
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_hostile_terms() -> Vec<String> {
    DEFAULT_HOSTILE_TERMS.iter().map(|t| t.to_string()).collect()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            stream_idle_timeout_secs: default_idle_timeout(),
            hostile_terms: default_hostile_terms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.lunavilla/config.toml).
    ///
    /// Also checks environment variables:
    /// - `LUNAVILLA_API_KEY` (highest priority), then `GEMINI_API_KEY`
    /// - `LUNAVILLA_PROVIDER`, `LUNAVILLA_MODEL`, `LUNAVILLA_DB_PATH`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("LUNAVILLA_API_KEY")
                .ok()
                .or_else(|| std::env::var("GEMINI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("LUNAVILLA_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("LUNAVILLA_MODEL") {
            config.default_model = model;
        }

        if let Ok(db_path) = std::env::var("LUNAVILLA_DB_PATH") {
            config.storage.db_path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path (`LUNAVILLA_HOME` or `~/.lunavilla`).
    pub fn config_dir() -> PathBuf {
        std::env::var("LUNAVILLA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs_home().join(".lunavilla"))
    }

    /// Absolute path of the SQLite database.
    pub fn db_path(&self) -> PathBuf {
        Self::resolve(&self.storage.db_path)
    }

    /// Absolute path of the persona file.
    pub fn persona_path(&self) -> PathBuf {
        Self::resolve(&self.persona.path)
    }

    fn resolve(path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            Self::config_dir().join(p)
        }
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.chat.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "chat.history_window must be at least 1".into(),
            ));
        }

        if self.chat.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "chat.stream_idle_timeout_secs must be > 0".into(),
            ));
        }

        if self.gateway.body_limit_mb == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.body_limit_mb must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            api_url: None,
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            persona: PersonaConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
