//! Configuration loading, validation, and management for stockchat.
//!
//! Loads configuration from `~/.stockchat/config.toml` (or an explicit
//! path) with environment variable overrides. Validates all settings at
//! startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.stockchat/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Display name reported by the health endpoint
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// development | production | testing
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_app_name() -> String {
    "Stock Analysis Chat".into()
}
fn default_environment() -> String {
    "development".into()
}

const ENVIRONMENTS: &[&str] = &["development", "production", "testing"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["json", "text"];

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

/// Model provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the Responses-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Ask the model to skip its reasoning phase
    #[serde(default = "default_true")]
    pub disable_thinking: bool,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://ark.cn-beijing.volces.com/api/v3".into()
}
fn default_model() -> String {
    "doubao-seed-1-6-251015".into()
}
fn default_true() -> bool {
    true
}
fn default_provider_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: None,
            max_output_tokens: None,
            disable_thinking: true,
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("disable_thinking", &self.disable_thinking)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Agent loop and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tool-call round-trips allowed per user turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Live sessions kept in memory before evicting the least recently used
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Send only new tool outputs plus `previous_response_id` on follow-ups
    #[serde(default = "default_true")]
    pub use_continuation: bool,

    /// Sessions idle longer than this are dropped (0 = never)
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Replaces the built-in stock analyst prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_tool_rounds() -> u32 {
    10
}
fn default_max_sessions() -> usize {
    1000
}
fn default_session_idle_secs() -> u64 {
    3600
}
fn default_tool_timeout() -> u64 {
    60
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_sessions: default_max_sessions(),
            use_continuation: true,
            session_idle_secs: default_session_idle_secs(),
            tool_timeout_secs: default_tool_timeout(),
            system_prompt: None,
        }
    }
}

/// External data sources used by the tools.
#[derive(Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Xueqiu `xq_a_token` cookie value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xueqiu_token: Option<String>,

    #[serde(default = "default_xueqiu_base_url")]
    pub xueqiu_base_url: String,

    #[serde(default = "default_arxiv_base_url")]
    pub arxiv_base_url: String,

    /// Upper bound on papers per search
    #[serde(default = "default_max_papers")]
    pub max_papers: u32,

    #[serde(default = "default_tool_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_xueqiu_base_url() -> String {
    "https://stock.xueqiu.com".into()
}
fn default_arxiv_base_url() -> String {
    "http://export.arxiv.org/api/query".into()
}
fn default_max_papers() -> u32 {
    20
}
fn default_tool_request_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            xueqiu_token: None,
            xueqiu_base_url: default_xueqiu_base_url(),
            arxiv_base_url: default_arxiv_base_url(),
            max_papers: default_max_papers(),
            request_timeout_secs: default_tool_request_timeout(),
        }
    }
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("xueqiu_token", &redact(&self.xueqiu_token))
            .field("xueqiu_base_url", &self.xueqiu_base_url)
            .field("arxiv_base_url", &self.arxiv_base_url)
            .field("max_papers", &self.max_papers)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Conversation persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://path.db`, `sqlite::memory:`, `postgres://...` or `memory`
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://stockchat.db".into()
}
fn default_max_connections() -> u32 {
    20
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Requests per minute per client IP (0 = unlimited)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}
fn default_rate_limit() -> u32 {
    60
}
fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            rate_limit_per_minute: default_rate_limit(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json | text
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "json".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from `~/.stockchat/config.toml`
    /// when no path is given, then apply environment overrides:
    /// - `STOCKCHAT_API_KEY`, then `DOUBAO_API_KEY`
    /// - `STOCKCHAT_BASE_URL`, `STOCKCHAT_MODEL`
    /// - `XQ_A_TOKEN`, `DATABASE_URL`, `STOCKCHAT_PORT`, `STOCKCHAT_ENV`
    /// - `LOG_LEVEL`, `LOG_FORMAT`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = Self::config_dir().join("config.toml");
        let mut config = Self::read_file(path.unwrap_or(&default_path))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(key) = env("STOCKCHAT_API_KEY").or_else(|| env("DOUBAO_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = env("STOCKCHAT_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = env("STOCKCHAT_MODEL") {
            self.provider.model = model;
        }
        if let Some(token) = env("XQ_A_TOKEN") {
            self.tools.xueqiu_token = Some(token);
        }
        if let Some(url) = env("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(port) = env("STOCKCHAT_PORT").and_then(|p| p.parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(environment) = env("STOCKCHAT_ENV") {
            self.environment = environment;
        }
        if let Some(level) = env("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(format) = env("LOG_FORMAT") {
            self.logging.format = format.to_lowercase();
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stockchat")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !ENVIRONMENTS.contains(&self.environment.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "environment must be one of {ENVIRONMENTS:?}, got '{}'",
                self.environment
            )));
        }

        if let Some(t) = self.provider.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::ValidationError(
                    "provider.temperature must be between 0.0 and 2.0".into(),
                ));
            }
        }

        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_tool_rounds must be > 0".into(),
            ));
        }

        if self.agent.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_sessions must be > 0".into(),
            ));
        }

        if self.tools.max_papers == 0 {
            return Err(ConfigError::ValidationError(
                "tools.max_papers must be > 0".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {LOG_LEVELS:?}"
            )));
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be one of {LOG_FORMATS:?}"
            )));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Check if a model API key is available.
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// A copy safe to print: secrets replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.provider.api_key.is_some() {
            copy.provider.api_key = Some("[REDACTED]".into());
        }
        if copy.tools.xueqiu_token.is_some() {
            copy.tools.xueqiu_token = Some("[REDACTED]".into());
        }
        copy
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            provider: ProviderConfig::default(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
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
