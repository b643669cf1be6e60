//! Configuration for the chat gateway.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Upper bound for a non-streaming generate call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_model(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    /// `sqlite:<path>` or a plain path. In-memory stores when absent.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Period of the expired-session reaper. 0 disables it.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            database_url: None,
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// What to do with a call that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicyKind {
    /// Wait up to `queue_timeout_ms` for a slot, then fail.
    Queue,
    /// Fail immediately.
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_admission_policy")]
    pub policy: AdmissionPolicyKind,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            policy: default_admission_policy(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

/// Retry of `BackendUnavailable` failures. `max_attempts = 1` means no retry.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// A stream with no chunk for this long is failed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

/// Per-session request rate limit. Disabled when `requests_per_minute` is unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Most recent stored messages sent as context with a `chat_id` call.
    /// 0 sends none, though the exchange is still saved.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_context_messages: default_max_context_messages(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
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

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Comma-separated origins, or `*`.
    #[serde(default = "default_cors_origins")]
    pub origins: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_cors_origins(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3.2".to_string()
}
fn default_request_timeout() -> u64 {
    120
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_ttl_hours() -> i64 {
    24
}
fn default_reaper_interval() -> u64 {
    300
}
fn default_max_in_flight() -> usize {
    16
}
fn default_admission_policy() -> AdmissionPolicyKind {
    AdmissionPolicyKind::Queue
}
fn default_queue_timeout() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    1
}
fn default_base_delay() -> u64 {
    200
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    2000
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_keep_alive() -> u64 {
    15
}
fn default_max_context_messages() -> usize {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors_origins() -> String {
    "*".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ollama: OllamaConfig::default(),
            sessions: SessionsConfig::default(),
            admission: AdmissionConfig::default(),
            retry: RetryConfig::default(),
            streaming: StreamingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            history: HistoryConfig::default(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Same as [`Config::load`] with an explicit config file stem.
    pub fn load_from(file_stem: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_in_flight == 0 {
            return Err(ConfigError::Message(
                "admission.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.streaming.idle_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "streaming.idle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sessions.ttl_hours <= 0 {
            return Err(ConfigError::Message(
                "sessions.ttl_hours must be positive".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Message(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.rate_limit.requests_per_minute == Some(0) || self.rate_limit.burst == Some(0) {
            return Err(ConfigError::Message(
                "rate_limit values must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.ollama.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ollama.connect_timeout_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sessions.ttl_hours)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming.idle_timeout_secs)
    }
}
