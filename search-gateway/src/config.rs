//! Configuration for the search gateway.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub response: ResponseConfig,
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

/// Admission and scheduling limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of workers draining the JSON queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of queued JSON requests.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum simultaneous pipeline executions across both delivery modes.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How long a JSON request may wait for a queue slot.
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_secs: u64,
    /// How long a JSON request may wait for its answer once queued.
    #[serde(default = "default_result_timeout")]
    pub result_timeout_secs: u64,
    /// Idle poll interval of a worker waiting on an empty queue.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Pause between streamed frames so partial output gets flushed.
    #[serde(default = "default_frame_yield")]
    pub frame_yield_ms: u64,
}

impl SchedulerConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs(self.enqueue_timeout_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_yield(&self) -> Duration {
        Duration::from_millis(self.frame_yield_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_concurrent: default_max_concurrent(),
            enqueue_timeout_secs: default_enqueue_timeout(),
            result_timeout_secs: default_result_timeout(),
            poll_interval_ms: default_poll_interval(),
            frame_yield_ms: default_frame_yield(),
        }
    }
}

/// Answer pipeline endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_url")]
    pub base_url: String,
    #[serde(default = "default_standard_path")]
    pub standard_path: String,
    #[serde(default = "default_deep_path")]
    pub deep_path: String,
    /// Upper bound on a single pipeline run, including streaming.
    #[serde(default = "default_pipeline_timeout")]
    pub request_timeout_secs: u64,
    /// Model label reported in streamed chunks.
    #[serde(default = "default_model_label")]
    pub model_label: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: default_pipeline_url(),
            standard_path: default_standard_path(),
            deep_path: default_deep_path(),
            request_timeout_secs: default_pipeline_timeout(),
            model_label: default_model_label(),
        }
    }
}

/// Envelope used for chat-style JSON requests.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatEnvelope {
    /// `{"choices": [{"message": ...}]}`
    #[default]
    Choices,
    /// `[{"message": ...}]`
    Array,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseConfig {
    #[serde(default)]
    pub chat_envelope: ChatEnvelope,
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
    5000
}
fn default_workers() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    100
}
fn default_max_concurrent() -> usize {
    15
}
fn default_enqueue_timeout() -> u64 {
    5
}
fn default_result_timeout() -> u64 {
    180
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_frame_yield() -> u64 {
    10
}
fn default_pipeline_url() -> String {
    "http://localhost:5002".to_string()
}
fn default_standard_path() -> String {
    "/pipeline".to_string()
}
fn default_deep_path() -> String {
    "/pipeline/deep".to_string()
}
fn default_pipeline_timeout() -> u64 {
    300
}
fn default_model_label() -> String {
    "elixposearch".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors_origins() -> String {
    "*".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (SEARCH__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("SEARCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
