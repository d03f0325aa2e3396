pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

use self::validation::validate_config;
use crate::stream::{DecoderLimits, DEFAULT_MAX_CARRY_BYTES, DEFAULT_MAX_PARSE_RETRIES};

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub http_use_env_proxy: bool,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_max_blocking_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    base_path: String,
    #[serde(default)]
    http_use_env_proxy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

fn runtime_threads_or_default(
    setting: Option<&RuntimeThreadsSetting>,
    default: Option<usize>,
) -> Option<usize> {
    match setting {
        None => default,
        Some(RuntimeThreadsSetting::Fixed(threads)) => Some(*threads),
        Some(RuntimeThreadsSetting::Auto(())) => None,
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            timeout: wire.timeout,
            http_pool_max_idle_per_host: wire.http_pool_max_idle_per_host,
            http_pool_idle_timeout_secs: wire.http_pool_idle_timeout_secs,
            // missing => default, explicit null => runtime decides
            runtime_worker_threads: runtime_threads_or_default(
                wire.runtime_worker_threads.as_ref(),
                None,
            ),
            runtime_max_blocking_threads: runtime_threads_or_default(
                wire.runtime_max_blocking_threads.as_ref(),
                Some(8),
            ),
            base_path: wire.base_path,
            http_use_env_proxy: wire.http_use_env_proxy,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            base_path: String::new(),
            http_use_env_proxy: false,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Z.ai, a smart and friendly AI assistant created by Zhipu AI.
You can help users with all kinds of tasks, including:
- answering questions and providing information
- writing, programming, and creative work
- analysing and explaining complex topics
- giving advice and recommendations

Always keep a professional yet friendly tone and give accurate, useful answers.";

/// Upstream chat completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_base_url")]
    pub base_url: String,
    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_chat_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_chat_base_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4".to_string()
}
fn default_chat_api_key_env() -> String {
    "ZHIPU_API_KEY".to_string()
}
fn default_chat_model() -> String {
    "glm-4.7".to_string()
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.95
}

impl ChatConfig {
    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_base_url(),
            api_key: None,
            api_key_env: default_chat_api_key_env(),
            model: default_chat_model(),
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

/// Web search used to enrich the last message when a request asks for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_search_url")]
    pub url: String,
    #[serde(default = "default_search_engine")]
    pub engine: String,
    #[serde(default = "default_search_count")]
    pub count: u32,
    #[serde(default = "default_content_size")]
    pub content_size: String,
}

fn default_true() -> bool {
    true
}
fn default_web_search_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4/web_search".to_string()
}
fn default_search_engine() -> String {
    "search_std".to_string()
}
fn default_search_count() -> u32 {
    5
}
fn default_content_size() -> String {
    "medium".to_string()
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_web_search_url(),
            engine: default_search_engine(),
            count: default_search_count(),
            content_size: default_content_size(),
        }
    }
}

/// Upstream image generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_side")]
    pub default_width: u32,
    #[serde(default = "default_image_side")]
    pub default_height: u32,
}

fn default_image_url() -> String {
    "https://ark.cn-beijing.volces.com/api/v3/images/generations".to_string()
}
fn default_image_api_key_env() -> String {
    "VOLCENGINE_API_KEY".to_string()
}
fn default_image_model() -> String {
    "doubao-seedream-4-5-251128".to_string()
}
fn default_image_side() -> u32 {
    1024
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url: default_image_url(),
            api_key: None,
            api_key_env: default_image_api_key_env(),
            model: default_image_model(),
            default_width: default_image_side(),
            default_height: default_image_side(),
        }
    }
}

/// Client authentication configuration. An empty list disables the check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    #[serde(default)]
    pub allowed_keys: Vec<String>,
}

/// Bounds applied by the client-side stream decoder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamLimitsConfig {
    #[serde(default = "default_max_carry_bytes")]
    pub max_carry_bytes: usize,
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
}

fn default_max_carry_bytes() -> usize {
    DEFAULT_MAX_CARRY_BYTES
}
fn default_max_parse_retries() -> u32 {
    DEFAULT_MAX_PARSE_RETRIES
}

impl Default for StreamLimitsConfig {
    fn default() -> Self {
        Self {
            max_carry_bytes: default_max_carry_bytes(),
            max_parse_retries: default_max_parse_retries(),
        }
    }
}

impl From<StreamLimitsConfig> for DecoderLimits {
    fn from(cfg: StreamLimitsConfig) -> Self {
        DecoderLimits {
            max_carry_bytes: cfg.max_carry_bytes,
            max_parse_retries: cfg.max_parse_retries,
        }
    }
}

/// Settings of the chat client that talks to this proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub publishable_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub stream: StreamLimitsConfig,
}

fn default_client_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_client_base_url(),
            publishable_key: None,
            model: None,
            timeout: default_timeout(),
            stream: StreamLimitsConfig::default(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Same as [`load_config`], minus the I/O case.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = if contents.trim().is_empty() {
        AppConfig::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Resolve an upstream credential: the inline key when set, otherwise the
/// named environment variable. Blank values count as missing.
#[must_use]
pub fn resolve_api_key(inline: Option<&str>, env_name: &str) -> Option<String> {
    resolve_api_key_with(inline, env_name, |name| std::env::var(name).ok())
}

pub(crate) fn resolve_api_key_with(
    inline: Option<&str>,
    env_name: &str,
    lookup: impl FnOnce(&str) -> Option<String>,
) -> Option<String> {
    if let Some(key) = inline.map(str::trim).filter(|key| !key.is_empty()) {
        return Some(key.to_string());
    }
    lookup(env_name)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}
