//! TOML Configuration File Support
//!
//! Builds the immutable [`RelayConfig`] handed to every relay session at
//! start-up. The default file location is
//! `$XDG_CONFIG_HOME/inference-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [relay]
//! allowed_models = ["meta-llama/Llama-3.2-1B-Instruct"]
//! pacing_delay_ms = 100
//! default_max_tokens = 500
//! max_message_size = 65536
//! # upstream_read_timeout_ms = 30000
//!
//! [chunking]
//! char_batch_size = 5
//! word_batch_size = 5
//!
//! [server]
//! http_addr = "127.0.0.1:9999"
//! ws_addr = "127.0.0.1:9998"
//! max_connections = 10000
//!
//! [upstream]
//! base_url = "https://router.huggingface.co/v1"
//! request_timeout_secs = 120
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::AllowList;
use crate::streaming::Pacer;

/// Models the relay accepts out of the box
pub const DEFAULT_ALLOWED_MODELS: &[&str] = &[
    "Qwen/Qwen2.5-72B-Instruct",
    "Qwen/Qwen2.5-1.5B-Instruct",
    "meta-llama/Llama-3.2-3B-Instruct",
    "meta-llama/Llama-3.2-1B-Instruct",
    "meta-llama/Meta-Llama-3-8B-Instruct",
    "meta-llama/Llama-3.1-8B-Instruct",
    "microsoft/Phi-3.5-mini-instruct",
    "microsoft/Phi-3-mini-4k-instruct",
];

/// Default Hugging Face OpenAI-compatible endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "https://router.huggingface.co/v1";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[relay]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Model identifiers clients may request
    pub allowed_models: Option<Vec<String>>,

    /// Delay before each outbound unit in milliseconds
    pub pacing_delay_ms: Option<u64>,

    /// Token limit used when a request sets none
    pub default_max_tokens: Option<u32>,

    /// Maximum inbound frame size in bytes
    pub max_message_size: Option<usize>,

    /// Upstream read timeout in milliseconds (unset = wait forever)
    pub upstream_read_timeout_ms: Option<u64>,
}

/// `[chunking]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingToml {
    /// Characters per unit in `digit` mode
    pub char_batch_size: Option<usize>,

    /// Words per unit in `word` mode
    pub word_batch_size: Option<usize>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// HTTP listen address
    pub http_addr: Option<String>,

    /// WebSocket listen address
    pub ws_addr: Option<String>,

    /// Maximum simultaneous WebSocket connections
    pub max_connections: Option<usize>,
}

/// `[upstream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Base URL of the OpenAI-compatible API
    pub base_url: Option<String>,

    /// API token
    pub api_key: Option<String>,

    /// Timeout for non-streaming calls in seconds
    pub request_timeout_secs: Option<u64>,

    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfigToml {
    /// Relay behaviour
    pub relay: RelayToml,

    /// Chunk batch sizes
    pub chunking: ChunkingToml,

    /// Listeners
    pub server: ServerToml,

    /// Upstream provider
    pub upstream: UpstreamToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// HTTP listen address (health + synchronous inference)
    pub http_addr: String,
    /// WebSocket listen address (streaming relay)
    pub ws_addr: String,
    /// Maximum simultaneous WebSocket connections
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9999".to_string(),
            ws_addr: "127.0.0.1:9998".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Upstream provider settings
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible API
    pub base_url: String,
    /// Bearer token
    pub api_key: Option<String>,
    /// Timeout for non-streaming calls
    pub request_timeout: Duration,
    /// Connect timeout for every call
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_URL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// Keeps the token out of logs
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Process-wide relay configuration
///
/// Constructed once at start-up, validated, then shared read-only (see
/// [`RelayConfig::into_shared`]).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Models clients may request
    pub allowed_models: AllowList,

    /// Delay before each outbound unit (zero disables pacing)
    pub pacing_delay: Duration,

    /// Token limit used when a request sets none
    pub default_max_tokens: u32,

    /// Characters per unit in `digit` mode
    pub char_batch_size: usize,

    /// Words per unit in `word` mode
    pub word_batch_size: usize,

    /// Upstream read timeout (`None` = wait forever)
    pub upstream_read_timeout: Option<Duration>,

    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,

    /// Listener settings
    pub server: ServerSettings,

    /// Upstream provider settings
    pub upstream: UpstreamConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allowed_models: AllowList::new(DEFAULT_ALLOWED_MODELS.iter().copied()),
            pacing_delay: Duration::from_millis(100),
            default_max_tokens: 500,
            char_batch_size: 5,
            word_batch_size: 5,
            upstream_read_timeout: None,
            max_message_size: 64 * 1024,
            server: ServerSettings::default(),
            upstream: UpstreamConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the allow-list
    #[must_use]
    pub fn with_allowed_models(mut self, allowed_models: AllowList) -> Self {
        self.allowed_models = allowed_models;
        self
    }

    /// Set the pacing delay
    #[must_use]
    pub fn with_pacing_delay(mut self, delay: Duration) -> Self {
        self.pacing_delay = delay;
        self
    }

    /// Set both chunk batch sizes
    #[must_use]
    pub fn with_batch_sizes(mut self, char_batch_size: usize, word_batch_size: usize) -> Self {
        self.char_batch_size = char_batch_size;
        self.word_batch_size = word_batch_size;
        self
    }

    /// Set the upstream read timeout
    #[must_use]
    pub fn with_upstream_read_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_read_timeout = Some(timeout);
        self
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// The pacer every session of this process uses
    #[must_use]
    pub fn pacer(&self) -> Pacer {
        Pacer::new(self.pacing_delay)
    }

    /// Check invariants the relay relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_models.is_empty() {
            return Err(ConfigError::ValidationError(
                "allowed_models must not be empty".to_string(),
            ));
        }
        if self.char_batch_size == 0 || self.word_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunk batch sizes must be at least 1".to_string(),
            ));
        }
        if self.default_max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "default_max_tokens must be at least 1".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be at least 1".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Freeze the configuration for sharing across sessions
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/inference-relay/relay.toml` or
/// `~/.config/inference-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("inference-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = load_file_config(path)?;
    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Defaults plus the TOML file, without environment overrides
fn load_file_config(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayConfigToml) {
    // Relay settings
    if let Some(ref models) = toml.relay.allowed_models {
        config.allowed_models = AllowList::new(models.iter().cloned());
    }
    if let Some(ms) = toml.relay.pacing_delay_ms {
        config.pacing_delay = Duration::from_millis(ms);
    }
    if let Some(tokens) = toml.relay.default_max_tokens {
        config.default_max_tokens = tokens;
    }
    if let Some(size) = toml.relay.max_message_size {
        config.max_message_size = size;
    }
    if let Some(ms) = toml.relay.upstream_read_timeout_ms {
        config.upstream_read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }

    // Chunking settings
    if let Some(size) = toml.chunking.char_batch_size {
        config.char_batch_size = size;
    }
    if let Some(size) = toml.chunking.word_batch_size {
        config.word_batch_size = size;
    }

    // Server settings
    if let Some(ref addr) = toml.server.http_addr {
        config.server.http_addr = addr.clone();
    }
    if let Some(ref addr) = toml.server.ws_addr {
        config.server.ws_addr = addr.clone();
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }

    // Upstream settings
    if let Some(ref url) = toml.upstream.base_url {
        config.upstream.base_url = url.clone();
    }
    if toml.upstream.api_key.is_some() {
        config.upstream.api_key = toml.upstream.api_key.clone();
    }
    if let Some(secs) = toml.upstream.request_timeout_secs {
        config.upstream.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.upstream.connect_timeout_secs {
        config.upstream.connect_timeout = Duration::from_secs(secs);
    }
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; production passes `std::env::var`.
fn apply_env_config(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable environment value");
                None
            }
        }
    }

    if let Some(models) = lookup("RELAY_ALLOWED_MODELS") {
        config.allowed_models = AllowList::new(
            models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty()),
        );
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "RELAY_PACING_MS") {
        config.pacing_delay = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(tokens) = parsed::<u32>(&lookup, "RELAY_DEFAULT_MAX_TOKENS") {
        config.default_max_tokens = tokens;
        config.source = ConfigSource::Env;
    }
    if let Some(size) = parsed::<usize>(&lookup, "RELAY_CHAR_BATCH") {
        config.char_batch_size = size;
        config.source = ConfigSource::Env;
    }
    if let Some(size) = parsed::<usize>(&lookup, "RELAY_WORD_BATCH") {
        config.word_batch_size = size;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed::<u64>(&lookup, "RELAY_READ_TIMEOUT_MS") {
        config.upstream_read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        config.source = ConfigSource::Env;
    }
    if let Some(size) = parsed::<usize>(&lookup, "RELAY_MAX_MESSAGE_SIZE") {
        config.max_message_size = size;
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = lookup("RELAY_HTTP_ADDR") {
        config.server.http_addr = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = lookup("RELAY_WS_ADDR") {
        config.server.ws_addr = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(max) = parsed::<usize>(&lookup, "RELAY_MAX_CONNECTIONS") {
        config.server.max_connections = max;
        config.source = ConfigSource::Env;
    }
    if let Some(url) = lookup("RELAY_UPSTREAM_URL") {
        config.upstream.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(token) = lookup("RELAY_HF_TOKEN").or_else(|| lookup("HF_TOKEN")) {
        config.upstream.api_key = Some(token);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides,
/// then call [`RelayConfig::validate`] again.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// HTTP listen address override
    pub http_addr: Option<String>,

    /// WebSocket listen address override
    pub ws_addr: Option<String>,

    /// Pacing delay override (milliseconds)
    pub pacing_delay_ms: Option<u64>,

    /// Default max tokens override
    pub default_max_tokens: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set HTTP address override
    #[must_use]
    pub fn with_http_addr(mut self, addr: String) -> Self {
        self.http_addr = Some(addr);
        self
    }

    /// Set WebSocket address override
    #[must_use]
    pub fn with_ws_addr(mut self, addr: String) -> Self {
        self.ws_addr = Some(addr);
        self
    }

    /// Set pacing delay override
    #[must_use]
    pub fn with_pacing_delay_ms(mut self, ms: u64) -> Self {
        self.pacing_delay_ms = Some(ms);
        self
    }

    /// Set default max tokens override
    #[must_use]
    pub fn with_default_max_tokens(mut self, tokens: u32) -> Self {
        self.default_max_tokens = Some(tokens);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.http_addr.is_some()
            || self.ws_addr.is_some()
            || self.pacing_delay_ms.is_some()
            || self.default_max_tokens.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref addr) = self.http_addr {
            config.server.http_addr = addr.clone();
        }
        if let Some(ref addr) = self.ws_addr {
            config.server.ws_addr = addr.clone();
        }
        if let Some(ms) = self.pacing_delay_ms {
            config.pacing_delay = Duration::from_millis(ms);
        }
        if let Some(tokens) = self.default_max_tokens {
            config.default_max_tokens = tokens;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.allowed_models.len(), DEFAULT_ALLOWED_MODELS.len());
        assert!(config
            .allowed_models
            .contains("meta-llama/Llama-3.2-1B-Instruct"));
        assert_eq!(config.pacing_delay, Duration::from_millis(100));
        assert_eq!(config.default_max_tokens, 500);
        assert_eq!(config.char_batch_size, 5);
        assert_eq!(config.word_batch_size, 5);
        assert!(config.upstream_read_timeout.is_none());
        assert_eq!(config.server.http_addr, "127.0.0.1:9999");
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("inference-relay"));
            assert!(p.to_string_lossy().ends_with("relay.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let toml_content = r#"
[relay]
allowed_models = ["modelA", "modelB"]
pacing_delay_ms = 0
default_max_tokens = 128
upstream_read_timeout_ms = 2500

[chunking]
char_batch_size = 10
word_batch_size = 3

[server]
ws_addr = "0.0.0.0:7000"
max_connections = 4

[upstream]
base_url = "http://localhost:8080/v1"
request_timeout_secs = 30
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = load_file_config(Some(file.path().to_path_buf())).unwrap();

        assert!(config.allowed_models.contains("modelB"));
        assert!(!config.allowed_models.contains("Qwen/Qwen2.5-72B-Instruct"));
        assert_eq!(config.pacing_delay, Duration::ZERO);
        assert_eq!(config.default_max_tokens, 128);
        assert_eq!(
            config.upstream_read_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.char_batch_size, 10);
        assert_eq!(config.word_batch_size, 3);
        assert_eq!(config.server.ws_addr, "0.0.0.0:7000");
        assert_eq!(config.server.http_addr, "127.0.0.1:9999");
        assert_eq!(config.server.max_connections, 4);
        assert_eq!(config.upstream.base_url, "http://localhost:8080/v1");
        assert_eq!(config.upstream.request_timeout, Duration::from_secs(30));
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_file_config(Some(PathBuf::from("/nonexistent/inference-relay.toml"))).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[relay\npacing_delay_ms = ").unwrap();

        let result = load_file_config(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = RelayConfig::default();
        apply_env_config(
            &mut config,
            env(&[
                ("RELAY_ALLOWED_MODELS", "modelA, modelB ,"),
                ("RELAY_PACING_MS", "20"),
                ("RELAY_WORD_BATCH", "8"),
                ("RELAY_READ_TIMEOUT_MS", "0"),
                ("HF_TOKEN", "hf_test"),
            ]),
        );

        assert_eq!(config.allowed_models.len(), 2);
        assert!(config.allowed_models.contains("modelB"));
        assert_eq!(config.pacing_delay, Duration::from_millis(20));
        assert_eq!(config.word_batch_size, 8);
        assert!(config.upstream_read_timeout.is_none());
        assert_eq!(config.upstream.api_key.as_deref(), Some("hf_test"));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_env_ignores_unparsable_values() {
        let mut config = RelayConfig::default();
        apply_env_config(&mut config, env(&[("RELAY_PACING_MS", "fast")]));
        assert_eq!(config.pacing_delay, Duration::from_millis(100));
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_relay_token_wins_over_hf_token() {
        let mut config = RelayConfig::default();
        apply_env_config(
            &mut config,
            env(&[("HF_TOKEN", "generic"), ("RELAY_HF_TOKEN", "specific")]),
        );
        assert_eq!(config.upstream.api_key.as_deref(), Some("specific"));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new()
            .with_ws_addr("0.0.0.0:1234".to_string())
            .with_pacing_delay_ms(0)
            .with_default_max_tokens(50)
            .apply(&mut config);

        assert_eq!(config.server.ws_addr, "0.0.0.0:1234");
        assert_eq!(config.pacing_delay, Duration::ZERO);
        assert_eq!(config.default_max_tokens, 50);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let empty = RelayConfig::default().with_allowed_models(AllowList::default());
        assert!(matches!(
            empty.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let zero_batch = RelayConfig::default().with_batch_sizes(0, 5);
        assert!(zero_batch.validate().is_err());

        let mut zero_tokens = RelayConfig::default();
        zero_tokens.default_max_tokens = 0;
        assert!(zero_tokens.validate().is_err());

        // Zero pacing is a valid configuration
        let unpaced = RelayConfig::default().with_pacing_delay(Duration::ZERO);
        assert!(unpaced.validate().is_ok());
        assert!(unpaced.pacer().delay().is_zero());
    }

    #[test]
    fn test_upstream_debug_redacts_token() {
        let upstream = UpstreamConfig {
            api_key: Some("hf_secret".to_string()),
            ..Default::default()
        };
        let rendered = format!("{upstream:?}");
        assert!(!rendered.contains("hf_secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::File.to_string(), "config file");
    }
}
