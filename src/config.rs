//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::websocket::{HubConfig, Tokenizer, TokenizerKind};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Subscription token configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokenizer: TokenizerKind,

    /// Secret keying the tokenizer; subscriptions are disabled without one
    pub secret: Option<String>,
}

impl AuthConfig {
    /// Build the configured tokenizer, if a secret is set
    pub fn tokenizer(&self) -> Option<Arc<dyn Tokenizer>> {
        self.secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .map(|secret| self.tokenizer.build(secret))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Minimum severity: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("wshub").join("config.toml")),
            Some(PathBuf::from("/etc/wshub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check values that would make the hub misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hub
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("hub: {}", e)))
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(host) = std::env::var("WSHUB_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("WSHUB_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        // Hub overrides
        if let Ok(origins) = std::env::var("WSHUB_ALLOWED_ORIGINS") {
            self.hub.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        // Auth overrides
        if let Ok(secret) = std::env::var("WSHUB_TOKEN_SECRET") {
            self.auth.secret = Some(secret);
        }
        if let Ok(kind) = std::env::var("WSHUB_TOKENIZER") {
            match kind.parse() {
                Ok(kind) => self.auth.tokenizer = kind,
                Err(e) => tracing::warn!("Ignoring WSHUB_TOKENIZER: {}", e),
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("WSHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("WSHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# wshub Configuration
#
# Environment variables override these settings:
# - WSHUB_HOST
# - WSHUB_PORT
# - WSHUB_ALLOWED_ORIGINS (comma-separated)
# - WSHUB_TOKEN_SECRET
# - WSHUB_TOKENIZER
# - WSHUB_LOG_LEVEL
# - WSHUB_LOG_FORMAT

[server]
# HTTP server host
host = "0.0.0.0"

# HTTP server port
port = 8000

[hub]
# Largest frame accepted from a client (bytes)
max_message_size = 65536

# Drop connections that send nothing (not even a pong) for this long (ms)
read_timeout_ms = 60000

# Time allowed to write one frame (ms)
write_timeout_ms = 10000

# Keepalive ping period, must be less than read_timeout_ms (ms)
ping_interval_ms = 54000

# Outbound messages buffered per connection
send_buffer = 256

# Events buffered per hub queue
event_buffer = 256

# Hosts allowed to open a socket from a browser ("*" allows any)
allowed_origins = ["*"]

# What to do when a client's buffer is full: "block" or "drop"
slow_consumer = "block"

# Reply to every subscription attempt with an acknowledgement frame
acknowledge_subscriptions = false

[auth]
# Token signature: "hmac_sha256" or "hmac_sha512"
tokenizer = "hmac_sha256"

# Secret used to sign subscription tokens (subscriptions disabled when unset)
# secret = "change-me"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::SlowConsumerPolicy;
    use std::io::Write;

    #[test]
    fn test_default_template_parses_to_defaults() {
        let config = Config::parse(&generate_default_config()).unwrap();
        let defaults = HubConfig::default();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.hub.max_message_size, defaults.max_message_size);
        assert_eq!(config.hub.read_timeout_ms, defaults.read_timeout_ms);
        assert_eq!(config.hub.ping_interval_ms, defaults.ping_interval_ms);
        assert_eq!(config.hub.allowed_origins, defaults.allowed_origins);
        assert_eq!(config.auth.tokenizer, TokenizerKind::HmacSha256);
        assert!(config.auth.secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config = Config::parse(
            r#"
            [hub]
            send_buffer = 8
            slow_consumer = "drop"

            [auth]
            tokenizer = "hmac_sha512"
            secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.hub.send_buffer, 8);
        assert_eq!(config.hub.slow_consumer, SlowConsumerPolicy::Drop);
        assert_eq!(config.hub.write_timeout_ms, 10_000);
        assert_eq!(config.server.host, "0.0.0.0");

        let tokenizer = config.auth.tokenizer().unwrap();
        assert_eq!(tokenizer.tokenize("alice").len(), 128);
    }

    #[test]
    fn test_empty_secret_disables_tokenizer() {
        let auth = AuthConfig {
            tokenizer: TokenizerKind::HmacSha256,
            secret: Some(String::new()),
        };
        assert!(auth.tokenizer().is_none());
        assert!(AuthConfig::default().tokenizer().is_none());
    }

    #[test]
    fn test_validate_rejects_ping_not_below_read_timeout() {
        let mut config = Config::default();
        config.hub.ping_interval_ms = config.hub.read_timeout_ms;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.hub.send_buffer = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.hub.ping_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9100").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.addr(), "0.0.0.0:9100");
    }

    #[test]
    fn test_load_errors() {
        let err = Config::load(Path::new("/nonexistent/wshub.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hub]\nsend_buffer = \"many\"").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }
}
