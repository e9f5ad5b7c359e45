//! Configuration management for sandboxd.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sandboxd/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the HTTP/WebSocket server listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8420";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 127.0.0.1:8420, got {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("max_terminals must be between 1 and 1000, got {0}")]
    InvalidMaxTerminals(usize),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("execute_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidExecuteTimeout(u64),

    #[error("max_watchers must be between 1 and 1000, got {0}")]
    InvalidMaxWatchers(usize),

    #[error("settle_delay_ms must be at most 10000, got {0}")]
    InvalidSettleDelay(u64),

    #[error("{0} buffer must be greater than 0")]
    InvalidBuffer(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for sandboxd.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server and logging.
    pub server: ServerConfig,

    /// Terminal sessions.
    pub terminal: TerminalConfig,

    /// File watchers.
    pub watcher: WatcherConfig,

    /// Signal stream.
    pub signals: SignalsConfig,

    /// WebSocket connections.
    pub connection: ConnectionConfig,
}

/// HTTP server and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener to.
    pub listen_addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file to write logs to instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell used when a create request names none.
    pub default_shell: String,

    /// Maximum number of concurrent terminals.
    pub max_terminals: usize,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Upper bound on a one-shot execute, in seconds.
    pub execute_timeout_secs: u64,
}

/// File watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Maximum number of concurrent watchers.
    pub max_watchers: usize,

    /// Capacity of each watcher's event buffer. Events beyond it are dropped.
    pub event_buffer: usize,

    /// Delay before re-reading a changed file for content capture.
    pub settle_delay_ms: u64,
}

/// Signal stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalsConfig {
    /// Capacity of the shared signal buffer.
    pub buffer: usize,
}

/// WebSocket connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Outbound queue length per client. Slow clients lose events beyond it.
    pub client_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_terminals: 64,
            cols: 80,
            rows: 24,
            execute_timeout_secs: 300,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_watchers: 64,
            event_buffer: 100,
            settle_delay_ms: 100,
        }
    }
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self { buffer: 100 }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { client_queue: 256 }
    }
}

impl TerminalConfig {
    /// Returns the execute timeout as a duration.
    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.execute_timeout_secs)
    }
}

impl WatcherConfig {
    /// Returns the content-capture settle delay as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandboxd")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// A setting replaced from the environment.
///
/// Returned rather than logged because overrides are applied before the
/// subscriber that would record them is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    pub setting: &'static str,
    pub value: String,
}

impl EnvOverride {
    fn new(setting: &'static str, value: String) -> Self {
        Self { setting, value }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SANDBOXD_LISTEN_ADDR: Override the listen address
    /// - SANDBOXD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SANDBOXD_DEFAULT_SHELL: Override the default terminal shell
    ///
    /// Returns the settings that were replaced, for logging once tracing is up.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut applied = Vec::new();

        if let Some(addr) = env_value("SANDBOXD_LISTEN_ADDR") {
            self.server.listen_addr = addr.clone();
            applied.push(EnvOverride::new("listen_addr", addr));
        }

        if let Some(level) = env_value("SANDBOXD_LOG_LEVEL") {
            self.server.log_level = level.clone();
            applied.push(EnvOverride::new("log_level", level));
        }

        if let Some(shell) = env_value("SANDBOXD_DEFAULT_SHELL") {
            self.terminal.default_shell = shell.clone();
            applied.push(EnvOverride::new("default_shell", shell));
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let shell_path = Path::new(&self.terminal.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.terminal.default_shell.clone(),
                ));
            }
        } else if which::which(&self.terminal.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.terminal.default_shell.clone(),
            ));
        }

        if self.terminal.max_terminals < 1 || self.terminal.max_terminals > 1000 {
            return Err(ConfigError::InvalidMaxTerminals(self.terminal.max_terminals));
        }

        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.terminal.cols,
                rows: self.terminal.rows,
            });
        }

        if self.terminal.execute_timeout_secs < 1 || self.terminal.execute_timeout_secs > 86_400 {
            return Err(ConfigError::InvalidExecuteTimeout(
                self.terminal.execute_timeout_secs,
            ));
        }

        if self.watcher.max_watchers < 1 || self.watcher.max_watchers > 1000 {
            return Err(ConfigError::InvalidMaxWatchers(self.watcher.max_watchers));
        }

        if self.watcher.event_buffer == 0 {
            return Err(ConfigError::InvalidBuffer("watcher event"));
        }

        if self.watcher.settle_delay_ms > 10_000 {
            return Err(ConfigError::InvalidSettleDelay(self.watcher.settle_delay_ms));
        }

        if self.signals.buffer == 0 {
            return Err(ConfigError::InvalidBuffer("signal"));
        }

        if self.connection.client_queue == 0 {
            return Err(ConfigError::InvalidBuffer("client queue"));
        }

        Ok(())
    }

    /// Returns the parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_addr))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("SANDBOXD_LISTEN_ADDR");
        std::env::remove_var("SANDBOXD_LOG_LEVEL");
        std::env::remove_var("SANDBOXD_DEFAULT_SHELL");
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.terminal.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.server.log_level, "info");
        assert!(config.server.log_file.is_none());
        assert_eq!(config.terminal.max_terminals, 64);
        assert_eq!((config.terminal.cols, config.terminal.rows), (80, 24));
        assert_eq!(config.watcher.event_buffer, 100);
        assert_eq!(config.watcher.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.signals.buffer, 100);
        assert_eq!(config.connection.client_queue, 256);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
log_level = "debug"

[terminal]
max_terminals = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.terminal.max_terminals, 5);
        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.watcher, WatcherConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0:9000"
log_level = "trace"
log_file = "/var/log/sandboxd.log"

[terminal]
default_shell = "/bin/zsh"
max_terminals = 20
cols = 132
rows = 50
execute_timeout_secs = 60

[watcher]
max_watchers = 8
event_buffer = 500
settle_delay_ms = 25

[signals]
buffer = 10

[connection]
client_queue = 32
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(
            config.server.log_file,
            Some(PathBuf::from("/var/log/sandboxd.log"))
        );
        assert_eq!(config.terminal.default_shell, "/bin/zsh");
        assert_eq!(config.terminal.max_terminals, 20);
        assert_eq!((config.terminal.cols, config.terminal.rows), (132, 50));
        assert_eq!(config.terminal.execute_timeout(), Duration::from_secs(60));
        assert_eq!(config.watcher.max_watchers, 8);
        assert_eq!(config.watcher.event_buffer, 500);
        assert_eq!(config.watcher.settle_delay_ms, 25);
        assert_eq!(config.signals.buffer, 10);
        assert_eq!(config.connection.client_queue, 32);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[terminal]
max_terminals = "lots"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml_contains_sections() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[server]"));
        assert!(toml.contains("[terminal]"));
        assert!(toml.contains("[watcher]"));
        assert!(toml.contains("[signals]"));
        assert!(toml.contains("[connection]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.server.log_level = "warn".to_string();
        original.terminal.max_terminals = 42;
        original.watcher.settle_delay_ms = 0;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.signals.buffer = 7;
        original.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("sandboxd"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("SANDBOXD_LISTEN_ADDR", "0.0.0.0:1234");
        std::env::set_var("SANDBOXD_LOG_LEVEL", "debug");
        std::env::set_var("SANDBOXD_DEFAULT_SHELL", "/bin/sh");

        let mut config = Config::default();
        let applied = config.apply_env_overrides();

        assert_eq!(config.server.listen_addr, "0.0.0.0:1234");
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.terminal.default_shell, "/bin/sh");
        assert_eq!(
            applied
                .iter()
                .map(|o| (o.setting, o.value.as_str()))
                .collect::<Vec<_>>(),
            vec![
                ("listen_addr", "0.0.0.0:1234"),
                ("log_level", "debug"),
                ("default_shell", "/bin/sh"),
            ]
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("SANDBOXD_LOG_LEVEL", "");

        let mut config = Config::default();
        assert!(config.apply_env_overrides().is_empty());
        assert_eq!(config.server.log_level, "info");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        assert!(config.apply_env_overrides().is_empty());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = valid_config();
        config.server.listen_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.server.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.server.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid_config();
        config.terminal.default_shell = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.terminal.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.terminal.default_shell = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_limits() {
        let mut config = valid_config();
        config.terminal.max_terminals = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxTerminals(0)));

        let mut config = valid_config();
        config.terminal.max_terminals = 1001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxTerminals(1001))
        );

        let mut config = valid_config();
        config.watcher.max_watchers = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxWatchers(0)));

        let mut config = valid_config();
        config.terminal.execute_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidExecuteTimeout(0)));

        let mut config = valid_config();
        config.terminal.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_buffers() {
        let mut config = valid_config();
        config.watcher.event_buffer = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBuffer("watcher event"))
        );

        let mut config = valid_config();
        config.signals.buffer = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBuffer("signal")));

        let mut config = valid_config();
        config.connection.client_queue = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBuffer("client queue"))
        );

        let mut config = valid_config();
        config.watcher.settle_delay_ms = 10_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSettleDelay(10_001))
        );
    }
}
