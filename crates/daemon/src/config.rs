//! Configuration management for the Termexec daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termexec/config.toml`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be an IP address, got {0}")]
    InvalidBindAddr(String),

    #[error("oneshot_timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidOneshotTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("pty size must be non-zero, got {cols}x{rows}")]
    InvalidPtySize { cols: u16, rows: u16 },

    #[error("interactive_term must not be empty")]
    EmptyInteractiveTerm,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Termexec daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// Command execution configuration.
    pub exec: ExecConfig,

    /// Interactive pseudo-terminal configuration.
    pub pty: PtyConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,

    /// Port to listen on; 0 lets the OS pick one.
    pub port: u16,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Command execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Deadline for one-shot execution, in seconds.
    pub oneshot_timeout_secs: u64,

    /// How long trailing output is drained after a process exits, in milliseconds.
    pub exit_drain_millis: u64,

    /// Command prefixes that get a color-capable terminal type.
    pub interactive_prefixes: Vec<String>,

    /// TERM value forced for interactive commands.
    pub interactive_term: String,
}

/// Pseudo-terminal configuration for the WebSocket bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell to launch. Empty means `$SHELL` or the platform default.
    pub shell: String,

    /// Initial terminal width in columns.
    pub cols: u16,

    /// Initial terminal height in rows.
    pub rows: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            oneshot_timeout_secs: 30,
            exit_drain_millis: 100,
            interactive_prefixes: ["ssh", "telnet", "mysql", "psql", "mongo", "redis-cli"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            interactive_term: "xterm-256color".to_string(),
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: String::new(),
            cols: 80,
            rows: 24,
        }
    }
}

impl ExecConfig {
    /// One-shot execution deadline.
    pub fn oneshot_timeout(&self) -> Duration {
        Duration::from_secs(self.oneshot_timeout_secs)
    }

    /// Grace period for draining output after exit.
    pub fn exit_drain(&self) -> Duration {
        Duration::from_millis(self.exit_drain_millis)
    }
}

impl PtyConfig {
    /// The shell to launch, resolving the empty default.
    pub fn resolved_shell(&self) -> String {
        if self.shell.is_empty() {
            default_shell()
        } else {
            self.shell.clone()
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termexec")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
pub fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMEXEC_BIND_ADDR: Override listener address
    /// - TERMEXEC_PORT: Override listener port
    /// - TERMEXEC_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TERMEXEC_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(port) = std::env::var("TERMEXEC_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring invalid TERMEXEC_PORT {:?}: {}", port, e),
            }
        }

        if let Ok(level) = std::env::var("TERMEXEC_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        if self.exec.oneshot_timeout_secs < 1 || self.exec.oneshot_timeout_secs > 3600 {
            return Err(ConfigError::InvalidOneshotTimeout(
                self.exec.oneshot_timeout_secs,
            ));
        }

        if self.exec.interactive_term.is_empty() {
            return Err(ConfigError::EmptyInteractiveTerm);
        }

        if self.pty.cols == 0 || self.pty.rows == 0 {
            return Err(ConfigError::InvalidPtySize {
                cols: self.pty.cols,
                rows: self.pty.rows,
            });
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// The socket address to listen on.
    ///
    /// Call [`Config::validate`] first; an unparsable address falls back to
    /// loopback.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self
            .server
            .bind_addr
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        SocketAddr::new(ip, self.server.port)
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
