//! Configuration module for the linechat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With neither,
//! every value falls back to the built-in defaults below.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "linechat")]
#[command(author = "linechat authors")]
#[command(version = "0.1.0")]
#[command(about = "A minimal line-oriented TCP chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// First port to try; the next free port is used on conflict
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrently active sessions
    #[arg(short = 's', long)]
    pub max_sessions: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pending-connection queue length passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// How many successive ports to try before giving up
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_port_attempts: default_max_port_attempts(),
            max_sessions: default_max_sessions(),
            workers: None,
        }
    }
}

/// Per-session protocol and history configuration
#[derive(Debug, Deserialize)]
pub struct ChatConfig {
    /// Message buffer size including the terminator slot; messages keep
    /// at most `message_capacity - 1` characters
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,
    /// Number of messages kept in the shared history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Longest inbound line in bytes before the rest is discarded
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            message_capacity: default_message_capacity(),
            history_capacity: default_history_capacity(),
            max_line_len: default_max_line_len(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9601
}

fn default_backlog() -> i32 {
    128
}

fn default_max_port_attempts() -> u16 {
    100
}

fn default_max_sessions() -> usize {
    1024
}

fn default_message_capacity() -> usize {
    64
}

fn default_history_capacity() -> usize {
    8
}

fn default_max_line_len() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Upper bound accepted for `max_line_len`
pub const MAX_LINE_LEN_LIMIT: usize = 1024 * 1024;

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_port_attempts: u16,
    pub max_sessions: usize,
    pub message_capacity: usize,
    pub history_capacity: usize,
    pub max_line_len: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(None, TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1".into()));
        }
        if self.message_capacity == 0 {
            return Err(ConfigError::Invalid("message_capacity must be at least 1".into()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        if self.max_line_len == 0 || self.max_line_len > MAX_LINE_LEN_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_line_len must be between 1 and {MAX_LINE_LEN_LIMIT}"
            )));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }

    fn merge(cli: Option<CliArgs>, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            chat,
            logging,
        } = toml_config;

        let mut config = Config {
            host: server.host,
            port: server.port,
            backlog: server.backlog,
            max_port_attempts: server.max_port_attempts,
            max_sessions: server.max_sessions,
            message_capacity: chat.message_capacity,
            history_capacity: chat.history_capacity,
            max_line_len: chat.max_line_len,
            workers: server.workers,
            log_level: logging.level,
        };

        if let Some(cli) = cli {
            if let Some(host) = cli.host {
                config.host = host;
            }
            if let Some(port) = cli.port {
                config.port = port;
            }
            if let Some(max_sessions) = cli.max_sessions {
                config.max_sessions = max_sessions;
            }
            config.workers = cli.workers.or(config.workers);
            if cli.log_level != "info" {
                config.log_level = cli.log_level;
            }
        }

        config
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
