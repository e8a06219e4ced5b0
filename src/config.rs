//! Server Configuration
//!
//! A redis.conf-style file of line-delimited `key value` pairs, named as the
//! single optional CLI argument (`emberkv [config]`). Unknown keys are
//! ignored so a real redis.conf mostly works; malformed values are hard
//! errors so a typo cannot silently change durability.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

/// When to force OS buffers to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// fsync before every write returns.
    Always,
    /// A background task fsyncs once per second.
    #[default]
    EverySec,
    /// Leave flushing to the operating system.
    No,
}

impl FromStr for FsyncPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsyncPolicy::Always => write!(f, "always"),
            FsyncPolicy::EverySec => write!(f, "everysec"),
            FsyncPolicy::No => write!(f, "no"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Runtime settings of one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub appendonly: bool,
    pub appendfilename: String,
    pub appendfsync: FsyncPolicy,
    pub databases: usize,
    pub requirepass: Option<String>,
    pub cluster_enable: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            appendfsync: FsyncPolicy::default(),
            databases: 16,
            requirepass: None,
            cluster_enable: false,
        }
    }
}

impl ServerConfig {
    /// Loads settings from a `key value` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_lines(&content)
    }

    fn from_lines(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let key = key.to_lowercase();
            let value = value.trim();
            match key.as_str() {
                "bind" => config.bind = value.to_string(),
                "port" => config.port = parse(&key, value)?,
                "appendonly" => config.appendonly = parse_bool(&key, value)?,
                "appendfilename" => config.appendfilename = value.trim_matches('"').to_string(),
                "appendfsync" => {
                    config.appendfsync = value.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.clone(),
                        value: value.to_string(),
                    })?
                }
                "databases" => {
                    let n: usize = parse(&key, value)?;
                    if n == 0 {
                        return Err(ConfigError::InvalidValue { key, value: value.to_string() });
                    }
                    config.databases = n;
                }
                "requirepass" => {
                    config.requirepass = if value.is_empty() { None } else { Some(value.to_string()) }
                }
                "cluster-enable" => config.cluster_enable = parse_bool(&key, value)?,
                _ => {} // tolerate foreign redis.conf keys
            }
        }
        Ok(config)
    }

    /// The `host:port` address to bind.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
