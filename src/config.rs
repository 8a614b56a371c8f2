//! Configuration management for the byfs server
//!
//! A single `ServerConfig` is built once at startup from defaults, an optional
//! `byfs.toml`, and `BYFS_*` environment variables, then shared by reference.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Largest string the 16-bit length prefix can carry.
pub const WIRE_STRING_LIMIT: usize = u16::MAX as usize;

/// Digest used by the token authenticator.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    #[default]
    Md5,
    Sha256,
}

/// Complete server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    // ═══ NETWORK ═══
    /// IP address the listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional display name, echoed in the `ps` header
    #[serde(default)]
    pub server_name: Option<String>,

    // ═══ FILESYSTEM ═══
    /// Jail root; every client path resolves beneath it
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// Permission bits for newly created files
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,

    // ═══ AUTHENTICATION ═══
    /// Shared secret; unset or empty disables authentication
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default)]
    pub digest: DigestKind,

    // ═══ TIMEOUTS & LIMITS ═══
    /// Wait for the next opcode
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Request header fields and response flushes
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Throughput floor used to stretch bulk transfer deadlines
    #[serde(default = "default_min_transfer_kbps")]
    pub min_transfer_kbps: u64,

    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,

    #[serde(default = "default_max_dir_entries")]
    pub max_dir_entries: u16,

    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_root_dir() -> String {
    ".".to_string()
}

fn default_file_mode() -> u32 {
    0o666
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_action_timeout_secs() -> u64 {
    2
}

fn default_min_transfer_kbps() -> u64 {
    5
}

fn default_max_string_length() -> usize {
    10 * 1024
}

fn default_max_dir_entries() -> u16 {
    1000
}

fn default_max_header_bytes() -> usize {
    8 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            server_name: None,
            root_dir: default_root_dir(),
            file_mode: default_file_mode(),
            secret: None,
            digest: DigestKind::default(),
            idle_timeout_secs: default_idle_timeout_secs(),
            action_timeout_secs: default_action_timeout_secs(),
            min_transfer_kbps: default_min_transfer_kbps(),
            max_string_length: default_max_string_length(),
            max_dir_entries: default_max_dir_entries(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from byfs.toml (if present) with environment overrides
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("byfs").required(false))
            .add_source(Environment::with_prefix("BYFS").try_parsing(true))
            .build()?;

        let mut config: ServerConfig = settings.try_deserialize()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Treats empty optional strings as unset.
    fn normalize(&mut self) {
        if self.secret.as_deref().is_some_and(str::is_empty) {
            self.secret = None;
        }
        if self.server_name.as_deref().is_some_and(str::is_empty) {
            self.server_name = None;
        }
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.port == 0 {
            return Err(config::ConfigError::Message("port cannot be 0".into()));
        }

        if self.root_dir.is_empty() {
            return Err(config::ConfigError::Message(
                "root_dir cannot be empty".into(),
            ));
        }

        if self.idle_timeout_secs == 0 || self.action_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "timeouts must be greater than 0".into(),
            ));
        }

        if self.min_transfer_kbps == 0 {
            return Err(config::ConfigError::Message(
                "min_transfer_kbps must be greater than 0".into(),
            ));
        }

        if self.max_string_length == 0 || self.max_string_length > WIRE_STRING_LIMIT {
            return Err(config::ConfigError::Message(format!(
                "max_string_length must be between 1 and {WIRE_STRING_LIMIT}"
            )));
        }

        Ok(())
    }

    /// Get bind address and port as socket address
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root_dir)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}
