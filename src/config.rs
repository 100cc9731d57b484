//! # Configuration Management
//!
//! Centralized configuration for the console multiplexer.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `apply_env()`
//!
//! Durations are written in milliseconds. Program definitions are listed as
//! `[[programs]]` tables; they are validated separately by the program
//! registry at startup.

use crate::core::packet::MAX_STRING_LEN;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Current protocol version spoken by this build
pub const PROTOCOL_VERSION: u8 = 1;

/// Default frame payload cap (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerSettings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub console: ConsoleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
}

impl ServerSettings {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| Error::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Override settings from `PROCMUX_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("PROCMUX_ADDRESS") {
            self.server.address = addr;
        }

        if let Ok(interval) = std::env::var("PROCMUX_TICK_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                self.session.tick_interval = Duration::from_millis(val);
            }
        }

        if let Ok(token) = std::env::var("PROCMUX_TOKEN") {
            self.server.token = Some(token);
        }

        if let Ok(level) = std::env::var("PROCMUX_LOG_LEVEL") {
            if let Ok(level) = level.parse::<Level>() {
                self.logging.level = level;
            }
        }
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.session.validate());
        errors.extend(self.limiter.validate());
        errors.extend(self.console.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener and protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:8123")
    pub address: String,

    /// Reject clients whose protocol version differs from ours
    pub strict_protocol: bool,

    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,

    /// How long shutdown waits for the tick and sweep loops
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Shared secret clients must present in `ConnectionRequest`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:8123"),
            strict_protocol: true,
            max_frame_size: MAX_FRAME_SIZE,
            shutdown_timeout: Duration::from_secs(5),
            token: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8123')",
                self.address
            ));
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 64 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: 64 MB)",
                self.max_frame_size
            ));
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if let Some(token) = &self.token {
            if token.is_empty() {
                errors.push("Access token cannot be empty (omit it to disable)".to_string());
            } else if token.len() > MAX_STRING_LEN {
                errors.push(format!(
                    "Access token too long (maximum: {MAX_STRING_LEN} bytes)"
                ));
            }
        }

        errors
    }
}

/// Per-session queues and the manager tick
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between manager ticks
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Raw frames buffered between the receive pump and the tick
    pub inbound_capacity: usize,

    /// Encoded packets buffered ahead of the transmit pump
    pub outbound_capacity: usize,

    /// Inbound frames processed per session per tick
    pub batch_size: usize,

    /// How long a session may stay in the handshake before it is dropped
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            inbound_capacity: 20,
            outbound_capacity: 20,
            batch_size: 20,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tick_interval.as_millis() < 1 {
            errors.push("Tick interval too short (minimum: 1ms)".to_string());
        } else if self.tick_interval.as_secs() > 10 {
            errors.push("Tick interval too long (maximum: 10s)".to_string());
        }

        if self.inbound_capacity == 0 {
            errors.push("Inbound capacity must be greater than 0".to_string());
        }

        if self.outbound_capacity == 0 {
            errors.push("Outbound capacity must be greater than 0".to_string());
        }

        if self.batch_size == 0 {
            errors.push("Batch size must be greater than 0".to_string());
        }

        if self.handshake_timeout.is_zero() {
            errors.push("Handshake timeout must be greater than 0".to_string());
        }

        errors
    }
}

/// Connection rate limiting
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Admissions allowed per address per window
    pub max_count: u32,

    #[serde(with = "duration_serde")]
    pub window: Duration,

    /// How long a blocked address stays blocked
    #[serde(with = "duration_serde")]
    pub block_expire: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_count: 10,
            window: Duration::from_secs(1),
            block_expire: Duration::from_secs(60),
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_count == 0 {
            errors.push("Limiter max count must be greater than 0".to_string());
        }

        if self.window.as_millis() < 100 {
            errors.push("Limiter window too short (minimum: 100ms)".to_string());
        }

        if self.block_expire < self.window {
            errors.push("Limiter block expiry must be at least one window".to_string());
        }

        errors
    }
}

/// Console capture and process pipe settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Lines retained per console
    pub log_capacity: usize,

    /// Recent lines sent to a session when it joins
    pub join_backlog: usize,

    /// Output lines buffered between the process and the log
    pub line_capacity: usize,

    /// Commands buffered ahead of the process stdin
    pub command_capacity: usize,

    /// Interval between sweeps of closed consoles
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            log_capacity: 200,
            join_backlog: 50,
            line_capacity: 10,
            command_capacity: 10,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl ConsoleConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.log_capacity == 0 {
            errors.push("Console log capacity must be greater than 0".to_string());
        }

        if self.join_backlog > self.log_capacity {
            errors.push("Join backlog cannot exceed the console log capacity".to_string());
        }

        if self.line_capacity == 0 || self.command_capacity == 0 {
            errors.push("Console pipe capacities must be greater than 0".to_string());
        }

        if self.sweep_interval.as_millis() < 10 {
            errors.push("Console sweep interval too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(with = "log_level_serde")]
    pub level: Level,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
        }
    }
}

/// One launchable program
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgramConfig {
    /// Letters and digits only; folded to lowercase
    pub name: String,

    /// Working directory the loader resolves against
    pub path: PathBuf,

    /// Loader kind, e.g. "exec" or "pmmp"
    pub loader: String,

    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
