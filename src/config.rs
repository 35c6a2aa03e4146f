//! # Configuration Management
//!
//! Configuration for remote-object servers and clients.
//!
//! ## Configuration Sources
//! - TOML files via [`RemoteConfig::from_file`]
//! - TOML strings via [`RemoteConfig::from_toml`]
//! - Environment variables (`REMOTE_OBJECT_*`) via [`RemoteConfig::from_env`]
//! - Direct instantiation with defaults
//!
//! ## Durations
//! Every duration field accepts a humantime string (`"30s"`, `"1m 30s"`,
//! `"250ms"`) or a plain number of seconds (`30`, `0.5`).
//!
//! ## Protocol options
//! [`ProtocolConfig`] carries the attribute access gates. The gates the
//! remote-object runtime depends on are forced on by
//! [`ProtocolConfig::merged`], whatever the user supplied; unknown keys are
//! kept in [`ProtocolConfig::extra`] and passed through untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{Fault, Result};
use crate::utils::compression::CompressionKind;
use crate::utils::timeout;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes to identify protocol packets ("RMOP")
pub const MAGIC_BYTES: [u8; 4] = *b"RMOP";

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 18861;

/// Names carrying library metadata rather than operations
pub const DEFAULT_METADATA_PREFIX: &str = "ROBOT_LIBRARY_";

/// Prefix of explicitly exposed members when `allow_exposed_attrs` is on
pub const DEFAULT_EXPOSED_PREFIX: &str = "exposed_";

/// Payloads at least this large are compressed when compression is enabled
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RemoteConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RemoteConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Fault::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| Fault::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `REMOTE_OBJECT_*` environment variables.
    ///
    /// Unparseable values are reported instead of silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = env_var("REMOTE_OBJECT_HOST") {
            config.server.host = match host.as_str() {
                "" | "*" => None,
                _ => Some(host),
            };
        }
        if let Some(port) = env_var("REMOTE_OBJECT_PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|_| Fault::Config(format!("Invalid REMOTE_OBJECT_PORT: {port}")))?;
            config.server.port = port;
            config.client.port = port;
        }
        if let Some(path) = env_var("REMOTE_OBJECT_PORT_FILE") {
            config.server.port_file = Some(PathBuf::from(path));
        }
        if let Some(flag) = env_var("REMOTE_OBJECT_ALLOW_REMOTE_STOP") {
            config.server.allow_remote_stop = parse_flag("REMOTE_OBJECT_ALLOW_REMOTE_STOP", &flag)?;
        }
        if let Some(flag) = env_var("REMOTE_OBJECT_IPV6") {
            let ipv6 = parse_flag("REMOTE_OBJECT_IPV6", &flag)?;
            config.server.ipv6 = ipv6;
            config.client.ipv6 = ipv6;
        }
        if let Some(text) = env_var("REMOTE_OBJECT_TIMEOUT") {
            let timeout = duration_format::parse_duration(&text)
                .map_err(|e| Fault::Config(format!("Invalid REMOTE_OBJECT_TIMEOUT: {e}")))?;
            config.server.timeout = Some(timeout);
            config.client.timeout = Some(timeout);
        }
        if let Some(peer) = env_var("REMOTE_OBJECT_PEER") {
            config.client.peer = peer;
        }
        if let Some(level) = env_var("REMOTE_OBJECT_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| Fault::Config(format!("Invalid REMOTE_OBJECT_LOG_LEVEL: {level}")))?;
        }

        Ok(config)
    }

    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Fault::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| Fault::Config(format!("Failed to write config file: {e}")))
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Fault::Config(format!("Invalid {name}: {value}"))),
    }
}

fn strict(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Fault::Config(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// How accepted connections are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptStrategy {
    /// One blocking worker per connection
    #[default]
    Threaded,
    /// Serve one connection to completion before accepting the next
    SingleConnection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on; `None` listens on all interfaces
    pub host: Option<String>,

    /// Port to listen on; `0` selects a free port
    pub port: u16,

    /// File the bound port is written to after bind, removed after stop
    pub port_file: Option<PathBuf>,

    /// Start serving as soon as the server is constructed
    pub auto_start: bool,

    /// Allow peers to stop the server
    pub allow_remote_stop: bool,

    /// Listen on IPv6 instead of IPv4
    pub ipv6: bool,

    /// Timeout for calls the server makes back into its peers
    #[serde(with = "duration_format::option")]
    pub timeout: Option<Duration>,

    pub accept_strategy: AcceptStrategy,

    /// How long the accept loop waits for in-flight connections on stop
    #[serde(with = "duration_format")]
    pub shutdown_timeout: Duration,

    /// How often idle connections check whether the server is stopping
    #[serde(with = "duration_format")]
    pub poll_interval: Duration,

    pub protocol: ProtocolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Some(String::from("localhost")),
            port: DEFAULT_PORT,
            port_file: None,
            auto_start: true,
            allow_remote_stop: true,
            ipv6: false,
            timeout: None,
            accept_strategy: AcceptStrategy::Threaded,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            poll_interval: timeout::POLL_INTERVAL,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(host) = &self.host {
            if host.is_empty() {
                errors.push("Server host cannot be empty (use no host to listen on all interfaces)".to_string());
            }
        }

        if let Some(path) = &self.port_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    errors.push(format!(
                        "Port file directory does not exist: {}",
                        parent.display()
                    ));
                }
            }
        }

        errors.extend(validate_call_timeout(self.timeout));

        if self.shutdown_timeout.as_millis() < 10 {
            errors.push("Shutdown timeout too short (minimum: 10ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 300 {
            errors.push("Shutdown timeout too long (maximum: 300s)".to_string());
        }

        if self.poll_interval.is_zero() {
            errors.push("Poll interval must be greater than 0".to_string());
        } else if self.poll_interval.as_secs() > 10 {
            errors.push("Poll interval too long (maximum: 10s)".to_string());
        }

        errors.extend(self.protocol.validate());
        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address of the server
    pub peer: String,

    pub port: u16,

    pub ipv6: bool,

    /// Timeout for each synchronous call; `None` waits forever
    #[serde(with = "duration_format::option")]
    pub timeout: Option<Duration>,

    #[serde(with = "duration_format")]
    pub connect_timeout: Duration,

    pub protocol: ProtocolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer: String::from("localhost"),
            port: DEFAULT_PORT,
            ipv6: false,
            timeout: None,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.peer.is_empty() {
            errors.push("Client peer cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("Client port must be greater than 0".to_string());
        }

        errors.extend(validate_call_timeout(self.timeout));

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        }

        errors.extend(self.protocol.validate());
        errors
    }
}

fn validate_call_timeout(timeout: Option<Duration>) -> Option<String> {
    match timeout {
        Some(t) if t.is_zero() => Some("Call timeout must be greater than 0 (omit it to wait forever)".to_string()),
        _ => None,
    }
}

/// Attribute access gates and wire options shared by both endpoints.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Allow access to private (`_`-prefixed) names
    pub allow_all_attrs: bool,
    pub allow_getattr: bool,
    pub allow_setattr: bool,
    pub allow_delattr: bool,

    /// Resolve `name` to the member `{exposed_prefix}{name}` first
    pub allow_exposed_attrs: bool,
    pub exposed_prefix: String,

    /// Names carrying metadata; listed as capabilities and readable through
    /// the client facade even though they are not callable
    pub metadata_prefix: String,

    /// Compression applied to payloads above the threshold
    pub compression: Option<CompressionKind>,
    pub compression_threshold: usize,

    /// Options this runtime does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            allow_all_attrs: true,
            allow_getattr: true,
            allow_setattr: true,
            allow_delattr: true,
            allow_exposed_attrs: false,
            exposed_prefix: String::from(DEFAULT_EXPOSED_PREFIX),
            metadata_prefix: String::from(DEFAULT_METADATA_PREFIX),
            compression: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            extra: BTreeMap::new(),
        }
    }
}

impl ProtocolConfig {
    /// User options with the required gates forced on.
    pub fn merged(&self) -> Self {
        Self {
            allow_all_attrs: true,
            allow_getattr: true,
            allow_setattr: true,
            allow_delattr: true,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.metadata_prefix.is_empty() {
            errors.push("Metadata prefix cannot be empty".to_string());
        } else if self.metadata_prefix.starts_with('_') {
            errors.push(format!(
                "Metadata prefix '{}' would be treated as private",
                self.metadata_prefix
            ));
        }

        if self.allow_exposed_attrs && self.exposed_prefix.is_empty() {
            errors.push("Exposed prefix cannot be empty when allow_exposed_attrs is on".to_string());
        }

        if self.compression.is_some() && self.compression_threshold > MAX_PAYLOAD_SIZE {
            errors.push("Compression threshold cannot be larger than max payload size".to_string());
        }

        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Filter directives (`remote_object=debug,warn`); `RUST_LOG` wins when set
    pub env_filter: Option<String>,

    pub log_to_console: bool,

    pub log_to_file: bool,

    pub log_file_path: Option<PathBuf>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("remote-object"),
            log_level: Level::INFO,
            env_filter: None,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        }

        if self.log_to_file {
            match &self.log_file_path {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            errors.push(format!(
                                "Log file directory does not exist: {}",
                                parent.display()
                            ));
                        }
                    }
                }
                None => errors
                    .push("log_file_path must be specified when log_to_file is true".to_string()),
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as humantime strings or plain seconds.
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(f64),
        Text(String),
    }

    impl Repr {
        fn into_duration(self) -> Result<Duration, String> {
            match self {
                Repr::Seconds(secs) if secs.is_finite() && secs >= 0.0 => {
                    Ok(Duration::from_secs_f64(secs))
                }
                Repr::Seconds(secs) => Err(format!("invalid duration: {secs}")),
                Repr::Text(text) => parse_duration(&text),
            }
        }
    }

    /// Parse `"30s"`, `"1m 30s"` or a bare number of seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let trimmed = s.trim();
        if let Ok(secs) = trimmed.parse::<f64>() {
            return Repr::Seconds(secs).into_duration();
        }
        humantime::parse_duration(trimmed).map_err(|e| format!("invalid duration '{s}': {e}"))
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Repr::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::Repr;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<Repr>::deserialize(deserializer)?
                .map(Repr::into_duration)
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.to_string().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Level::from_str(&text)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {text}")))
    }
}
