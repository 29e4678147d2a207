//! # Configuration
//!
//! One [`NetworkConfig`] covers both ends of a session: the server's acceptor,
//! the client's timeouts, the shared transport settings and logging.
//!
//! Sources, in the order applications usually layer them:
//! - built-in defaults ([`NetworkConfig::default`])
//! - a TOML file ([`NetworkConfig::from_file`]); missing sections and fields
//!   keep their defaults
//! - `COMMAND_PROTOCOL_*` environment variables ([`NetworkConfig::from_env`])
//!
//! Durations are written as integer milliseconds.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;

/// Port used when an address is not configured
pub const DEFAULT_PORT: u16 = 7561;

/// Largest payload accepted by default (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Worker pool size of a freshly created server
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Prefix of every environment variable read by [`NetworkConfig::from_env`]
pub const ENV_PREFIX: &str = "COMMAND_PROTOCOL_";

const MIN_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(300);
const MIN_KEEPALIVE: Duration = Duration::from_millis(10);
const MAX_KEEPALIVE: Duration = Duration::from_secs(3600);
const MAX_POOL_SIZE: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `COMMAND_PROTOCOL_*` environment variables.
    ///
    /// See [`apply_vars`](Self::apply_vars) for the recognised names.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_vars(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Override fields from `lookup`, which maps a full variable name to its
    /// value. Unset variables leave the field alone; unparsable ones fail.
    ///
    /// | Variable (after the prefix) | Field |
    /// |---|---|
    /// | `SERVER_ADDRESS` | `server.address` |
    /// | `POOL_SIZE` | `server.pool_size` |
    /// | `HANDSHAKE_TIMEOUT_MS` | `server.handshake_timeout` |
    /// | `CLIENT_ADDRESS` | `client.address` |
    /// | `CONNECTION_TIMEOUT_MS` | `client.connection_timeout` |
    /// | `KEEPALIVE_INTERVAL_MS` | `client.keepalive_interval` |
    /// | `MAX_PAYLOAD_SIZE` | `transport.max_payload_size` |
    /// | `TLS_CERT` | `transport.cert_path`, and enables TLS |
    /// | `TLS_KEY` | `transport.key_path` |
    /// | `LOG_LEVEL` | `logging.level` |
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars(lookup);

        if let Some(address) = vars.get("SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(size) = vars.parse("POOL_SIZE")? {
            self.server.pool_size = size;
        }
        if let Some(ms) = vars.parse("HANDSHAKE_TIMEOUT_MS")? {
            self.server.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(address) = vars.get("CLIENT_ADDRESS") {
            self.client.address = address;
        }
        if let Some(ms) = vars.parse("CONNECTION_TIMEOUT_MS")? {
            self.client.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = vars.parse("KEEPALIVE_INTERVAL_MS")? {
            self.client.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(size) = vars.parse("MAX_PAYLOAD_SIZE")? {
            self.transport.max_payload_size = size;
        }
        if let Some(cert) = vars.get("TLS_CERT") {
            self.transport.cert_path = Some(cert.into());
            self.transport.tls_enabled = true;
        }
        if let Some(key) = vars.get("TLS_KEY") {
            self.transport.key_path = Some(key.into());
        }
        if let Some(level) = vars.parse("LOG_LEVEL")? {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Defaults with `mutator` applied
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration as a TOML document
    pub fn example_config() -> String {
        match toml::to_string_pretty(&Self::default()) {
            Ok(body) => format!("# command-protocol configuration\n\n{body}"),
            Err(e) => format!("# Failed to render configuration: {e}\n"),
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;
        let path = path.as_ref();
        std::fs::write(path, content).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Every problem found, one message each. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.server.check(&mut problems);
        self.client.check(&mut problems);
        self.transport.check(&mut problems);
        self.logging.check(&mut problems);
        problems
    }

    /// [`validate`](Self::validate) folded into a single `ConfigError`
    pub fn validate_strict(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "Invalid configuration: {}",
            problems.join("; ")
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, `ip:port`
    pub address: String,

    /// Sessions served at once; further clients wait for a worker
    pub pool_size: usize,

    /// Deadline for the client's Auth packet. Zero disables it.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            pool_size: DEFAULT_POOL_SIZE,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Handshake deadline, `None` when disabled
    pub fn handshake_deadline(&self) -> Option<Duration> {
        (!self.handshake_timeout.is_zero()).then_some(self.handshake_timeout)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.check(&mut problems);
        problems
    }

    fn check(&self, problems: &mut Vec<String>) {
        if self.address.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!(
                "server.address must be ip:port, got '{}'",
                self.address
            ));
        }

        match self.pool_size {
            0 => problems.push("server.pool_size must be at least 1".into()),
            n if n > MAX_POOL_SIZE => problems.push(format!(
                "server.pool_size {n} exceeds {MAX_POOL_SIZE}"
            )),
            _ => {}
        }

        if let Some(deadline) = self.handshake_deadline() {
            if deadline < MIN_TIMEOUT {
                problems.push(format!(
                    "server.handshake_timeout below {}ms",
                    MIN_TIMEOUT.as_millis()
                ));
            } else if deadline > MAX_HANDSHAKE_TIMEOUT {
                problems.push(format!(
                    "server.handshake_timeout above {}s",
                    MAX_HANDSHAKE_TIMEOUT.as_secs()
                ));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server to connect to, `host:port`
    pub address: String,

    /// Limit for the TCP connect and the TLS handshake
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Time between keep-alive pings
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.check(&mut problems);
        problems
    }

    fn check(&self, problems: &mut Vec<String>) {
        let has_host_and_port = self
            .address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !has_host_and_port {
            problems.push(format!(
                "client.address must be host:port, got '{}'",
                self.address
            ));
        }

        if self.connection_timeout < MIN_TIMEOUT {
            problems.push(format!(
                "client.connection_timeout below {}ms",
                MIN_TIMEOUT.as_millis()
            ));
        }

        if self.keepalive_interval < MIN_KEEPALIVE {
            problems.push(format!(
                "client.keepalive_interval below {}ms",
                MIN_KEEPALIVE.as_millis()
            ));
        } else if self.keepalive_interval > MAX_KEEPALIVE {
            problems.push(format!(
                "client.keepalive_interval above {}s",
                MAX_KEEPALIVE.as_secs()
            ));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Largest payload either end accepts, in bytes
    pub max_payload_size: usize,

    pub tls_enabled: bool,

    /// PEM certificate; the server presents it and the client trusts it
    pub cert_path: Option<PathBuf>,

    /// PEM private key, server only
    pub key_path: Option<PathBuf>,

    /// Name the client checks the certificate against
    pub server_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            tls_enabled: false,
            cert_path: None,
            key_path: None,
            server_name: String::from("localhost"),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.check(&mut problems);
        problems
    }

    fn check(&self, problems: &mut Vec<String>) {
        // Frame length is an i32 that also counts the id byte
        let ceiling = i32::MAX as usize - 1;
        if self.max_payload_size == 0 {
            problems.push("transport.max_payload_size must be positive".into());
        } else if self.max_payload_size > ceiling {
            problems.push(format!(
                "transport.max_payload_size {} exceeds the frame limit {ceiling}",
                self.max_payload_size
            ));
        }

        if !self.tls_enabled {
            return;
        }
        if self.cert_path.is_none() {
            problems.push("transport.cert_path is required with TLS".into());
        }
        if self.server_name.is_empty() {
            problems.push("transport.server_name is required with TLS".into());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Included in the "Logging initialized" event
    pub app_name: String,

    /// Default filter level; `RUST_LOG` wins when set
    #[serde(with = "level_name")]
    pub level: Level,

    /// Append to this file instead of writing to stderr
    pub file: Option<PathBuf>,

    /// One JSON object per event
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("command-protocol"),
            level: Level::INFO,
            file: None,
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        self.check(&mut problems);
        problems
    }

    fn check(&self, problems: &mut Vec<String>) {
        if self.app_name.is_empty() || self.app_name.len() > 64 {
            problems.push("logging.app_name must be 1 to 64 bytes".into());
        }

        let missing_dir = self
            .file
            .as_deref()
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty() && !dir.is_dir());
        if let Some(dir) = missing_dir {
            problems.push(format!(
                "logging.file directory {} does not exist",
                dir.display()
            ));
        }
    }
}

/// Variable lookup with the crate prefix applied
struct EnvVars<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvVars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(&format!("{ENV_PREFIX}{name}"))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    ProtocolError::ConfigError(format!("Invalid {ENV_PREFIX}{name}={raw}: {e}"))
                })
            })
            .transpose()
    }
}

/// `Duration` as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `tracing::Level` as a lowercase name
mod level_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("Invalid log level: {name}")))
    }
}
