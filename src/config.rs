//! # Configuration Management
//!
//! Centralized configuration for the bridge transport library.
//!
//! This module provides the protocol constants shared across the crate and a
//! structured configuration for embedding applications: transport selection,
//! payload limits, the local feature list, and the credential store location.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (`BRIDGE_*`)
//! - Direct instantiation with defaults
//!
//! The core consumes this configuration; it never owns it. Everything here is
//! provided by the embedding application.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Protocol version offered in the connect packet.
///
/// The effective version of a session is `min(local, remote)`; versions at or
/// above [`VERSION_SKIP_CHECKSUM`] never validate the legacy payload checksum.
pub const VERSION: u32 = 0x0100_0001;

/// Oldest protocol version this implementation interoperates with.
pub const VERSION_MIN: u32 = 0x0100_0000;

/// First protocol version that stopped validating the legacy checksum.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Default maximum payload size offered for socket-based transports (1 MiB).
pub const MAX_PAYLOAD_DEFAULT: usize = 1024 * 1024;

/// Conservative maximum payload size for USB transports, where bulk-transfer
/// buffers on older devices are small.
pub const MAX_PAYLOAD_USB: usize = 4096;

/// Hard upper bound on a declared payload length accepted off the wire,
/// independent of negotiation. Caps allocation for hostile headers.
pub const MAX_PAYLOAD_LIMIT: usize = 16 * 1024 * 1024;

/// Features this implementation understands and declares by default.
pub const LOCAL_FEATURES: &[&str] = &["shell_v2", "cmd", "stat_v2", "ls_v2", "delayed_ack"];

/// Standard initial per-stream byte window under delayed-ack, assumed when
/// the acknowledgment accepting an open does not advertise one explicitly.
pub const DELAYED_ACK_WINDOW: u32 = 32 * 1024 * 1024;

/// Which kind of byte-duplex channel carries the framed packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct TCP connection to the device.
    #[default]
    Tcp,
    /// USB bulk endpoints (byte-duplex channel provided by the embedder).
    Usb,
    /// A relay socket that forwards to the device.
    Relay,
}

/// Transport-level settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Transport selector.
    #[serde(default)]
    pub kind: TransportKind,

    /// Address for `Tcp`/`Relay` transports, e.g. `"192.168.1.20:5555"`.
    #[serde(default)]
    pub address: String,

    /// Override for the locally offered maximum payload size.
    /// `None` picks the default for the transport kind.
    #[serde(default)]
    pub max_payload: Option<usize>,

    /// Timeout applied when establishing the byte channel.
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            address: String::new(),
            max_payload: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl TransportConfig {
    /// The maximum payload size this side offers during the handshake.
    pub fn offered_max_payload(&self) -> usize {
        self.max_payload.unwrap_or(match self.kind {
            TransportKind::Usb => MAX_PAYLOAD_USB,
            TransportKind::Tcp | TransportKind::Relay => MAX_PAYLOAD_DEFAULT,
        })
    }
}

/// Credential store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Directory holding PKCS#8 PEM private keys.
    pub key_dir: PathBuf,

    /// Name embedded in freshly generated public keys, typically
    /// `user@host`.
    #[serde(default = "default_key_name")]
    pub key_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from(".bridge-keys"),
            key_name: default_key_name(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `"info"` or `"bridge_protocol=debug"`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Main configuration structure consumed by the transport core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Credential store configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Features declared to the remote. Defaults to [`LOCAL_FEATURES`].
    #[serde(default = "default_features")]
    pub features: Vec<String>,
}

// Derived Default would leave `features` empty; the serde default attribute
// only covers deserialization.
impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            features: default_features(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BRIDGE_ADDRESS") {
            config.transport.address = addr;
        }

        if let Ok(dir) = std::env::var("BRIDGE_KEY_DIR") {
            config.auth.key_dir = PathBuf::from(dir);
        }

        if let Ok(max) = std::env::var("BRIDGE_MAX_PAYLOAD") {
            if let Ok(val) = max.parse::<usize>() {
                config.transport.max_payload = Some(val);
            }
        }

        if let Ok(timeout) = std::env::var("BRIDGE_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.transport.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(features) = std::env::var("BRIDGE_FEATURES") {
            config.features = features.split(',').map(str::to_owned).collect();
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if matches!(
            self.transport.kind,
            TransportKind::Tcp | TransportKind::Relay
        ) && self.transport.address.is_empty()
        {
            errors.push("transport.address must be set for tcp/relay transports".to_string());
        }

        if let Some(max) = self.transport.max_payload {
            if max == 0 {
                errors.push("transport.max_payload must be nonzero".to_string());
            }
            if max > MAX_PAYLOAD_LIMIT {
                errors.push(format!(
                    "transport.max_payload {max} exceeds hard limit {MAX_PAYLOAD_LIMIT}"
                ));
            }
        }

        if self.transport.connect_timeout.is_zero() {
            errors.push("transport.connect_timeout must be nonzero".to_string());
        }

        if self.auth.key_name.is_empty() {
            errors.push("auth.key_name must not be empty".to_string());
        }

        errors
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_key_name() -> String {
    "bridge@host".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_features() -> Vec<String> {
    LOCAL_FEATURES.iter().map(|s| (*s).to_string()).collect()
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
