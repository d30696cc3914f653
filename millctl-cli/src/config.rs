//! CLI configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the mill control CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Relay connection settings.
    pub relay: RelayConfig,
    /// HTTP CONNECT proxy settings.
    pub proxy: ProxyConfig,
    /// Automatic reconnection.
    pub reconnect: ReconnectConfig,
    /// Video channel.
    pub video: VideoConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bounce server host name or address.
    pub host: String,
    /// Bounce server port.
    pub port: u16,
    /// Auth token sent during the channel handshake.
    pub auth_token: String,
    /// Wrap the connection in TLS.
    pub use_tls: bool,
    /// Connect timeout in milliseconds.
    pub timeout_ms: u64,
}

/// HTTP CONNECT proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Tunnel through an HTTP proxy before the handshake.
    pub enabled: bool,
    /// Port named in the CONNECT request line; 0 means the relay port.
    pub internal_port: u16,
}

/// Automatic reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after an unexpected close.
    pub auto: bool,
    /// First retry delay in milliseconds; doubles per failure.
    pub base_delay_ms: u64,
}

/// Video channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Also open the video channel and track its bitrate.
    pub enabled: bool,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            proxy: ProxyConfig::default(),
            reconnect: ReconnectConfig::default(),
            video: VideoConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1111,
            auth_token: "hi".into(),
            use_tls: false,
            timeout_ms: 10_000,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            internal_port: 0,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto: true,
            base_delay_ms: 1000,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CliConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
