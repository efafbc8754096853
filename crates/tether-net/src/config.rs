//! Configuration for the connection manager and its transports.
//!
//! ```toml
//! [udp]
//! bind = "0.0.0.0:40000"
//! connect_timeout_ms = 1500
//!
//! [tcp]
//! enabled = false
//!
//! [signaling]
//! url = "tcp://rendezvous.example.net:5000"
//! ```

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tether_signaling::SignalingConfig;
use tether_transport::{
    TcpTransport, TcpTransportConfig, Transport, UdpTransport, UdpTransportConfig,
};

/// Connection manager configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// UDP session transport
    pub udp: UdpSection,
    /// Direct TCP transport
    pub tcp: TcpSection,
    /// Rendezvous signaling
    pub signaling: SignalingSection,
    /// Relay server settings, handed to an external relay transport
    pub relay: RelaySection,
}

/// UDP session transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSection {
    /// Include the transport
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bind address of the shared socket
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Connect timeout in milliseconds
    #[serde(default = "default_udp_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Protocol version stamped on packets
    #[serde(default = "default_version")]
    pub version: String,
}

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSection {
    /// Include the transport
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Connect timeout in milliseconds
    #[serde(default = "default_tcp_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Rendezvous signaling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingSection {
    /// Rendezvous service URL
    #[serde(default = "default_signaling_url")]
    pub url: String,
    /// Uid to register by default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Delay before retrying a failed channel connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnection_delay_ms: Option<u64>,
    /// Minimum gap between closing a channel and opening the next one
    #[serde(default)]
    pub reopen_delay_ms: u64,
    /// Acknowledgment timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Relay (TURN) server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySection {
    /// Relay server host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Relay server port
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Relay username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Relay password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// Default values

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_udp_timeout_ms() -> u64 {
    1500
}

fn default_tcp_timeout_ms() -> u64 {
    2000
}

fn default_version() -> String {
    tether_transport::udp::DEFAULT_VERSION.to_string()
}

fn default_signaling_url() -> String {
    "tcp://127.0.0.1:5000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_relay_port() -> u16 {
    3478
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            connect_timeout_ms: default_udp_timeout_ms(),
            version: default_version(),
        }
    }
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            connect_timeout_ms: default_tcp_timeout_ms(),
        }
    }
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            uid: None,
            reconnection_delay_ms: None,
            reopen_delay_ms: 0,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            server: None,
            port: default_relay_port(),
            username: None,
            password: None,
        }
    }
}

impl NetConfig {
    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or is invalid.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or is invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| NetError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Serialize configuration to TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| NetError::Config(e.to_string()))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        parse_bind(&self.udp.bind, "udp")?;
        parse_bind(&self.tcp.bind, "tcp")?;

        if self.udp.connect_timeout_ms == 0 || self.tcp.connect_timeout_ms == 0 {
            return Err(NetError::Config("connect timeouts must be positive".to_string()));
        }
        if self.udp.version.is_empty() {
            return Err(NetError::Config("udp protocol version is empty".to_string()));
        }
        if self.signaling.request_timeout_ms == 0 {
            return Err(NetError::Config(
                "signaling request timeout must be positive".to_string(),
            ));
        }
        if !self.signaling.url.starts_with("tcp://") {
            return Err(NetError::Config(format!(
                "signaling url '{}' must use tcp://",
                self.signaling.url
            )));
        }
        Ok(())
    }

    /// UDP session transport settings
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn udp_config(&self) -> Result<UdpTransportConfig> {
        Ok(UdpTransportConfig {
            bind_addr: parse_bind(&self.udp.bind, "udp")?,
            connect_timeout: Duration::from_millis(self.udp.connect_timeout_ms),
            version: self.udp.version.clone(),
        })
    }

    /// TCP transport settings
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn tcp_config(&self) -> Result<TcpTransportConfig> {
        Ok(TcpTransportConfig {
            bind_addr: parse_bind(&self.tcp.bind, "tcp")?,
            connect_timeout: Duration::from_millis(self.tcp.connect_timeout_ms),
            ..TcpTransportConfig::default()
        })
    }

    /// Signaling client settings
    #[must_use]
    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            url: self.signaling.url.clone(),
            uid: self.signaling.uid.clone(),
            reconnection_delay: self.signaling.reconnection_delay_ms.map(Duration::from_millis),
            reopen_delay: Duration::from_millis(self.signaling.reopen_delay_ms),
            request_timeout: Duration::from_millis(self.signaling.request_timeout_ms),
        }
    }
}

fn parse_bind(addr: &str, name: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|_| NetError::Config(format!("{name} bind address '{addr}' is invalid")))
}

/// Build the enabled transports in preference order: UDP sessions, then TCP.
///
/// # Errors
///
/// Returns an error if a transport's settings are invalid.
pub fn default_transports(config: &NetConfig) -> Result<Vec<Arc<dyn Transport>>> {
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    if config.udp.enabled {
        transports.push(Arc::new(UdpTransport::new(config.udp_config()?)));
    }
    if config.tcp.enabled {
        transports.push(Arc::new(TcpTransport::new(config.tcp_config()?)));
    }
    if transports.is_empty() {
        tracing::warn!("no transports enabled");
    }
    Ok(transports)
}
