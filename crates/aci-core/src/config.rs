//! Centralized configuration for the ACI client layer.
//!
//! Fixed protocol values live on constant holders (`KernelConfig`,
//! `NetworkConfig`, `WireConfig`); per-process settings live on
//! [`ClientConfig`], which can be loaded from a JSON file.

use crate::locator::NodeAddress;
use crate::{AciError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Local kernel defaults.
pub struct KernelConfig;

impl KernelConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 2005;
    pub const PROTOCOL_VERSION: &'static str = "ACI/1.0";
    pub const WELCOME_PREFIX: &'static str = "WELCOME to ";
    pub const REFERENCE_SCHEME: &'static str = "acil";
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_ATTEMPTS: u32 = 2;
}

/// Limits applied while reading from the wire.
pub struct WireConfig;

impl WireConfig {
    pub const MAX_LINE_LENGTH: usize = 64 * 1024; // 64KB
    pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024 * 1024; // 256MB
    pub const REQUEST_VERSION: &'static str = "1.0";
}

/// Wire framing selected when an invoker is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Line-oriented command/response framing over a raw stream.
    Line,
    /// The same exchanges tunneled through HTTP/1.1 POST requests.
    Http,
}

impl WireProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireProtocol::Line => "line",
            WireProtocol::Http => "http",
        }
    }
}

impl Default for WireProtocol {
    fn default() -> Self {
        WireProtocol::Line
    }
}

impl FromStr for WireProtocol {
    type Err = AciError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "line" => Ok(WireProtocol::Line),
            "http" => Ok(WireProtocol::Http),
            other => Err(AciError::Config {
                message: format!("unknown wire protocol: {}", other),
            }),
        }
    }
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime settings for an invoker or admin facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host of the local kernel.
    pub kernel_host: String,
    /// Port of the local kernel.
    pub kernel_port: u16,
    /// Wire framing to speak.
    pub protocol: WireProtocol,
    /// Read timeout applied to every connection, in milliseconds.
    pub read_timeout_ms: Option<u64>,
    /// Pause before the forced reconnect, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Spread the reconnect pause randomly so clients do not reconnect in step.
    pub reconnect_jitter: bool,
    /// Fixed requestor id; a random one is generated when absent.
    pub requestor_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kernel_host: KernelConfig::DEFAULT_HOST.to_string(),
            kernel_port: KernelConfig::DEFAULT_PORT,
            protocol: WireProtocol::default(),
            read_timeout_ms: None,
            reconnect_delay_ms: 0,
            reconnect_jitter: false,
            requestor_id: None,
        }
    }
}

impl ClientConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| AciError::io_with_path(e, path))?;
        serde_json::from_str(&text).map_err(|e| AciError::Config {
            message: format!("invalid config file {}: {}", path.display(), e),
        })
    }

    /// Set the local kernel address.
    pub fn with_kernel(mut self, host: impl Into<String>, port: u16) -> Self {
        self.kernel_host = host.into();
        self.kernel_port = port;
        self
    }

    /// Set the wire framing.
    pub fn with_protocol(mut self, protocol: WireProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Set the pause before the forced reconnect.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_reconnect_jitter(mut self, jitter: bool) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set a fixed requestor id.
    pub fn with_requestor_id(mut self, id: impl Into<String>) -> Self {
        self.requestor_id = Some(id.into());
        self
    }

    pub fn kernel_address(&self) -> NodeAddress {
        NodeAddress::new(self.kernel_host.clone(), self.kernel_port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// The configured requestor id, or a freshly generated one.
    pub fn resolve_requestor_id(&self) -> String {
        self.requestor_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_protocol_roundtrip() {
        for protocol in [WireProtocol::Line, WireProtocol::Http] {
            let parsed: WireProtocol = protocol.as_str().parse().expect("Should parse");
            assert_eq!(protocol, parsed);
        }
        assert!("smtp".parse::<WireProtocol>().is_err());
    }

    #[test]
    fn test_defaults_point_at_local_kernel() {
        let config = ClientConfig::default();
        assert_eq!(config.kernel_address().to_string(), "127.0.0.1:2005");
        assert_eq!(config.protocol, WireProtocol::Line);
        assert!(config.read_timeout().is_none());
    }

    #[test]
    fn test_generated_requestor_ids_differ() {
        let config = ClientConfig::default();
        assert_ne!(config.resolve_requestor_id(), config.resolve_requestor_id());

        let fixed = config.with_requestor_id("client-7");
        assert_eq!(fixed.resolve_requestor_id(), "client-7");
    }

    #[test]
    fn test_load_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"kernel_port": 3005, "protocol": "http", "read_timeout_ms": 1500, "reconnect_jitter": true}}"#
        )
        .unwrap();

        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.kernel_host, "127.0.0.1");
        assert_eq!(config.kernel_port, 3005);
        assert_eq!(config.protocol, WireProtocol::Http);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(1500)));
        assert!(config.reconnect_jitter);
        assert_eq!(config.reconnect_delay(), Duration::ZERO);
    }

    #[test]
    fn test_load_invalid_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            ClientConfig::from_json_file(file.path()),
            Err(AciError::Config { .. })
        ));
    }

    #[test]
    fn test_limits_are_reasonable() {
        assert!(WireConfig::MAX_ENVELOPE_SIZE > WireConfig::MAX_LINE_LENGTH);
        assert!(NetworkConfig::CONNECT_TIMEOUT > Duration::ZERO);
        assert_eq!(NetworkConfig::RECONNECT_ATTEMPTS, 2);
    }
}
