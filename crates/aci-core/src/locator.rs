//! Service references and node addresses.
//!
//! A service reference has the form `<scheme>://<instanceId>|<nodeId>|<address[:port]>`.
//! The address segment may be empty.

use crate::config::KernelConfig;
use crate::{AciError, Result};
use serde::{Deserialize, Serialize};

/// A parsed service reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub instance_id: String,
    pub node_id: String,
    pub address: Option<String>,
}

impl Locator {
    /// Parse a service reference.
    ///
    /// The scheme prefix is optional. At least the instance id and node id
    /// fields must be present and non-empty.
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let body = match trimmed.split_once("://") {
            Some((_, rest)) => rest,
            None => trimmed,
        };

        let mut fields = body.split('|');
        let instance_id = fields.next().unwrap_or_default().trim();
        let node_id = fields.next().unwrap_or_default().trim();
        if instance_id.is_empty() || node_id.is_empty() {
            return Err(AciError::MalformedReference {
                reference: reference.to_string(),
            });
        }

        let address = fields
            .next()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        Ok(Self {
            instance_id: instance_id.to_string(),
            node_id: node_id.to_string(),
            address,
        })
    }

    /// Build a reference for an instance on a node, leaving the address empty.
    pub fn format(instance_id: &str, node_id: &str) -> String {
        format!(
            "{}://{}|{}|",
            KernelConfig::REFERENCE_SCHEME,
            instance_id,
            node_id
        )
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}|{}|{}",
            KernelConfig::REFERENCE_SCHEME,
            self.instance_id,
            self.node_id,
            self.address.as_deref().unwrap_or_default()
        )
    }
}

/// Host and port of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`; the default kernel port is used when none is given.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (host, port) = match text.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| AciError::Validation {
                    field: "address".into(),
                    message: format!("invalid port in {:?}", text),
                })?;
                (host, port)
            }
            None => (text, KernelConfig::DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(AciError::Validation {
                field: "address".into(),
                message: format!("missing host in {:?}", text),
            });
        }
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
