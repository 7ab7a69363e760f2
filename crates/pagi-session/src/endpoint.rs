//! Gateway endpoint description (discovered or entered manually).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default gateway port.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Where an endpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    Discovered,
    #[default]
    Manual,
}

/// Immutable gateway address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub use_encrypted_transport: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub source: EndpointSource,
}

fn default_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

impl GatewayEndpoint {
    /// Manually entered endpoint.
    pub fn manual(host: impl Into<String>, port: u16, use_encrypted_transport: bool) -> Self {
        let host = host.into();
        Self {
            label: format!("{}:{}", host, port),
            host,
            port,
            use_encrypted_transport,
            source: EndpointSource::Manual,
        }
    }

    /// `ws://host:port` or `wss://host:port`; IPv6 literals are bracketed.
    pub fn url(&self) -> String {
        let scheme = if self.use_encrypted_transport { "wss" } else { "ws" };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}", self.url())
        } else {
            write!(f, "{} ({})", self.label, self.url())
        }
    }
}
