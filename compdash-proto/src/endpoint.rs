//! `host:port` endpoint strings, as entered by users and as persisted.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The port every agent tries first; also the default when an endpoint
/// string carries no port.
pub const DEFAULT_AGENT_PORT: u16 = 49990;

/// A reachable agent address. Hosts are names or IPv4 literals; IPv6 is not
/// supported on this protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("endpoint has an empty host")]
    EmptyHost,
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
    #[error("IPv6 literals are not supported: `{0}`")]
    Ipv6Unsupported(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// An endpoint on the default agent port.
    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_AGENT_PORT)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.contains(':') || host.starts_with('[') {
                    return Err(EndpointParseError::Ipv6Unsupported(s.to_string()));
                }
                let port: u16 = port
                    .parse()
                    .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
                if port == 0 {
                    return Err(EndpointParseError::InvalidPort(s.to_string()));
                }
                (host, port)
            }
            None => (s, DEFAULT_AGENT_PORT),
        };

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }

        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
