//! Multiaddr resolution
//!
//! Turns the daemon's `/ip4/<host>/tcp/<port>` style addresses into host and
//! port pairs a client can dial.

use multiaddr::{Multiaddr, Protocol};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Address resolution errors
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("invalid multiaddr {addr:?}: {source}")]
    Parse {
        addr: String,
        #[source]
        source: multiaddr::Error,
    },

    #[error("multiaddr {0} has no ip or dns component")]
    MissingHost(String),

    #[error("multiaddr {0} has no tcp component")]
    MissingTcpPort(String),
}

/// Dialable host and TCP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a textual multiaddr
    pub fn parse(addr: &str) -> Result<Self, AddrError> {
        let multiaddr: Multiaddr = addr.trim().parse().map_err(|source| AddrError::Parse {
            addr: addr.to_string(),
            source,
        })?;
        Self::from_multiaddr(&multiaddr)
    }

    /// Resolve a multiaddr. Unspecified bind hosts map to loopback.
    pub fn from_multiaddr(addr: &Multiaddr) -> Result<Self, AddrError> {
        let mut host = None;
        let mut port = None;

        for proto in addr.iter() {
            match proto {
                Protocol::Ip4(ip) => host = Some(dialable(IpAddr::V4(ip)).to_string()),
                Protocol::Ip6(ip) => host = Some(dialable(IpAddr::V6(ip)).to_string()),
                Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                    host = Some(name.to_string())
                }
                Protocol::Tcp(p) => port = Some(p),
                _ => continue,
            }
        }

        let host = host.ok_or_else(|| AddrError::MissingHost(addr.to_string()))?;
        let port = port.ok_or_else(|| AddrError::MissingTcpPort(addr.to_string()))?;
        Ok(Self { host, port })
    }

    /// Authority for URLs, with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn dialable(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}
