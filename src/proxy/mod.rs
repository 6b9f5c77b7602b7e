//! Proxy implementations
//!
//! Provides:
//! - SOCKS5 client dialer (CONNECT through Tor or any RFC 1928 proxy)

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Dialer;

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Connection not allowed by ruleset")]
    ConnectionNotAllowed,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("TTL expired")]
    TtlExpired,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`
    ///
    /// Domain names are kept unresolved so the proxy does the lookup.
    pub fn parse(addr: &str) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(addr.to_string());

        if let Some(rest) = addr.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            let ip: Ipv6Addr = host.parse().map_err(|_| invalid())?;
            let port: u16 = port.parse().map_err(|_| invalid())?;
            return Ok(Address::Ipv6(ip.octets(), port));
        }

        let (host, port) = addr.split_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        if host.is_empty() || host.len() > 255 {
            return Err(invalid());
        }
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(ip.octets(), port));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without the port (no brackets for IPv6)
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Ipv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain() {
        let addr = Address::parse("tunnel.ngrok.com:443").unwrap();
        assert_eq!(addr, Address::Domain("tunnel.ngrok.com".to_string(), 443));
        assert_eq!(addr.host(), "tunnel.ngrok.com");
        assert_eq!(addr.to_string(), "tunnel.ngrok.com:443");
    }

    #[test]
    fn test_parse_ip_literals() {
        assert_eq!(
            Address::parse("127.0.0.1:9050").unwrap(),
            Address::Ipv4([127, 0, 0, 1], 9050)
        );

        let v6 = Address::parse("[::1]:9150").unwrap();
        assert_eq!(v6.port(), 9150);
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:9150");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "no-port", "host:", ":80", "host:http", "::1:80", "[::1]"] {
            assert!(Address::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }
}
