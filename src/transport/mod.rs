//! Transport layer implementations
//!
//! Provides:
//! - TLS connector for the control connection (certificate checks disabled)
//! - Bootstrap: SOCKS5 dial, TLS, multiplexed session, with ordered
//!   proxy fallback

#[cfg(feature = "tls")]
mod tls;

#[cfg(all(feature = "tls", feature = "socks5"))]
mod bootstrap;

#[cfg(feature = "tls")]
pub use tls::InsecureTlsConnector;

#[cfg(all(feature = "tls", feature = "socks5"))]
pub use bootstrap::Bootstrap;

use crate::proxy::ProxyError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Every proxy candidate failed
#[derive(Debug)]
pub struct ConnectError {
    attempts: Vec<(String, TransportError)>,
}

impl ConnectError {
    /// Wrap the per-candidate failures, in the order they were tried
    pub fn new(attempts: Vec<(String, TransportError)>) -> Self {
        Self { attempts }
    }

    /// Candidate addresses with their failure
    pub fn attempts(&self) -> &[(String, TransportError)] {
        &self.attempts
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no proxy candidates configured");
        }
        write!(f, "all proxy candidates failed")?;
        for (proxy, error) in &self.attempts {
            write!(f, "; {}: {}", proxy, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.attempts
            .last()
            .map(|(_, e)| e as &(dyn std::error::Error + 'static))
    }
}
