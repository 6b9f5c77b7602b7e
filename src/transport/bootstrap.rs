//! Control connection bootstrap
//!
//! SOCKS5 dial to the remote, TLS on top, then the multiplexed session.
//! Proxy candidates are tried in order and the first that gets all the way
//! to a session wins.

use super::{ConnectError, InsecureTlsConnector, TransportError};
use crate::proxy::{Address, Socks5Dialer};
use crate::tunnel::MuxSession;
use tracing::{debug, info, warn};

/// Builds the multiplexed session to the tunnel service
#[derive(Debug, Clone)]
pub struct Bootstrap {
    proxies: Vec<String>,
    remote: Address,
    tls: InsecureTlsConnector,
}

impl Bootstrap {
    /// Create a bootstrap for `remote` through the ordered `proxies`
    pub fn new(
        proxies: Vec<String>,
        remote: Address,
        tls: InsecureTlsConnector,
    ) -> Self {
        Self {
            proxies,
            remote,
            tls,
        }
    }

    /// Proxy candidates in the order they are tried
    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    /// Remote control endpoint
    pub fn remote(&self) -> &Address {
        &self.remote
    }

    /// Try every candidate in order, returning the first working session
    pub async fn connect(&self) -> Result<MuxSession, ConnectError> {
        let mut attempts = Vec::with_capacity(self.proxies.len());

        for proxy in &self.proxies {
            info!("trying SOCKS5 proxy on {}...", proxy);
            match self.connect_via(proxy).await {
                Ok(session) => {
                    info!("connected to {} via {}", self.remote, proxy);
                    return Ok(session);
                }
                Err(e) => {
                    warn!("proxy {} failed: {}", proxy, e);
                    attempts.push((proxy.clone(), e));
                }
            }
        }

        Err(ConnectError::new(attempts))
    }

    /// Establish a session through a single proxy
    pub async fn connect_via(&self, proxy: &str) -> Result<MuxSession, TransportError> {
        let dialer = Socks5Dialer::new(proxy);
        let tcp = dialer.connect(&self.remote).await?;
        debug!(
            "SOCKS5 tunnel to {} via {} open, starting TLS",
            self.remote,
            dialer.proxy()
        );

        let tls = self.tls.connect(tcp).await?;
        debug!("TLS established with {}", self.tls.sni());

        Ok(MuxSession::new_client(tls))
    }
}
