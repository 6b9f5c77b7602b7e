//! # ngtor
//!
//! Exposes a local TCP service through an ngrok tunnel, reaching the
//! tunnel service over Tor (or any SOCKS5 proxy).
//!
//! ## Features
//!
//! - **SOCKS5 bootstrap** with ordered proxy fallback (Tor, then Tor Browser)
//! - **TLS** to the control endpoint (the service certificate is not verified)
//! - **Multiplexed session** speaking the muxado framing
//! - **Handshake** (authenticate, bind) and a heartbeat-aware accept loop
//! - **Relay** of each forwarded connection to the local service
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Client Layer                       │
//! │   (auth/bind handshake, accept loop, relay tasks)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │            (Multiple streams, flow control)          │
//! ├─────────────────────────────────────────────────────┤
//! │                   TLS Layer                          │
//! │        (rustls, certificate checks disabled)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Proxy Layer                         │
//! │              (SOCKS5 CONNECT via Tor)                │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use client::{Client, OriginAddress};
pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Connect error: {0}")]
    Connect(#[from] transport::ConnectError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),
}
