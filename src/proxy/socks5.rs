//! SOCKS5 client implementation (RFC 1928, CONNECT with no authentication)

use super::{Address, ProxyError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Map a reply code to `Ok` or the matching error
    fn check(code: u8) -> Result<(), ProxyError> {
        match code {
            c if c == Reply::Succeeded as u8 => Ok(()),
            c if c == Reply::GeneralFailure as u8 => {
                Err(ProxyError::GeneralFailure("proxy reported general failure".to_string()))
            }
            c if c == Reply::ConnectionNotAllowed as u8 => Err(ProxyError::ConnectionNotAllowed),
            c if c == Reply::NetworkUnreachable as u8 => Err(ProxyError::NetworkUnreachable),
            c if c == Reply::HostUnreachable as u8 => Err(ProxyError::HostUnreachable),
            c if c == Reply::ConnectionRefused as u8 => Err(ProxyError::ConnectionRefused),
            c if c == Reply::TtlExpired as u8 => Err(ProxyError::TtlExpired),
            c if c == Reply::CommandNotSupported as u8 => {
                Err(ProxyError::UnsupportedCommand(Command::Connect as u8))
            }
            c if c == Reply::AddressTypeNotSupported as u8 => {
                Err(ProxyError::UnsupportedAddressType(code))
            }
            other => Err(ProxyError::GeneralFailure(format!(
                "unknown reply code {:#04x}",
                other
            ))),
        }
    }
}

/// Dials targets through one SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
}

impl Socks5Dialer {
    /// Create a dialer for the proxy at `proxy` (`host:port`)
    pub fn new(proxy: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
        }
    }

    /// Proxy address
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// Open a TCP connection to `target` through the proxy
    pub async fn connect(&self, target: &Address) -> Result<TcpStream, ProxyError> {
        let mut stream = TcpStream::connect(&self.proxy).await?;
        stream.set_nodelay(true).ok();

        debug!("SOCKS5 {} CONNECT {}", self.proxy, target);
        handshake(&mut stream, target).await?;
        Ok(stream)
    }
}

/// Run greeting and CONNECT on an already connected proxy socket
async fn handshake<S>(stream: &mut S, target: &Address) -> Result<(), ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    // Greeting: one method, no authentication
    stream
        .write_all(&[SOCKS_VERSION, 1, AuthMethod::NoAuth as u8])
        .await?;

    let mut buf = [0u8; 258];
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    match buf[1] {
        m if m == AuthMethod::NoAuth as u8 => {}
        m if m == AuthMethod::NoAcceptable as u8 => return Err(ProxyError::AuthenticationFailed),
        other => {
            return Err(ProxyError::GeneralFailure(format!(
                "proxy selected unoffered method {:#04x}",
                other
            )))
        }
    }

    stream.write_all(&make_request(target)?).await?;

    // Reply header
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    Reply::check(buf[1])?;
    // buf[2] is reserved

    // Skip the bound address
    let addr_len = match AddressType::try_from(buf[3])? {
        AddressType::Ipv4 => 4,
        AddressType::Ipv6 => 16,
        AddressType::Domain => {
            stream.read_exact(&mut buf[..1]).await?;
            buf[0] as usize
        }
    };
    stream.read_exact(&mut buf[..addr_len + 2]).await?;

    Ok(())
}

fn make_request(target: &Address) -> Result<Vec<u8>, ProxyError> {
    let mut buf = vec![SOCKS_VERSION, Command::Connect as u8, 0x00];

    match target {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| ProxyError::InvalidAddress(domain.clone()))?;
            buf.push(AddressType::Domain as u8);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    Ok(buf)
}
