//! Tunnel client: handshake, accept loop and stream classification
//!
//! The client runs on any [`Session`]. The handshake is strictly ordered
//! (authenticate, then bind) and every server-opened stream is classified by
//! its kind marker: heartbeats are echoed in the background and never
//! returned, data streams are returned with the address of the remote peer.

use crate::protocol::{
    self, AuthRequest, AuthResponse, BindRequest, BindResponse, ConnectionInfo, ProtocolError,
    StreamKind, AUTH_TAG, BIND_TAG, INFO_LENGTH_SIZE, PROTOCOL_VERSION,
};
use crate::relay::{relay, RelayError};
use crate::tunnel::{Session, TunnelError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Control host reported in the auth request by default
pub const DEFAULT_HOSTNAME: &str = "tunnel.ngrok.com";

/// Authentication failures
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("couldn't open auth stream: {0}")]
    Open(#[source] TunnelError),

    #[error("couldn't send auth request: {0}")]
    Send(#[source] ProtocolError),

    #[error("couldn't get auth response: {0}")]
    Response(#[source] ProtocolError),

    #[error("client version is {expected}, server reported version {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("server returned error when authenticating: {0}")]
    Rejected(String),
}

/// Bind failures
#[derive(Debug, Error)]
pub enum BindError {
    #[error("couldn't open bind stream: {0}")]
    Open(#[source] TunnelError),

    #[error("couldn't send bind request: {0}")]
    Send(#[source] ProtocolError),

    #[error("couldn't get bind response: {0}")]
    Response(#[source] ProtocolError),

    #[error("server returned error when binding: {0}")]
    Rejected(String),
}

/// The session itself failed; no further streams will arrive
#[derive(Debug, Error)]
#[error("can't accept from session: {0}")]
pub struct AcceptError(#[from] pub TunnelError);

/// A data stream carried malformed connection info
#[derive(Debug, Error)]
pub enum InfoParseError {
    #[error("can't read stream kind from server: {0}")]
    Kind(#[source] std::io::Error),

    #[error("could not read info length: {0}")]
    Length(#[source] std::io::Error),

    #[error("could not read info: {0}")]
    Info(#[source] std::io::Error),

    #[error("could not parse info: {0}")]
    Json(#[source] serde_json::Error),

    #[error("info has no client address")]
    EmptyAddress,

    #[error("could not parse addr: {0}")]
    Address(String),

    #[error("could not parse port: {0}")]
    Port(String),
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("auth failed: {0}")]
    Auth(#[from] AuthError),

    #[error("bind failed: {0}")]
    Bind(#[from] BindError),

    #[error(transparent)]
    Accept(#[from] AcceptError),

    #[error(transparent)]
    InfoParse(#[from] InfoParseError),

    #[error("{step} attempted while {state}")]
    OutOfOrder {
        step: &'static str,
        state: HandshakeState,
    },
}

/// Progress through the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Session is up, nothing exchanged yet
    Connected,
    /// Auth accepted by the server
    Authenticated,
    /// Tunnel bound; streams may be accepted
    Bound,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Connected => write!(f, "not authenticated"),
            HandshakeState::Authenticated => write!(f, "authenticated but not bound"),
            HandshakeState::Bound => write!(f, "already bound"),
        }
    }
}

/// Address of the remote peer behind a forwarded connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginAddress {
    pub host: String,
    pub port: u16,
}

impl OriginAddress {
    /// Parse the `ClientAddr` string sent by the server
    ///
    /// `[v6]:port` is accepted; otherwise, after stripping brackets, the
    /// value must split on `:` into exactly a host and a numeric port.
    /// The port must fit in 16 bits, so `host:70000` fails with `Port`.
    pub fn parse(addr: &str) -> Result<Self, InfoParseError> {
        if addr.is_empty() {
            return Err(InfoParseError::EmptyAddress);
        }

        let (host, port) = match addr.strip_prefix('[').and_then(|s| s.split_once("]:")) {
            Some(parts) => parts,
            None => {
                let trimmed = addr.trim_matches(|c| c == '[' || c == ']');
                let mut parts = trimmed.split(':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(host), Some(port), None) => (host, port),
                    _ => return Err(InfoParseError::Address(trimmed.to_string())),
                }
            }
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| InfoParseError::Port(port.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for OriginAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Read the length-prefixed connection info of a data stream
pub async fn read_info<R>(stream: &mut R) -> Result<OriginAddress, InfoParseError>
where
    R: AsyncRead + Unpin,
{
    let mut length = [0u8; INFO_LENGTH_SIZE];
    stream
        .read_exact(&mut length)
        .await
        .map_err(InfoParseError::Length)?;

    let mut body = vec![0u8; protocol::info_length(length)];
    stream
        .read_exact(&mut body)
        .await
        .map_err(InfoParseError::Info)?;

    let info: ConnectionInfo = serde_json::from_slice(&body).map_err(InfoParseError::Json)?;
    OriginAddress::parse(&info.client_addr)
}

/// Handshake failure before it is attributed to auth or bind
enum ExchangeError {
    Open(TunnelError),
    Send(ProtocolError),
    Response(ProtocolError),
}

impl From<ExchangeError> for AuthError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Open(e) => AuthError::Open(e),
            ExchangeError::Send(e) => AuthError::Send(e),
            ExchangeError::Response(e) => AuthError::Response(e),
        }
    }
}

impl From<ExchangeError> for BindError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Open(e) => BindError::Open(e),
            ExchangeError::Send(e) => BindError::Send(e),
            ExchangeError::Response(e) => BindError::Response(e),
        }
    }
}

/// Protocol client over a multiplexed session
pub struct Client<S: Session> {
    session: S,
    token: String,
    hostname: String,
    state: HandshakeState,
    client_id: Option<String>,
    url: Option<String>,
}

impl<S: Session> Client<S> {
    /// Wrap an established session
    pub fn new(session: S, token: impl Into<String>) -> Self {
        Self {
            session,
            token: token.into(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            state: HandshakeState::Connected,
            client_id: None,
            url: None,
        }
    }

    /// Report `hostname` as the control host in the auth request
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Get the underlying session
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Get current handshake state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Client id assigned by the server, once authenticated
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Public URL of the tunnel, once bound
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn require(&self, step: &'static str, state: HandshakeState) -> Result<(), ClientError> {
        if self.state != state {
            return Err(ClientError::OutOfOrder {
                step,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Authenticate with the token
    pub async fn authenticate(&mut self) -> Result<(), ClientError> {
        self.require("authenticate", HandshakeState::Connected)?;

        let request = AuthRequest::new(&self.token, &self.hostname);
        let line = self
            .exchange(AUTH_TAG, &request)
            .await
            .map_err(AuthError::from)?;
        let response: AuthResponse = serde_json::from_slice(&line)
            .map_err(|e| AuthError::Response(ProtocolError::Json(e)))?;

        if response.version != PROTOCOL_VERSION {
            return Err(AuthError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: response.version,
            }
            .into());
        }
        if !response.error.is_empty() {
            return Err(AuthError::Rejected(response.error).into());
        }

        info!("authenticated (client id {:?})", response.client_id);
        self.client_id = Some(response.client_id);
        self.state = HandshakeState::Authenticated;
        Ok(())
    }

    /// Bind a TCP tunnel forwarding to `localhost:<port>`, returning its URL
    pub async fn bind(&mut self, port: u16) -> Result<String, ClientError> {
        self.require("bind", HandshakeState::Authenticated)?;

        let line = self
            .exchange(BIND_TAG, &BindRequest::tcp(port))
            .await
            .map_err(BindError::from)?;
        let response: BindResponse = serde_json::from_slice(&line)
            .map_err(|e| BindError::Response(ProtocolError::Json(e)))?;

        if !response.error.is_empty() {
            return Err(BindError::Rejected(response.error).into());
        }

        info!("bound {} --> localhost:{}", response.url, port);
        self.url = Some(response.url.clone());
        self.state = HandshakeState::Bound;
        Ok(response.url)
    }

    /// One request/response on a fresh stream, closed afterwards
    async fn exchange<T: Serialize>(
        &self,
        tag: [u8; 4],
        message: &T,
    ) -> Result<Vec<u8>, ExchangeError> {
        let mut stream = self.session.open().await.map_err(ExchangeError::Open)?;

        let request = protocol::encode_request(tag, message).map_err(ExchangeError::Send)?;
        stream
            .write_all(&request)
            .await
            .map_err(|e| ExchangeError::Send(e.into()))?;
        stream
            .flush()
            .await
            .map_err(|e| ExchangeError::Send(e.into()))?;

        let line = protocol::read_line(&mut BufReader::new(&mut stream))
            .await
            .map_err(ExchangeError::Response)?;

        stream.shutdown().await.ok();
        Ok(line)
    }

    /// Wait for the next forwarded connection
    ///
    /// Heartbeat streams are echoed on a background task and skipped.
    /// A malformed data stream fails only this call with `InfoParse`;
    /// `Accept` means the session is gone.
    pub async fn accept(&self) -> Result<(S::Stream, OriginAddress), ClientError> {
        self.require("accept", HandshakeState::Bound)?;

        loop {
            let mut stream = self.session.accept().await.map_err(AcceptError)?;

            let mut marker = [0u8; 4];
            stream
                .read_exact(&mut marker)
                .await
                .map_err(InfoParseError::Kind)?;

            match StreamKind::from_marker(marker) {
                StreamKind::Heartbeat => {
                    debug!("heartbeat stream, echoing");
                    tokio::spawn(echo(stream));
                }
                StreamKind::Data => {
                    let origin = read_info(&mut stream).await?;
                    return Ok((stream, origin));
                }
            }
        }
    }

    /// Accept connections forever, relaying each to `upstream`
    ///
    /// Returns only when the session fails.
    pub async fn serve(&self, upstream: &str) -> Result<(), ClientError> {
        loop {
            let (stream, origin) = match self.accept().await {
                Ok(accepted) => accepted,
                Err(ClientError::InfoParse(e)) => {
                    warn!("dropping malformed stream: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            info!("accepted connection from {}", origin);
            let upstream = upstream.to_string();
            tokio::spawn(async move {
                match relay(stream, &upstream).await {
                    Ok(()) => debug!("connection from {} closed", origin),
                    Err(e @ RelayError::Dial { .. }) => warn!("{}", e),
                    Err(e) => debug!("connection from {} ended: {}", origin, e),
                }
            });
        }
    }
}

/// Echo a heartbeat stream back to the server until it closes
async fn echo<T>(stream: T)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        debug!("heartbeat echo ended: {}", e);
    }
    writer.shutdown().await.ok();
}
