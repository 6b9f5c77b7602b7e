//! Protocol definitions and constants
//!
//! Handshake requests are a 4-byte type tag followed by one JSON object;
//! responses are a single newline-terminated JSON object. Streams opened by
//! the server start with a 4-byte kind marker, and data streams follow it
//! with an 8-byte length and a JSON connection-info block.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Response line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Connection closed before a response was received")]
    EmptyResponse,
}

/// Protocol version the client speaks and expects back
pub const PROTOCOL_VERSION: &str = "2";

/// Agent version reported to the server
pub const CLIENT_VERSION: &str = "3.1.0";

/// Type tag for the authentication request
pub const AUTH_TAG: [u8; 4] = [0, 0, 0, 0];

/// Type tag for the bind request
pub const BIND_TAG: [u8; 4] = [0, 0, 0, 1];

/// Kind marker of a heartbeat stream
pub const HEARTBEAT_MARKER: [u8; 4] = [0xFF; 4];

/// Size of the length field preceding connection info
pub const INFO_LENGTH_SIZE: usize = 8;

/// Maximum handshake response line (64 KB)
pub const MAX_RESPONSE_LINE: usize = 64 * 1024;

/// Heartbeat interval announced to the server, in nanoseconds
pub const HEARTBEAT_INTERVAL_NS: u64 = 10_000_000_000;

/// Heartbeat tolerance announced to the server, in nanoseconds
pub const HEARTBEAT_TOLERANCE_NS: u64 = 15_000_000_000;

/// Authentication request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    pub version: Vec<String>,
    pub client_id: String,
    pub extra: AuthExtra,
}

/// Client identification carried in [`AuthRequest`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthExtra {
    #[serde(rename = "OS")]
    pub os: String,
    pub arch: String,
    pub authtoken: String,
    pub version: String,
    pub hostname: String,
    pub user_agent: String,
    pub metadata: String,
    pub cookie: String,
    pub heartbeat_interval: u64,
    pub heartbeat_tolerance: u64,
    pub fingerprint: Option<String>,
    pub update_unsupported_error: String,
    pub stop_unsupported_error: String,
    pub restart_unsupported_error: String,
    pub proxy_type: String,
    #[serde(rename = "MutualTLS")]
    pub mutual_tls: bool,
    pub service_run: bool,
    pub config_version: String,
    pub custom_interface: bool,
}

impl AuthRequest {
    /// Build the request the agent sends for `token`
    ///
    /// `hostname` is the control host the agent believes it is talking to.
    pub fn new(token: &str, hostname: &str) -> Self {
        Self {
            version: vec![PROTOCOL_VERSION.to_string()],
            client_id: String::new(),
            extra: AuthExtra {
                os: "windows".to_string(),
                arch: "amd64".to_string(),
                authtoken: token.to_string(),
                version: CLIENT_VERSION.to_string(),
                hostname: hostname.to_string(),
                user_agent: format!("ngrok/{}", CLIENT_VERSION),
                metadata: String::new(),
                cookie: String::new(),
                heartbeat_interval: HEARTBEAT_INTERVAL_NS,
                heartbeat_tolerance: HEARTBEAT_TOLERANCE_NS,
                fingerprint: None,
                update_unsupported_error: String::new(),
                stop_unsupported_error: String::new(),
                restart_unsupported_error:
                    "the ngrok agent does not support remote restarting on Windows".to_string(),
                proxy_type: "none".to_string(),
                mutual_tls: false,
                service_run: false,
                config_version: PROTOCOL_VERSION.to_string(),
                custom_interface: false,
            },
        }
    }
}

/// Authentication response; absent fields read as empty
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AuthResponse {
    pub version: String,
    pub client_id: String,
    pub error: String,
}

/// Bind request for a TCP tunnel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindRequest {
    pub id: String,
    pub proto: String,
    pub forwards_to: String,
    pub opts: BindOpts,
    pub extra: BindExtra,
}

/// TCP tunnel options
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindOpts {
    pub addr: String,
    pub proxy_proto: u32,
    #[serde(rename = "IPRestriction")]
    pub ip_restriction: Option<Vec<String>>,
    pub proto_middleware: bool,
    pub middleware_bytes: Option<Vec<u8>>,
}

/// Extra bind fields
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BindExtra {
    pub token: String,
    #[serde(rename = "IPPolicyRef")]
    pub ip_policy_ref: String,
    pub metadata: String,
}

impl BindRequest {
    /// Build a TCP bind forwarding to `localhost:<port>`
    pub fn tcp(port: u16) -> Self {
        Self {
            id: String::new(),
            proto: "tcp".to_string(),
            forwards_to: format!("localhost:{}", port),
            opts: BindOpts::default(),
            extra: BindExtra::default(),
        }
    }
}

/// Bind response; absent fields read as empty
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct BindResponse {
    #[serde(rename = "URL")]
    pub url: String,
    pub error: String,
}

/// Connection info preceding the payload of a data stream
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConnectionInfo {
    pub client_addr: String,
}

/// Classification of a server-opened stream by its kind marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Liveness check: echo everything back
    Heartbeat,
    /// Forwarded client connection
    Data,
}

impl StreamKind {
    /// Classify a 4-byte marker
    pub fn from_marker(marker: [u8; 4]) -> Self {
        if marker == HEARTBEAT_MARKER {
            StreamKind::Heartbeat
        } else {
            StreamKind::Data
        }
    }
}

/// Encode a request as tag followed by JSON, no trailing newline
pub fn encode_request<T: Serialize>(tag: [u8; 4], message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = tag.to_vec();
    serde_json::to_writer(&mut buf, message)?;
    Ok(buf)
}

/// Read one response line (without the newline)
///
/// A final line terminated by EOF is accepted; EOF with no bytes is not.
pub async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = MAX_RESPONSE_LINE as u64 + 1;
    let n = reader.take(limit).read_until(b'\n', &mut line).await?;

    if n == 0 {
        return Err(ProtocolError::EmptyResponse);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > MAX_RESPONSE_LINE {
        return Err(ProtocolError::LineTooLong(MAX_RESPONSE_LINE));
    }
    Ok(line)
}

/// Decode the connection-info length field
///
/// Little-endian; only the low 16 bits are read, higher bytes are ignored.
pub fn info_length(field: [u8; INFO_LENGTH_SIZE]) -> usize {
    u16::from_le_bytes([field[0], field[1]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH_JSON: &str = concat!(
        r#"{"Version":["2"],"ClientId":"","Extra":{"OS":"windows","Arch":"amd64","#,
        r#""Authtoken":"tok123","Version":"3.1.0","Hostname":"tunnel.ngrok.com","#,
        r#""UserAgent":"ngrok/3.1.0","Metadata":"","Cookie":"","#,
        r#""HeartbeatInterval":10000000000,"HeartbeatTolerance":15000000000,"#,
        r#""Fingerprint":null,"UpdateUnsupportedError":"","StopUnsupportedError":"","#,
        r#""RestartUnsupportedError":"the ngrok agent does not support remote restarting on Windows","#,
        r#""ProxyType":"none","MutualTLS":false,"ServiceRun":false,"ConfigVersion":"2","#,
        r#""CustomInterface":false}}"#
    );

    const BIND_JSON: &str = concat!(
        r#"{"Id":"","Proto":"tcp","ForwardsTo":"localhost:8080","#,
        r#""Opts":{"Addr":"","ProxyProto":0,"IPRestriction":null,"ProtoMiddleware":false,"MiddlewareBytes":null},"#,
        r#""Extra":{"Token":"","IPPolicyRef":"","Metadata":""}}"#
    );

    #[test]
    fn test_auth_request_wire_form() {
        let encoded = encode_request(AUTH_TAG, &AuthRequest::new("tok123", "tunnel.ngrok.com"))
            .unwrap();
        assert_eq!(&encoded[..4], &[0, 0, 0, 0]);
        assert_eq!(std::str::from_utf8(&encoded[4..]).unwrap(), AUTH_JSON);
    }

    #[test]
    fn test_auth_token_is_escaped() {
        let json = serde_json::to_string(&AuthRequest::new("a\"b", "h")).unwrap();
        assert!(json.contains(r#""Authtoken":"a\"b""#));
    }

    #[test]
    fn test_bind_request_wire_form() {
        let encoded = encode_request(BIND_TAG, &BindRequest::tcp(8080)).unwrap();
        assert_eq!(&encoded[..4], &[0, 0, 0, 1]);
        assert_eq!(std::str::from_utf8(&encoded[4..]).unwrap(), BIND_JSON);
    }

    #[test]
    fn test_forwards_to() {
        for port in [1u16, 22, 8080, 65535] {
            assert_eq!(BindRequest::tcp(port).forwards_to, format!("localhost:{}", port));
        }
    }

    #[test]
    fn test_responses_default_missing_fields() {
        let auth: AuthResponse = serde_json::from_str(r#"{"Version":"2"}"#).unwrap();
        assert_eq!(auth.version, "2");
        assert!(auth.error.is_empty());

        let bind: BindResponse =
            serde_json::from_str(r#"{"URL":"tcp://0.tcp.ngrok.io:1234","Extra":{}}"#).unwrap();
        assert_eq!(bind.url, "tcp://0.tcp.ngrok.io:1234");
        assert!(bind.error.is_empty());
    }

    #[test]
    fn test_stream_kind() {
        assert_eq!(StreamKind::from_marker([0xFF; 4]), StreamKind::Heartbeat);
        assert_eq!(StreamKind::from_marker([0xFF, 0xFF, 0xFF, 0xFE]), StreamKind::Data);
        assert_eq!(StreamKind::from_marker([0, 0, 0, 0]), StreamKind::Data);
    }

    #[test]
    fn test_info_length() {
        assert_eq!(info_length([0x34, 0x12, 0, 0, 0, 0, 0, 0]), 0x1234);
        assert_eq!(info_length([0xFF, 0xFF, 0, 0, 0, 0, 0, 0]), 65535);
        assert_eq!(info_length([0, 0, 1, 0, 0, 0, 0, 0]), 0);
        assert_eq!(info_length([27, 0, 1, 0, 0, 0, 0, 0]), 27);
    }

    #[tokio::test]
    async fn test_read_line() {
        let mut reader: &[u8] = b"{\"a\":1}\r\nrest";
        assert_eq!(read_line(&mut reader).await.unwrap(), b"{\"a\":1}");

        let mut unterminated: &[u8] = b"{}";
        assert_eq!(read_line(&mut unterminated).await.unwrap(), b"{}");

        let mut empty: &[u8] = b"";
        assert!(matches!(
            read_line(&mut empty).await,
            Err(ProtocolError::EmptyResponse)
        ));

        let long = vec![b'x'; MAX_RESPONSE_LINE + 10];
        let mut reader: &[u8] = &long;
        assert!(matches!(
            read_line(&mut reader).await,
            Err(ProtocolError::LineTooLong(_))
        ));
    }
}
