//! TLS connector for the control connection
//!
//! The tunnel service presents a self-signed certificate that cannot be
//! validated from behind the proxy, so this connector accepts any server
//! certificate. Encryption still protects the hop past the proxy exit, but
//! the peer's identity is not checked and an active attacker at the exit can
//! intercept or modify traffic.

use super::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// TLS client that skips certificate verification
#[derive(Clone)]
pub struct InsecureTlsConnector {
    connector: TlsConnector,
    sni: String,
}

impl InsecureTlsConnector {
    /// Create a connector presenting `sni` in the ClientHello
    pub fn new(sni: impl Into<String>) -> Result<Self, TransportError> {
        let sni = sni.into();
        // Reject bad names up front rather than on every dial
        ServerName::try_from(sni.clone())
            .map_err(|e| TransportError::InvalidServerName(format!("{}: {}", sni, e)))?;

        let provider = Arc::new(ring_provider::default_provider());
        let tls_config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            sni,
        })
    }

    /// Get the SNI being used
    pub fn sni(&self) -> &str {
        &self.sni
    }

    /// Run the TLS handshake over an established byte stream
    pub async fn connect<IO>(&self, io: IO) -> Result<TlsStream<IO>, TransportError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(self.sni.clone())
            .map_err(|e| TransportError::InvalidServerName(e.to_string()))?;

        self.connector
            .connect(server_name, io)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

impl std::fmt::Debug for InsecureTlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsecureTlsConnector")
            .field("sni", &self.sni)
            .finish()
    }
}

/// Accepts every certificate; signatures are still checked against the
/// certificate the server sent.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni() {
        let connector = InsecureTlsConnector::new("tunnel.ngrok.com").unwrap();
        assert_eq!(connector.sni(), "tunnel.ngrok.com");
    }

    #[test]
    fn test_invalid_sni_rejected() {
        let result = InsecureTlsConnector::new("not a hostname!");
        assert!(matches!(result, Err(TransportError::InvalidServerName(_))));
    }
}
