//! Client TLS connectors.
//!
//! # Design Decisions
//! - Three connectors: modern with h2 ALPN, modern HTTP/1-only, legacy
//! - "Legacy" is a TLS 1.2-only connector; hosts that fail modern
//!   negotiation are remembered and go straight to it afterwards
//! - rustls has no TLS 1.0/1.1, so the downgrade only helps servers that
//!   mishandle a TLS 1.3 offer; TLS 1.0/1.1-only servers stay unreachable
//! - Certificate checks can be disabled, as test targets commonly use
//!   self-signed certificates

use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{AlertDescription, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::transport::error::TransportError;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS 1.3/1.2, offering h2.
    ModernH2,
    /// TLS 1.3/1.2, HTTP/1.1 only.
    ModernHttp1,
    /// TLS 1.2 only, HTTP/1.1 only.
    Legacy,
}

pub struct TlsConnectors {
    modern_h2: TlsConnector,
    modern_http1: TlsConnector,
    legacy: TlsConnector,
}

impl TlsConnectors {
    pub fn new(ignore_certificate_errors: bool) -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let build = |versions: &[&'static rustls::SupportedProtocolVersion], alpn: &[&[u8]]| {
            client_config(Arc::clone(&provider), versions, alpn, ignore_certificate_errors)
                .map(|config| TlsConnector::from(Arc::new(config)))
        };

        Ok(Self {
            modern_h2: build(rustls::ALL_VERSIONS, &[ALPN_H2, ALPN_HTTP1])?,
            modern_http1: build(rustls::ALL_VERSIONS, &[ALPN_HTTP1])?,
            legacy: build(&[&rustls::version::TLS12], &[ALPN_HTTP1])?,
        })
    }

    /// Handshake over `stream`. Returns the stream and whether h2 was
    /// negotiated.
    pub async fn connect(
        &self,
        mode: TlsMode,
        host: &str,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, bool), TlsFailure> {
        let connector = match mode {
            TlsMode::ModernH2 => &self.modern_h2,
            TlsMode::ModernHttp1 => &self.modern_http1,
            TlsMode::Legacy => &self.legacy,
        };
        let server_name = ServerName::try_from(host.to_string()).map_err(|err| TlsFailure::Other(TransportError::Tls {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, err),
        }))?;

        match connector.connect(server_name, stream).await {
            Ok(tls) => {
                let h2 = tls.get_ref().1.alpn_protocol() == Some(ALPN_H2);
                Ok((tls, h2))
            }
            Err(source) => {
                let negotiation = mode != TlsMode::Legacy && is_negotiation_failure(&source);
                let err = TransportError::Tls {
                    host: host.to_string(),
                    source,
                };
                Err(if negotiation {
                    TlsFailure::Negotiation(err)
                } else {
                    TlsFailure::Other(err)
                })
            }
        }
    }
}

#[derive(Debug)]
pub enum TlsFailure {
    /// Protocol/cipher mismatch; worth retrying with the legacy connector.
    Negotiation(TransportError),
    Other(TransportError),
}

fn client_config(
    provider: Arc<CryptoProvider>,
    versions: &[&'static rustls::SupportedProtocolVersion],
    alpn: &[&[u8]],
    ignore_certificate_errors: bool,
) -> Result<ClientConfig, rustls::Error> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider)).with_protocol_versions(versions)?;

    let mut config = if ignore_certificate_errors {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Whether a handshake error means the peer rejected our protocol
/// offer rather than the connection failing outright.
pub fn is_negotiation_failure(err: &io::Error) -> bool {
    if let Some(tls) = err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return matches!(
            tls,
            rustls::Error::PeerIncompatible(_)
                | rustls::Error::AlertReceived(
                    AlertDescription::HandshakeFailure
                        | AlertDescription::ProtocolVersion
                        | AlertDescription::InsufficientSecurity
                        | AlertDescription::IllegalParameter
                )
        );
    }
    // Servers that only speak old protocols often just hang up on a modern
    // ClientHello.
    matches!(err.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset)
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
