//! Pluggable byte-stream transports.
//!
//! The engine consumes transports through the [`Connector`] trait: one
//! async `connect` producing a boxed duplex byte stream. Plain TCP and
//! rustls-backed TLS connectors are provided; tests inject scripted
//! in-memory transports through the same seam.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector as RustlsConnector;

use crate::config::TlsOptions;
use crate::error::TransportError;

/// A connected duplex byte stream.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// A freshly established connection.
pub struct Connected {
    pub stream: Box<dyn TransportStream>,
    /// Human-readable endpoint description, e.g. `127.0.0.1:1883`.
    pub peer: String,
}

/// Transport factory: one `connect` call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connected, TransportError>;
}

/// Plain TCP transport.
pub struct TcpConnector {
    address: String,
    connect_timeout: std::time::Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: std::time::Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }

    pub(crate) async fn open(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::from_io(&e))?;
        // Small control packets should not sit in Nagle buffers
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Connected, TransportError> {
        let stream = self.open().await?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.address.clone());
        Ok(Connected {
            stream: Box::new(stream),
            peer,
        })
    }
}

/// TLS transport over TCP using rustls.
pub struct TlsTransportConnector {
    tcp: TcpConnector,
    options: TlsOptions,
    server_name: ServerName<'static>,
    connector: RustlsConnector,
}

impl TlsTransportConnector {
    pub fn new(
        address: impl Into<String>,
        connect_timeout: std::time::Duration,
        options: TlsOptions,
    ) -> Result<Self, TransportError> {
        let address = address.into();
        let hostname = options
            .server_name
            .clone()
            .unwrap_or_else(|| address.split(':').next().unwrap_or("localhost").to_string());
        let server_name = ServerName::try_from(hostname.clone()).map_err(|_| TransportError::Tls {
            detail: format!("Invalid server name: {}", hostname),
            fatal: true,
        })?;

        let tls_config = build_tls_config(&options)?;
        Ok(Self {
            tcp: TcpConnector::new(address, connect_timeout),
            options,
            server_name,
            connector: RustlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// The options this connector was built from.
    pub fn options(&self) -> &TlsOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for TlsTransportConnector {
    async fn connect(&self) -> Result<Connected, TransportError> {
        let tcp_stream = self.tcp.open().await?;
        let peer = tcp_stream
            .peer_addr()
            .map(|a| format!("tls:{}", a))
            .unwrap_or_else(|_| "tls".to_string());

        let tls_stream = tokio::time::timeout(
            self.tcp.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(classify_tls_error)?;

        Ok(Connected {
            stream: Box::new(tls_stream),
            peer,
        })
    }
}

/// Classify a TLS handshake error: certificate-trust failures are fatal,
/// everything else is retried with backoff.
fn classify_tls_error(err: io::Error) -> TransportError {
    let fatal = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| {
            matches!(
                e,
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented
            )
        });
    TransportError::Tls {
        detail: err.to_string(),
        fatal,
    }
}

/// Build a rustls ClientConfig from the TLS options.
fn build_tls_config(options: &TlsOptions) -> Result<rustls::ClientConfig, TransportError> {
    let tls_err = |detail: String| TransportError::Tls {
        detail,
        fatal: true,
    };

    // Insecure mode: accept any certificate
    if options.accept_invalid_certs {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();
        return Ok(config);
    }

    let mut root_store = rustls::RootCertStore::empty();
    if let Some(ca_path) = &options.ca_cert {
        let file = File::open(ca_path)
            .map_err(|e| tls_err(format!("Failed to open CA cert: {}", e)))?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_err(format!("Failed to parse CA cert: {}", e)))?;
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| tls_err(format!("Failed to add CA cert: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    // Client certificate for mutual TLS if provided
    let config = if let (Some(cert_path), Some(key_path)) =
        (&options.client_cert, &options.client_key)
    {
        let cert_file = File::open(cert_path)
            .map_err(|e| tls_err(format!("Failed to open client cert: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_err(format!("Failed to parse client cert: {}", e)))?;

        let key_file = File::open(key_path)
            .map_err(|e| tls_err(format!("Failed to open client key: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| tls_err(format!("Failed to parse client key: {}", e)))?
            .ok_or_else(|| tls_err("No private key found in file".to_string()))?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_err(format!("Failed to configure client auth: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(config)
}

/// Danger: a certificate verifier that accepts any certificate.
/// Only for testing with self-signed certificates.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
