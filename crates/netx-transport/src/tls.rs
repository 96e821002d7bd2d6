//! TLS transport implementation.
//!
//! - `TlsDialer`: TLS client. The handshake runs on whatever connection it is
//!   handed, so a TLS node works as the first hop and behind another node.
//! - `TlsAcceptor`: TLS server with file-based or auto-generated certs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netx_chain::{ChainError, Dialer};
use netx_core::{Conn, DEFAULT_TCP_NO_DELAY};
use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tracing::debug;

use crate::Acceptor;
use crate::error::TransportError;
use crate::tcp::connect_tcp;

/// Certificate and key PEM paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
}

// ── TLS Dialer ──

#[derive(Clone)]
pub struct TlsDialer {
    client_config: Arc<rustls::ClientConfig>,
    /// SNI value to send in the TLS ClientHello.
    sni: String,
    nodelay: bool,
    timeout: Option<Duration>,
}

impl TlsDialer {
    /// Verify the server against the bundled web PKI roots.
    pub fn new(sni: impl Into<String>) -> Self {
        Self::from_config(build_client_tls_config(), sni.into())
    }

    /// Skip certificate verification (self-signed relay nodes).
    pub fn new_insecure(sni: impl Into<String>) -> Self {
        Self::from_config(build_insecure_client_tls_config(), sni.into())
    }

    fn from_config(config: rustls::ClientConfig, sni: String) -> Self {
        Self {
            client_config: Arc::new(config),
            sni,
            nodelay: DEFAULT_TCP_NO_DELAY,
            timeout: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Bounds both the TCP connect and the handshake. Zero means none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn sni(&self) -> &str {
        &self.sni
    }
}

impl std::fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("sni", &self.sni)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &str) -> Result<Conn, ChainError> {
        connect_tcp(addr, self.nodelay, self.timeout).await
    }

    async fn handshake(&self, conn: Conn) -> Result<Conn, ChainError> {
        let server_name = ServerName::try_from(self.sni.clone())
            .map_err(|e| TransportError::Config(format!("invalid SNI: {}", e)))?;
        let local = conn.local_addr();
        let peer = conn.peer_addr();

        let connector = tokio_rustls::TlsConnector::from(self.client_config.clone());
        let handshake = connector.connect(server_name, conn);
        let tls = match self.timeout {
            Some(t) => tokio::time::timeout(t, handshake)
                .await
                .map_err(|_| ChainError::Timeout(t))?,
            None => handshake.await,
        }
        .map_err(|e| ChainError::Handshake(format!("tls: {e}")))?;
        debug!(sni = %self.sni, peer = ?peer, "tls handshake done");

        Ok(Conn::new(tls).with_local_addr(local).with_peer_addr(peer))
    }
}

// ── TLS Acceptor ──

/// Wraps incoming TCP connections in TLS.
#[derive(Clone)]
pub struct TlsAcceptor {
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Build from optional cert files. Auto-generates a self-signed cert if `None`.
    pub fn new(files: Option<&TlsFiles>) -> Result<Self, TransportError> {
        let server_config = build_server_tls_config(files)?;
        Ok(Self {
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }
}

impl Acceptor for TlsAcceptor {
    fn accept(
        &self,
        tcp: TcpStream,
    ) -> Pin<Box<dyn Future<Output = Result<Conn, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let local = tcp.local_addr().ok();
            let peer = tcp.peer_addr().ok();
            let tls = self.acceptor.accept(tcp).await.map_err(|e| {
                TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            Ok(Conn::new(tls).with_local_addr(local).with_peer_addr(peer))
        })
    }
}

// ── TLS Utility Functions ──

/// If `files` is provided, loads cert/key from them. Otherwise generates an
/// ephemeral self-signed certificate in memory.
fn build_server_tls_config(files: Option<&TlsFiles>) -> Result<rustls::ServerConfig, TransportError> {
    install_provider();
    let (certs, key) = match files {
        Some(f) => load_cert_files(&f.cert, &f.key)?,
        None => generate_self_signed()?,
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(config)
}

/// reqwest brings in ring next to aws-lc-rs; pin the process default so the
/// plain `builder()` calls below can pick one.
fn install_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn build_client_tls_config() -> rustls::ClientConfig {
    install_provider();
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn build_insecure_client_tls_config() -> rustls::ClientConfig {
    install_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TransportError::CertGeneration(e.to_string()))?;

    let params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| TransportError::CertGeneration(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::CertGeneration(e.to_string()))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

fn load_cert_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .collect();

    if certs.is_empty() {
        return Err(TransportError::Config(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let mut reader = std::io::BufReader::new(std::fs::File::open(key_path)?);
    let key = loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => break PrivateKeyDer::Pkcs8(key),
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => break PrivateKeyDer::Pkcs1(key),
            Some(rustls_pemfile::Item::Sec1Key(key)) => break PrivateKeyDer::Sec1(key),
            Some(_) => continue,
            None => {
                return Err(TransportError::Config(format!(
                    "no private key found in {}",
                    key_path
                )));
            }
        }
    };

    Ok((certs, key))
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
