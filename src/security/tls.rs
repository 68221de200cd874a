//! # Asymmetric (TLS) Stream Wrapping
//!
//! Wraps a raw TCP stream in certificate-based trust for sessions configured
//! with `SecuritySpec::Asymmetric`.
//!
//! Trust is explicit: the connecting side verifies the peer against the
//! certificate material the config provides — there is no fallback to system
//! roots. When `expected_peer_name` is configured the presented certificate
//! must verify for exactly that name or the handshake fails closed with a
//! `Security` error, fatal to that connection but not to the session.
//!
//! ## Responsibilities
//! - Load PEM certificate/key material from files or bytes
//! - Build the acceptor (listen side) and connector (connect side)
//! - Produce a `SecureStream` usable under the frame codec either way

use std::io::{self, BufReader, Cursor, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, instrument};

use crate::error::{CommError, Result};
use crate::security::{CertificateSource, SecuritySpec};

/// A transport stream, plaintext or TLS-wrapped, under one type
pub enum SecureStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecureStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SecureStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Read the raw PEM bytes behind a certificate source's cert component
fn cert_pem_bytes(source: &CertificateSource) -> Result<Vec<u8>> {
    match source {
        CertificateSource::PemFile { cert_path, .. } => {
            let mut file = std::fs::File::open(cert_path).map_err(|e| {
                CommError::Security(format!("Failed to open cert file '{cert_path}': {e}"))
            })?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(|e| {
                CommError::Security(format!("Failed to read cert file '{cert_path}': {e}"))
            })?;
            Ok(buf)
        }
        CertificateSource::PemBytes { cert, .. } => Ok(cert.clone()),
    }
}

/// Read the raw PEM bytes behind a source's private key component
fn key_pem_bytes(source: &CertificateSource) -> Result<Vec<u8>> {
    match source {
        CertificateSource::PemFile { key_path, .. } => {
            let key_path = key_path.as_ref().ok_or_else(|| {
                CommError::Security("Certificate source has no private key path".into())
            })?;
            let mut file = std::fs::File::open(key_path).map_err(|e| {
                CommError::Security(format!("Failed to open key file '{key_path}': {e}"))
            })?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(|e| {
                CommError::Security(format!("Failed to read key file '{key_path}': {e}"))
            })?;
            Ok(buf)
        }
        CertificateSource::PemBytes { key, .. } => key
            .clone()
            .ok_or_else(|| CommError::Security("Certificate source has no private key".into())),
    }
}

/// Parse every certificate in the source's PEM material
pub fn load_certs(source: &CertificateSource) -> Result<Vec<Certificate>> {
    let pem = cert_pem_bytes(source)?;
    let mut reader = BufReader::new(Cursor::new(pem));
    let parsed = certs(&mut reader)
        .map_err(|_| CommError::Security("Failed to parse certificate PEM".into()))?;

    if parsed.is_empty() {
        return Err(CommError::Security(
            "No certificates found in PEM material".into(),
        ));
    }

    Ok(parsed.into_iter().map(Certificate).collect())
}

/// Parse the private key from the source's PEM material (PKCS#8, then RSA)
pub fn load_private_key(source: &CertificateSource) -> Result<PrivateKey> {
    let pem = key_pem_bytes(source)?;

    let mut reader = BufReader::new(Cursor::new(pem.clone()));
    let keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| CommError::Security("Failed to parse PKCS8 private key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let mut reader = BufReader::new(Cursor::new(pem));
    let keys = rsa_private_keys(&mut reader)
        .map_err(|_| CommError::Security("Failed to parse RSA private key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    Err(CommError::Security(
        "No supported private key format found".into(),
    ))
}

/// Build the acceptor for a listen-side asymmetric session.
///
/// Returns `None` for non-asymmetric specs so callers can thread it through
/// unconditionally.
pub fn acceptor_for(spec: &SecuritySpec) -> Result<Option<TlsAcceptor>> {
    let SecuritySpec::Asymmetric { identity, .. } = spec else {
        return Ok(None);
    };

    let identity = identity.as_ref().ok_or_else(|| {
        CommError::Security("Accepting asymmetric connections requires an identity".into())
    })?;

    let cert_chain = load_certs(identity)?;
    let private_key = load_private_key(identity)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| CommError::Security(format!("TLS server config error: {e}")))?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Build the connector + server name for a connect-side asymmetric session.
fn connector_for(
    peer_trust: &Option<CertificateSource>,
    expected_peer_name: &Option<String>,
    fallback_host: &str,
) -> Result<(TlsConnector, ServerName)> {
    let trust = peer_trust.as_ref().ok_or_else(|| {
        CommError::Security(
            "Originating asymmetric connections requires a trusted peer certificate".into(),
        )
    })?;

    let mut root_store = RootCertStore::empty();
    for cert in load_certs(trust)? {
        root_store
            .add(&cert)
            .map_err(|e| CommError::Security(format!("Failed to add trust anchor: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let name = expected_peer_name.as_deref().unwrap_or(fallback_host);
    let server_name = ServerName::try_from(name)
        .map_err(|_| CommError::Security(format!("Invalid peer name '{name}'")))?;

    Ok((TlsConnector::from(Arc::new(config)), server_name))
}

/// Wrap an outbound stream per the session's security spec.
///
/// Name verification is rustls's: the peer certificate must verify for the
/// expected peer name (or the endpoint host when none is configured), else
/// the handshake fails closed.
#[instrument(skip(stream, spec), fields(host = %fallback_host))]
pub async fn wrap_outbound(
    stream: TcpStream,
    spec: &SecuritySpec,
    fallback_host: &str,
) -> Result<SecureStream> {
    match spec {
        SecuritySpec::Asymmetric {
            peer_trust,
            expected_peer_name,
            ..
        } => {
            let (connector, server_name) =
                connector_for(peer_trust, expected_peer_name, fallback_host)?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| CommError::Security(format!("TLS handshake failed: {e}")))?;
            debug!("Outbound TLS handshake complete");
            Ok(SecureStream::Tls(Box::new(TlsStream::Client(tls))))
        }
        _ => Ok(SecureStream::Plain(stream)),
    }
}

/// Wrap an accepted stream with the session's acceptor, if any.
#[instrument(skip(stream, acceptor))]
pub async fn wrap_inbound(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> Result<SecureStream> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| CommError::Security(format!("TLS accept failed: {e}")))?;
            debug!("Inbound TLS handshake complete");
            Ok(SecureStream::Tls(Box::new(TlsStream::Server(tls))))
        }
        None => Ok(SecureStream::Plain(stream)),
    }
}
