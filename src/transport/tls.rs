//! # TLS Transport Layer
//!
//! Optional TLS wrapping for command sessions. The packet protocol is unchanged
//! on top of it; TLS only replaces the raw TCP stream underneath.
//!
//! ## Responsibilities
//! - Load server certificates and keys from PEM files or memory
//! - Generate self-signed certificates for development and tests
//! - Build client configurations trusting an explicit certificate
//! - Run the TLS handshake on accepted and outgoing TCP streams

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument};

use crate::error::{ProtocolError, Result};

/// TLS server configuration
#[derive(Clone)]
pub struct TlsServerConfig {
    cert_chain: Vec<Certificate>,
    private_key: PrivateKey,
}

impl TlsServerConfig {
    /// Load a certificate chain and private key from PEM files
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_pem = fs::read(&cert_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
        let key_pem = fs::read(&key_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Parse a certificate chain and a PKCS#8 or RSA private key from PEM text
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain = parse_certs(&mut BufReader::new(cert_pem))?;
        let private_key = parse_private_key(key_pem)?;
        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    /// Generate a self-signed certificate for `localhost` and write it to disk.
    /// Intended for development and testing.
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let (cert_pem, key_pem) = self_signed_pem(vec!["localhost".into()])?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert_pem.as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(key_pem.as_bytes())?;

        Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// In-memory self-signed certificate for the given host names.
    ///
    /// Returns the server configuration and the certificate PEM a client
    /// should trust.
    pub fn self_signed(names: Vec<String>) -> Result<(Self, String)> {
        let (cert_pem, key_pem) = self_signed_pem(names).map_err(|e| {
            ProtocolError::TlsError(format!("Certificate generation error: {e}"))
        })?;
        let config = Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;
        Ok((config, cert_pem))
    }

    /// Build the rustls server configuration (no client certificates)
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.private_key.clone())
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

impl std::fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerConfig")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// TLS client configuration.
///
/// The client trusts exactly the certificates added to it, which suits
/// self-signed server certificates distributed out of band.
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    server_name: String,
    trusted: Vec<Certificate>,
}

impl TlsClientConfig {
    /// `server_name` is verified against the server certificate
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            trusted: Vec::new(),
        }
    }

    /// Trust the certificates in `pem`
    pub fn with_trusted_pem(mut self, pem: &[u8]) -> Result<Self> {
        let certs = parse_certs(&mut BufReader::new(pem))?;
        self.trusted.extend(certs);
        Ok(self)
    }

    /// Trust the certificates in a PEM file
    pub fn with_trusted_cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let pem = fs::read(path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
        self.with_trusted_pem(&pem)
    }

    /// Build the rustls client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        if self.trusted.is_empty() {
            return Err(ProtocolError::TlsError(
                "No trusted certificates configured".into(),
            ));
        }

        let mut root_store = RootCertStore::empty();
        for cert in &self.trusted {
            root_store.add(cert).map_err(|e| {
                ProtocolError::TlsError(format!("Failed to add cert to root store: {e}"))
            })?;
        }

        Ok(ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }
}

/// Run the server side of the TLS handshake on an accepted stream
#[instrument(skip_all)]
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<ServerTlsStream<TcpStream>> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))?;
    debug!("TLS session established");
    Ok(tls_stream)
}

/// Run the client side of the TLS handshake on a connected stream
#[instrument(skip_all, fields(server_name = %config.server_name))]
pub async fn connect(
    config: &TlsClientConfig,
    stream: TcpStream,
) -> Result<ClientTlsStream<TcpStream>> {
    let connector = config.connector()?;
    let domain = config.server_name()?;

    let tls_stream = connector
        .connect(domain, stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))?;
    debug!("TLS session established");
    Ok(tls_stream)
}

fn self_signed_pem(names: Vec<String>) -> io::Result<(String, String)> {
    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;
    Ok((cert.cert.pem(), cert.signing_key.serialize_pem()))
}

fn parse_certs(reader: &mut dyn BufRead) -> Result<Vec<Certificate>> {
    let certs = certs(reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    if certs.is_empty() {
        return Err(ProtocolError::TlsError("No certificates found".into()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKey> {
    let keys = pkcs8_private_keys(&mut BufReader::new(pem))
        .map_err(|_| ProtocolError::TlsError("Failed to parse PKCS8 private key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let keys = rsa_private_keys(&mut BufReader::new(pem))
        .map_err(|_| ProtocolError::TlsError("Failed to parse RSA private key".into()))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_config_builds() {
        let (server, cert_pem) = TlsServerConfig::self_signed(vec!["localhost".into()]).unwrap();
        assert!(server.load_server_config().is_ok());

        let client = TlsClientConfig::new("localhost")
            .with_trusted_pem(cert_pem.as_bytes())
            .unwrap();
        assert!(client.load_client_config().is_ok());
        assert!(client.server_name().is_ok());
    }

    #[test]
    fn self_signed_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");

        TlsServerConfig::generate_self_signed(&cert, &key).unwrap();
        let loaded = TlsServerConfig::from_pem_files(&cert, &key).unwrap();
        assert!(loaded.acceptor().is_ok());
        assert!(TlsClientConfig::new("localhost")
            .with_trusted_cert_file(&cert)
            .is_ok());
    }

    #[test]
    fn client_without_trust_is_rejected() {
        assert!(matches!(
            TlsClientConfig::new("localhost").load_client_config(),
            Err(ProtocolError::TlsError(_))
        ));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(TlsServerConfig::from_pem(b"not a cert", b"not a key").is_err());
    }
}
