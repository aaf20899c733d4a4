//! QUIC transport configuration

use portmux_proto::ALPN_PROTOCOL;
use portmux_transport::{TransportError, TransportResult};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Where a server gets its TLS identity from
#[derive(Debug, Clone)]
pub enum ServerIdentity {
    /// PEM certificate chain and private key on disk
    Files { cert_path: PathBuf, key_path: PathBuf },

    /// Ephemeral self-signed certificate generated at startup
    SelfSigned { names: Vec<String> },
}

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Verify the server certificate against the root store
    pub verify_server_cert: bool,

    /// Extra trusted roots (DER); empty means the webpki roots
    pub root_certs: Vec<Vec<u8>>,

    /// ALPN protocols offered / accepted
    pub alpn_protocols: Vec<String>,

    /// Server identity (servers only)
    pub identity: Option<ServerIdentity>,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams, i.e. live channels
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    /// Create a client configuration with defaults
    ///
    /// Uses the webpki root CAs for certificate verification.
    pub fn client_default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec![ALPN_PROTOCOL.to_string()],
            identity: None,
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 1000,
        }
    }

    /// Client configuration that skips certificate verification
    ///
    /// Needed to talk to peers running with a self-signed certificate.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Server configuration with certificate files
    pub fn server_default(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            identity: Some(ServerIdentity::Files {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            }),
            ..Self::client_default()
        }
    }

    /// Server configuration with a freshly generated self-signed certificate
    pub fn server_self_signed(names: Vec<String>) -> Self {
        Self {
            identity: Some(ServerIdentity::SelfSigned { names }),
            ..Self::client_default()
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.as_secs() == 0 {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "At least one concurrent stream is required".to_string(),
            ));
        }

        Ok(())
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| TransportError::ConfigurationError(format!("Idle timeout: {}", e)))?;
        let streams = quinn::VarInt::try_from(self.max_concurrent_streams).map_err(|e| {
            TransportError::ConfigurationError(format!("Max concurrent streams: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        // Channels are bidirectional only.
        transport.max_concurrent_uni_streams(0u32.into());

        Ok(transport)
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        crate::ensure_crypto_provider();

        let builder = rustls::ClientConfig::builder();
        let mut crypto = if self.verify_server_cert {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AnyServerCert::new()))
                .with_no_client_auth()
        };
        crypto.alpn_protocols = self.alpn();

        let crypto = QuicClientConfig::try_from(crypto).map_err(tls_error)?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport_config()?));
        Ok(config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        crate::ensure_crypto_provider();

        let (chain, key) = match &self.identity {
            Some(ServerIdentity::Files {
                cert_path,
                key_path,
            }) => load_identity(cert_path, key_path)?,
            Some(ServerIdentity::SelfSigned { names }) => {
                let cert = portmux_cert::generate_self_signed_cert_for(names)
                    .map_err(|e| TransportError::TlsError(format!("Self-signed cert: {}", e)))?;
                tracing::warn!("Using a self-signed certificate; peers must run with --insecure");
                (vec![cert.cert_der], cert.key_der)
            }
            None => {
                return Err(TransportError::ConfigurationError(
                    "Server identity required".to_string(),
                ))
            }
        };

        let mut crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
        crypto.alpn_protocols = self.alpn();

        let crypto = QuicServerConfig::try_from(crypto).map_err(tls_error)?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport_config()?));
        Ok(config)
    }

    fn root_store(&self) -> TransportResult<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            return Ok(roots);
        }

        for der in &self.root_certs {
            roots
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| TransportError::ConfigurationError(format!("Invalid root cert: {}", e)))?;
        }
        Ok(roots)
    }
}

fn tls_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::TlsError(e.to_string())
}

/// PEM certificate chain and private key from disk
fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> TransportResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|e| {
            TransportError::TlsError(format!("Failed to open {}: {}", path.display(), e))
        })
    };

    let chain = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Bad certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificate in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| TransportError::TlsError(format!("Bad key PEM: {}", e)))?
        .ok_or_else(|| {
            TransportError::TlsError(format!("No private key in {}", key_path.display()))
        })?;

    Ok((chain, key))
}

/// Accepts whatever certificate the peer presents, but still checks the
/// handshake signatures against it
#[derive(Debug)]
struct AnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AnyServerCert {
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = QuicConfig::client_default();
        assert!(config.verify_server_cert);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(3));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(10));
        assert_eq!(config.alpn_protocols, vec!["portmux-v1"]);
        assert!(config.identity.is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(QuicConfig::client_default().validate().is_ok());
        assert!(QuicConfig::client_default()
            .with_idle_timeout(Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(QuicConfig::client_default()
            .with_max_streams(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_server_requires_identity() {
        let result = QuicConfig::client_default().build_server_config();
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_self_signed_server_config_builds() {
        let config = QuicConfig::server_self_signed(vec!["peer.internal".to_string()]);
        assert!(config.build_server_config().is_ok());
    }

    #[test]
    fn test_missing_cert_file() {
        let config = QuicConfig::server_default("/nonexistent/peer.crt", "/nonexistent/peer.key");
        assert!(matches!(
            config.build_server_config(),
            Err(TransportError::TlsError(_))
        ));
    }
}
