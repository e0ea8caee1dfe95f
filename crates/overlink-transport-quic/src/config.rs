//! QUIC transport configuration

use overlink_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// ALPN protocol identifier for Overlink connections
pub const ALPN_OVERLINK: &[u8] = b"overlink-v1";

/// Application-level keep-alive when no data flows
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Transport-level idle timeout
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Server certificate path (for the coordinator)
    pub cert_path: Option<String>,

    /// Server private key path (for the coordinator)
    pub key_path: Option<String>,

    /// Whether agents verify the coordinator certificate
    pub verify_server_cert: bool,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    /// Client configuration with defaults.
    ///
    /// Validates the coordinator certificate against the system trust store.
    pub fn client_default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            verify_server_cert: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            max_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_concurrent_streams: 100,
        }
    }

    /// Client configuration that skips certificate verification.
    ///
    /// **INSECURE**: vulnerable to man-in-the-middle. Only for debugging
    /// against self-signed coordinators.
    pub fn client_insecure() -> Self {
        let mut config = Self::client_default();
        config.verify_server_cert = false;
        config
    }

    /// Server configuration with certificate files.
    pub fn server_default(cert_path: &str, key_path: &str) -> Self {
        Self {
            cert_path: Some(cert_path.to_string()),
            key_path: Some(key_path.to_string()),
            verify_server_cert: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            max_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_concurrent_streams: 1000,
        }
    }

    /// Server configuration with a throwaway self-signed certificate.
    ///
    /// Each call generates a unique certificate in the temp directory so
    /// parallel tests do not collide. Pair with [`Self::client_insecure`].
    pub fn server_ephemeral() -> TransportResult<Self> {
        let (cert_path, key_path) = crate::selfsigned::write_ephemeral_cert()?;
        Ok(Self::server_default(&cert_path, &key_path))
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
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

        Ok(())
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let mut client_crypto = if self.verify_server_cert {
            let mut roots = quinn::rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = vec![ALPN_OVERLINK.to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        client_config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let cert_path = self.cert_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server cert path required".to_string())
        })?;
        let key_path = self.key_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server key path required".to_string())
        })?;

        let certs = load_certs(Path::new(cert_path))?;
        let key = load_private_key(Path::new(key_path))?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = vec![ALPN_OVERLINK.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        server_config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(server_config)
    }

    fn build_transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));
        transport.max_concurrent_bidi_streams(
            u32::try_from(self.max_concurrent_streams)
                .map_err(|_| {
                    TransportError::ConfigurationError("Too many concurrent streams".to_string())
                })?
                .into(),
        );
        Ok(transport)
    }
}

fn load_certs(
    path: &Path,
) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(
    path: &Path,
) -> TransportResult<quinn::rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification, for `client_insecure` only
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
