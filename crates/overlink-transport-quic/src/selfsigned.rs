//! Self-signed certificate generation for development and tests
//!
//! Production deployments point the coordinator at CA-issued certificate
//! files; this module only exists so tests and local setups can handshake
//! without provisioning.

use overlink_transport::{TransportError, TransportResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Generate a self-signed certificate for localhost and write it to unique
/// files in the temp directory.
///
/// Returns `(cert_path, key_path)` in PEM format. Each call produces a
/// fresh certificate so parallel test processes never race on the files.
pub fn write_ephemeral_cert() -> TransportResult<(String, String)> {
    let mut params = rcgen::CertificateParams::default();

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "Overlink Development Certificate");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(
            rcgen::Ia5String::try_from("localhost")
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ),
        rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        rcgen::SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| TransportError::TlsError(format!("Key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::TlsError(format!("Certificate generation failed: {}", e)))?;

    let unique = uuid::Uuid::new_v4();
    let temp_dir = std::env::temp_dir();
    let cert_path = temp_dir.join(format!("overlink-quic-{}.crt", unique));
    let key_path = temp_dir.join(format!("overlink-quic-{}.key", unique));

    std::fs::write(&cert_path, cert.pem()).map_err(TransportError::IoError)?;
    std::fs::write(&key_path, key_pair.serialize_pem()).map_err(TransportError::IoError)?;

    Ok((
        cert_path.to_string_lossy().into_owned(),
        key_path.to_string_lossy().into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_cert_files_exist() {
        let (cert_path, key_path) = write_ephemeral_cert().unwrap();

        let cert = std::fs::read_to_string(&cert_path).unwrap();
        let key = std::fs::read_to_string(&key_path).unwrap();

        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));

        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);
    }

    #[test]
    fn test_ephemeral_certs_are_unique() {
        let (cert_a, key_a) = write_ephemeral_cert().unwrap();
        let (cert_b, key_b) = write_ephemeral_cert().unwrap();

        assert_ne!(cert_a, cert_b);

        for path in [cert_a, key_a, cert_b, key_b] {
            let _ = std::fs::remove_file(path);
        }
    }
}
