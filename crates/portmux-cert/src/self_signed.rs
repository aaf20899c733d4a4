//! Self-signed certificate generation

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const VALID_DAYS: i64 = 90;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Invalid certificate name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("Private key encoding failed: {0}")]
    KeyEncoding(String),
}

/// Certificate chain and key, ready for `rustls::ServerConfig::with_single_cert`
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Generate a self-signed certificate for the peer link
///
/// The certificate names `localhost`, `127.0.0.1` and `::1`, plus each of
/// `names` (DNS names or IP literals). It is valid from now for 90 days and
/// has a random serial. Peers connecting to it must skip verification.
pub fn generate_self_signed_cert_for(
    names: &[String],
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "portmux peer");
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(names)?;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALID_DAYS);
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| SelfSignedError::KeyEncoding(e.to_string()))?;

    tracing::debug!(names = ?names, "Generated self-signed certificate");

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der,
    })
}

/// Certificate valid for the loopback names only
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, SelfSignedError> {
    generate_self_signed_cert_for(&[])
}

fn subject_alt_names(names: &[String]) -> Result<Vec<SanType>, SelfSignedError> {
    let mut sans = vec![
        dns_name("localhost")?,
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];

    for name in names {
        let san = match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => dns_name(name)?,
        };
        if !sans.contains(&san) {
            sans.push(san);
        }
    }

    Ok(sans)
}

fn dns_name(name: &str) -> Result<SanType, SelfSignedError> {
    rcgen::Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|e| SelfSignedError::InvalidName {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_cert() {
        let cert = generate_self_signed_cert().unwrap();
        assert!(!cert.cert_der.is_empty());
    }

    #[test]
    fn test_extra_names() {
        let names = vec!["peer.internal".to_string(), "10.1.2.3".to_string()];
        let sans = subject_alt_names(&names).unwrap();
        assert_eq!(sans.len(), 5);
        assert!(sans.contains(&SanType::IpAddress("10.1.2.3".parse().unwrap())));

        assert!(generate_self_signed_cert_for(&names).is_ok());
    }

    #[test]
    fn test_duplicate_names_collapse() {
        let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        assert_eq!(subject_alt_names(&names).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_name() {
        let names = vec!["pêer.internal".to_string()];
        assert!(matches!(
            generate_self_signed_cert_for(&names),
            Err(SelfSignedError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_cert_loads_into_rustls() {
        let cert = generate_self_signed_cert().unwrap();

        let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
        let server_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert_der], cert.key_der);

        assert!(server_config.is_ok());
    }
}
