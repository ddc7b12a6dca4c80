//! Certificate issuance for provisioning
//!
//! The Panel operator creates one CA per deployment and issues an identity
//! certificate per Node (CN = node id) plus one for the Panel itself.

use crate::error::TrustError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use time::OffsetDateTime;

const DEFAULT_CA_DAYS: i64 = 3650;
const DEFAULT_IDENTITY_DAYS: i64 = 825;

fn issue_error(e: impl std::fmt::Display) -> TrustError {
    TrustError::Material(format!("Certificate generation failed: {}", e))
}

/// Parameters of an identity certificate
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub common_name: String,
    /// DNS names or IP addresses
    pub subject_alt_names: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl IssueRequest {
    pub fn new(common_name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            common_name: common_name.into(),
            subject_alt_names: Vec::new(),
            not_before: now - time::Duration::minutes(5),
            not_after: now + time::Duration::days(DEFAULT_IDENTITY_DAYS),
        }
    }

    pub fn with_san(mut self, name: impl Into<String>) -> Self {
        self.subject_alt_names.push(name.into());
        self
    }

    pub fn valid_for_days(mut self, days: i64) -> Self {
        self.not_after = OffsetDateTime::now_utc() + time::Duration::days(days);
        self
    }

    pub fn valid_between(mut self, not_before: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }
}

/// An issued certificate with its private key, both PEM encoded
#[derive(Debug, Clone)]
pub struct IssuedIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl IssuedIdentity {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.cert_pem)?;
        write_private(key_path, &self.key_pem)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Deployment certificate authority
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    /// Generate a new CA
    pub fn generate(common_name: &str) -> Result<Self, TrustError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "Fleet");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::days(DEFAULT_CA_DAYS);
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

        let key = KeyPair::generate().map_err(issue_error)?;
        let cert = params.self_signed(&key).map_err(issue_error)?;

        Ok(Self { cert, key })
    }

    /// Reload a CA from its PEM certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TrustError> {
        let key = KeyPair::from_pem(key_pem).map_err(issue_error)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(issue_error)?;
        let cert = params.self_signed(&key).map_err(issue_error)?;
        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Issue an identity certificate usable for both client and server auth
    pub fn issue(&self, request: &IssueRequest) -> Result<IssuedIdentity, TrustError> {
        if request.common_name.trim().is_empty() {
            return Err(TrustError::Material(
                "common name must not be empty".to_string(),
            ));
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.common_name.as_str());
        params.distinguished_name = dn;

        let mut names = request.subject_alt_names.clone();
        if !names.contains(&request.common_name) {
            names.push(request.common_name.clone());
        }
        for name in names {
            if let Ok(ip) = name.parse::<IpAddr>() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            } else if let Ok(dns) = rcgen::Ia5String::try_from(name.as_str()) {
                params.subject_alt_names.push(SanType::DnsName(dns));
            }
        }

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.not_before = request.not_before;
        params.not_after = request.not_after;
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

        let key = KeyPair::generate().map_err(issue_error)?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(issue_error)?;

        Ok(IssuedIdentity {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::parse_cert;

    #[test]
    fn test_generate_ca() {
        let ca = CertificateAuthority::generate("Fleet CA").unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_issued_cert_has_common_name() {
        let ca = CertificateAuthority::generate("Fleet CA").unwrap();
        let issued = ca
            .issue(&IssueRequest::new("node-7").with_san("10.1.2.3"))
            .unwrap();

        let der = crate::pem::certs_from_pem(&issued.cert_pem).unwrap().remove(0);
        let facts = parse_cert(&der).unwrap();
        assert_eq!(facts.common_name.as_deref(), Some("node-7"));
        assert!(facts.not_after > facts.not_before);
    }

    #[test]
    fn test_reloaded_ca_still_signs_for_original_anchor() {
        let ca = CertificateAuthority::generate("Fleet CA").unwrap();
        let original_pem = ca.cert_pem();

        let reloaded = CertificateAuthority::from_pem(&original_pem, &ca.key_pem()).unwrap();
        let issued = reloaded.issue(&IssueRequest::new("node-b")).unwrap();

        let panel = ca.issue(&IssueRequest::new("panel")).unwrap();
        let store =
            crate::TrustStore::from_pem(&original_pem, &panel.cert_pem, &panel.key_pem).unwrap();
        let der = crate::pem::certs_from_pem(&issued.cert_pem).unwrap().remove(0);
        assert_eq!(store.verify_peer(&der).unwrap().common_name, "node-b");
    }

    #[test]
    fn test_empty_common_name_rejected() {
        let ca = CertificateAuthority::generate("Fleet CA").unwrap();
        assert!(ca.issue(&IssueRequest::new("  ")).is_err());
    }
}
