use thiserror::Error;

/// Trust failures. Always fatal to the connection attempt that hit them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrustError {
    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),

    #[error("expired certificate: {0}")]
    ExpiredCertificate(String),

    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    /// Local CA or identity material could not be loaded
    #[error("trust material error: {0}")]
    Material(String),
}

impl TrustError {
    /// Stable short code, used for operator-facing status
    pub fn code(&self) -> &'static str {
        match self {
            TrustError::UntrustedPeer(_) => "untrusted_peer",
            TrustError::ExpiredCertificate(_) => "expired_certificate",
            TrustError::MalformedCertificate(_) => "malformed_certificate",
            TrustError::Material(_) => "trust_material",
        }
    }

    /// Equivalent rustls certificate error, so the TLS layer sends a matching alert
    pub(crate) fn to_certificate_error(&self) -> rustls::CertificateError {
        match self {
            TrustError::UntrustedPeer(_) => rustls::CertificateError::UnknownIssuer,
            TrustError::ExpiredCertificate(_) => rustls::CertificateError::Expired,
            TrustError::MalformedCertificate(_) => rustls::CertificateError::BadEncoding,
            TrustError::Material(_) => rustls::CertificateError::ApplicationVerificationFailure,
        }
    }
}

/// Map a rustls certificate error onto the trust taxonomy
pub(crate) fn from_certificate_error(err: &rustls::CertificateError) -> TrustError {
    use rustls::CertificateError;

    match err {
        CertificateError::Expired | CertificateError::NotValidYet => {
            TrustError::ExpiredCertificate(format!("{:?}", err))
        }
        CertificateError::BadEncoding => TrustError::MalformedCertificate(format!("{:?}", err)),
        // Newer rustls releases carry timing context in dedicated variants
        other if format!("{:?}", other).starts_with("Expired")
            || format!("{:?}", other).starts_with("NotValidYet") =>
        {
            TrustError::ExpiredCertificate(format!("{:?}", other))
        }
        other => TrustError::UntrustedPeer(format!("{:?}", other)),
    }
}
