//! Mutual-TLS configuration for the control channel

use crate::error::{from_certificate_error, TrustError};
use crate::store::{claimed_common_name, PeerVerifier, TrustStore};
use crate::ensure_crypto_provider;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{AlertDescription, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A peer certificate refused during the TLS handshake
#[derive(Debug, Clone)]
pub struct TrustRejection {
    /// Common name claimed by the certificate, when it could be parsed
    pub common_name: Option<String>,
    pub error: TrustError,
}

/// Called for every refused client certificate
pub type RejectionHook = Arc<dyn Fn(TrustRejection) + Send + Sync>;

/// Client verifier that runs the trust store checks and reports rejections
struct RecordingVerifier {
    peer: PeerVerifier,
    on_reject: Option<RejectionHook>,
}

impl fmt::Debug for RecordingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingVerifier")
            .field("hook", &self.on_reject.is_some())
            .finish()
    }
}

impl ClientCertVerifier for RecordingVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.peer.webpki().root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.peer.verify(end_entity, intermediates, now) {
            Ok(_) => Ok(ClientCertVerified::assertion()),
            Err(error) => {
                let common_name = claimed_common_name(end_entity);
                warn!(
                    peer = common_name.as_deref().unwrap_or("<unknown>"),
                    error = %error,
                    "Rejected client certificate"
                );
                let cert_error = error.to_certificate_error();
                if let Some(hook) = &self.on_reject {
                    hook(TrustRejection { common_name, error });
                }
                Err(rustls::Error::InvalidCertificate(cert_error))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.peer.webpki().verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.peer.webpki().verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.peer.webpki().supported_verify_schemes()
    }
}

impl TrustStore {
    /// Panel-side TLS config: client certificates are mandatory and checked
    /// against the CA
    pub fn server_config(
        &self,
        on_reject: Option<RejectionHook>,
    ) -> Result<Arc<ServerConfig>, TrustError> {
        ensure_crypto_provider();

        let verifier = Arc::new(RecordingVerifier {
            peer: self.verifier().clone(),
            on_reject,
        });
        let identity = self.certificate().clone();

        let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.cert_chain, identity.private_key)
            .map_err(|e| TrustError::Material(format!("Invalid cert/key: {}", e)))?;

        Ok(Arc::new(config))
    }

    /// Node-side TLS config: the panel must chain to the CA, and we present
    /// our own identity
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TrustError> {
        ensure_crypto_provider();

        let identity = self.certificate().clone();
        let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(self.roots())
            .with_client_auth_cert(identity.cert_chain, identity.private_key)
            .map_err(|e| TrustError::Material(format!("Invalid cert/key: {}", e)))?;

        Ok(Arc::new(config))
    }
}

/// Extract the trust failure from a TLS error, if that is what it was
pub fn classify_tls_error(err: &rustls::Error) -> Option<TrustError> {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => Some(from_certificate_error(cert_err)),
        rustls::Error::NoCertificatesPresented => Some(TrustError::UntrustedPeer(
            "peer presented no certificate".to_string(),
        )),
        rustls::Error::AlertReceived(alert) => match alert {
            AlertDescription::CertificateExpired => Some(TrustError::ExpiredCertificate(
                "peer reports our certificate expired".to_string(),
            )),
            AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::CertificateRequired
            | AlertDescription::AccessDenied => Some(TrustError::UntrustedPeer(format!(
                "peer rejected our certificate ({:?})",
                alert
            ))),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{CertificateAuthority, IssueRequest};

    fn store(ca: &CertificateAuthority, name: &str) -> TrustStore {
        let issued = ca
            .issue(&IssueRequest::new(name).with_san("localhost"))
            .unwrap();
        TrustStore::from_pem(&ca.cert_pem(), &issued.cert_pem, &issued.key_pem).unwrap()
    }

    #[test]
    fn test_configs_build() {
        let ca = CertificateAuthority::generate("Fleet CA").unwrap();
        let panel = store(&ca, "panel");
        let node = store(&ca, "node-a");

        assert!(panel.server_config(None).is_ok());
        assert!(node.client_config().is_ok());
    }

    #[test]
    fn test_rejection_hook_receives_common_name() {
        use std::sync::Mutex;

        let ca = CertificateAuthority::generate("Fleet CA").unwrap();
        let rogue_ca = CertificateAuthority::generate("Rogue CA").unwrap();
        let panel = store(&ca, "panel");
        let rogue = rogue_ca.issue(&IssueRequest::new("node-x")).unwrap();
        let rogue_der = crate::pem::certs_from_pem(&rogue.cert_pem).unwrap().remove(0);

        let seen: Arc<Mutex<Vec<TrustRejection>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let verifier = RecordingVerifier {
            peer: panel.verifier().clone(),
            on_reject: Some(Arc::new(move |r: TrustRejection| sink.lock().unwrap().push(r))),
        };

        let result = verifier.verify_client_cert(&rogue_der, &[], UnixTime::now());
        assert!(result.is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].common_name.as_deref(), Some("node-x"));
        assert!(matches!(seen[0].error, TrustError::UntrustedPeer(_)));
    }

    #[test]
    fn test_classify_tls_error() {
        assert!(matches!(
            classify_tls_error(&rustls::Error::AlertReceived(AlertDescription::UnknownCA)),
            Some(TrustError::UntrustedPeer(_))
        ));
        assert!(matches!(
            classify_tls_error(&rustls::Error::InvalidCertificate(
                rustls::CertificateError::Expired
            )),
            Some(TrustError::ExpiredCertificate(_))
        ));
        assert!(classify_tls_error(&rustls::Error::HandshakeNotComplete).is_none());
    }
}
