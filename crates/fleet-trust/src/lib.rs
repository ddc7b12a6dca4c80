//! Trust store for the Panel–Node control plane
//!
//! Every Panel and Node identity certificate chains to a single CA that is
//! distributed out-of-band. This crate loads that CA plus the local identity,
//! verifies peer certificates, signs and checks handshake proofs, builds the
//! mutual-TLS rustls configurations and issues certificates for provisioning.

pub mod error;
pub mod issue;
pub mod pem;
pub mod store;
pub mod tls;

pub use error::TrustError;
pub use issue::{CertificateAuthority, IssueRequest, IssuedIdentity};
pub use store::{claimed_common_name, Identity, TrustPaths, TrustStore};
pub use tls::{classify_tls_error, RejectionHook, TrustRejection};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Certificate chain with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}

impl Clone for Certificate {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default (once)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
