//! CA anchor, local identity and peer verification

use crate::error::{from_certificate_error, TrustError};
use crate::pem::{certs_from_pem, load_certs, load_private_key, private_key_from_pem};
use crate::{ensure_crypto_provider, Certificate};
use chrono::{DateTime, Utc};
use fleet_proto::{HandshakeSignature, SignatureAlgorithm, HANDSHAKE_CONTEXT};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Verified identity of a certificate holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject common name; the node id for node certificates
    pub common_name: String,
    /// SHA-256 of the DER certificate, lowercase hex
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// File locations of the CA anchor and the local identity
#[derive(Debug, Clone)]
pub struct TrustPaths {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Parsed facts about a certificate, before any chain check
pub(crate) struct CertFacts {
    pub common_name: Option<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub public_key: Vec<u8>,
}

pub(crate) fn parse_cert(der: &[u8]) -> Result<CertFacts, TrustError> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| TrustError::MalformedCertificate(format!("x509 parse failed: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    Ok(CertFacts {
        common_name,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    })
}

/// Common name a certificate claims, without checking anything else
pub fn claimed_common_name(certificate: &CertificateDer<'_>) -> Option<String> {
    parse_cert(certificate).ok().and_then(|facts| facts.common_name)
}

fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn timestamp_to_utc(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

/// Chain, validity and parse checks against the configured CA
#[derive(Clone)]
pub(crate) struct PeerVerifier {
    webpki: Arc<dyn ClientCertVerifier>,
}

impl fmt::Debug for PeerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerVerifier").finish_non_exhaustive()
    }
}

impl PeerVerifier {
    pub(crate) fn new(roots: Arc<RootCertStore>) -> Result<Self, TrustError> {
        ensure_crypto_provider();
        let webpki = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| TrustError::Material(format!("Failed to build verifier: {}", e)))?;
        Ok(Self { webpki })
    }

    pub(crate) fn webpki(&self) -> &Arc<dyn ClientCertVerifier> {
        &self.webpki
    }

    pub(crate) fn verify(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<Identity, TrustError> {
        let facts = parse_cert(end_entity)?;
        let common_name = facts.common_name.ok_or_else(|| {
            TrustError::MalformedCertificate("certificate has no common name".to_string())
        })?;

        let now_secs = now.as_secs() as i64;
        if now_secs < facts.not_before {
            return Err(TrustError::ExpiredCertificate(format!(
                "certificate for '{}' is not valid before {}",
                common_name,
                timestamp_to_utc(facts.not_before)
            )));
        }
        if now_secs > facts.not_after {
            return Err(TrustError::ExpiredCertificate(format!(
                "certificate for '{}' expired at {}",
                common_name,
                timestamp_to_utc(facts.not_after)
            )));
        }

        self.webpki
            .verify_client_cert(end_entity, intermediates, now)
            .map_err(|e| match e {
                rustls::Error::InvalidCertificate(cert_err) => from_certificate_error(&cert_err),
                other => TrustError::UntrustedPeer(other.to_string()),
            })?;

        Ok(Identity {
            common_name,
            fingerprint: fingerprint(end_entity),
            not_before: timestamp_to_utc(facts.not_before),
            not_after: timestamp_to_utc(facts.not_after),
        })
    }
}

enum HandshakeSigner {
    Ecdsa(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

impl HandshakeSigner {
    fn from_key(key: &PrivateKeyDer<'_>) -> Result<Self, TrustError> {
        let pkcs8 = match key {
            PrivateKeyDer::Pkcs8(k) => k.secret_pkcs8_der(),
            _ => {
                return Err(TrustError::Material(
                    "identity key must be PKCS#8 (BEGIN PRIVATE KEY)".to_string(),
                ))
            }
        };

        let rng = SystemRandom::new();
        if let Ok(pair) =
            EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
        {
            return Ok(HandshakeSigner::Ecdsa(pair));
        }
        if let Ok(pair) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8) {
            return Ok(HandshakeSigner::Ed25519(pair));
        }
        Err(TrustError::Material(
            "identity key must be ECDSA P-256 or Ed25519".to_string(),
        ))
    }

    fn public_key(&self) -> &[u8] {
        match self {
            HandshakeSigner::Ecdsa(pair) => pair.public_key().as_ref(),
            HandshakeSigner::Ed25519(pair) => pair.public_key().as_ref(),
        }
    }

    fn sign(&self, message: &[u8]) -> Result<HandshakeSignature, TrustError> {
        match self {
            HandshakeSigner::Ecdsa(pair) => {
                let sig = pair
                    .sign(&SystemRandom::new(), message)
                    .map_err(|_| TrustError::Material("ECDSA signing failed".to_string()))?;
                Ok(HandshakeSignature {
                    algorithm: SignatureAlgorithm::EcdsaP256Sha256,
                    bytes: sig.as_ref().to_vec(),
                })
            }
            HandshakeSigner::Ed25519(pair) => Ok(HandshakeSignature {
                algorithm: SignatureAlgorithm::Ed25519,
                bytes: pair.sign(message).as_ref().to_vec(),
            }),
        }
    }
}

fn handshake_message(nonce: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HANDSHAKE_CONTEXT.len() + nonce.len());
    message.extend_from_slice(HANDSHAKE_CONTEXT);
    message.extend_from_slice(nonce);
    message
}

/// CA anchor plus this process's identity
pub struct TrustStore {
    ca_pem: String,
    roots: Arc<RootCertStore>,
    verifier: PeerVerifier,
    certificate: Certificate,
    identity: Identity,
    signer: HandshakeSigner,
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl TrustStore {
    /// Load CA and identity from disk. Called once at startup.
    pub fn load(paths: &TrustPaths) -> Result<Self, TrustError> {
        let ca_pem = std::fs::read_to_string(&paths.ca_cert).map_err(|e| {
            TrustError::Material(format!(
                "Failed to read CA file {}: {}",
                paths.ca_cert.display(),
                e
            ))
        })?;
        let chain = load_certs(&paths.cert)?;
        let key = load_private_key(&paths.key)?;

        let store = Self::from_parts(ca_pem, chain, key)?;
        info!(
            identity = %store.identity.common_name,
            fingerprint = %store.identity.fingerprint,
            not_after = %store.identity.not_after,
            "Loaded trust material"
        );
        Ok(store)
    }

    /// Build from PEM strings (CA, identity chain, identity key)
    pub fn from_pem(ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<Self, TrustError> {
        let chain = certs_from_pem(cert_pem)?;
        let key = private_key_from_pem(key_pem)?;
        Self::from_parts(ca_pem.to_string(), chain, key)
    }

    fn from_parts(
        ca_pem: String,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TrustError> {
        let ca_certs = certs_from_pem(&ca_pem)?;
        if ca_certs.len() != 1 {
            return Err(TrustError::Material(format!(
                "CA file must hold exactly one certificate, found {}",
                ca_certs.len()
            )));
        }
        let mut roots = RootCertStore::empty();
        roots
            .add(ca_certs[0].clone())
            .map_err(|e| TrustError::Material(format!("Invalid CA certificate: {}", e)))?;
        let roots = Arc::new(roots);

        let leaf = chain
            .first()
            .ok_or_else(|| TrustError::Material("identity chain is empty".to_string()))?;
        let facts = parse_cert(leaf).map_err(|e| TrustError::Material(e.to_string()))?;
        let common_name = facts.common_name.ok_or_else(|| {
            TrustError::Material("identity certificate has no common name".to_string())
        })?;

        let signer = HandshakeSigner::from_key(&key)?;
        if signer.public_key() != facts.public_key.as_slice() {
            return Err(TrustError::Material(
                "identity key does not match identity certificate".to_string(),
            ));
        }

        let identity = Identity {
            common_name,
            fingerprint: fingerprint(leaf),
            not_before: timestamp_to_utc(facts.not_before),
            not_after: timestamp_to_utc(facts.not_after),
        };
        debug!(identity = %identity.common_name, "Identity material parsed");

        Ok(Self {
            ca_pem,
            verifier: PeerVerifier::new(roots.clone())?,
            roots,
            certificate: Certificate::new(chain, key),
            identity,
            signer,
        })
    }

    /// Accept a peer certificate only if it chains to the CA and is in its validity window
    pub fn verify_peer(&self, certificate: &CertificateDer<'_>) -> Result<Identity, TrustError> {
        self.verify_peer_at(certificate, UnixTime::now())
    }

    pub fn verify_peer_at(
        &self,
        certificate: &CertificateDer<'_>,
        now: UnixTime,
    ) -> Result<Identity, TrustError> {
        self.verifier.verify(certificate, &[], now)
    }

    /// Sign a handshake nonce with the identity key
    pub fn sign_handshake(&self, nonce: &[u8]) -> Result<HandshakeSignature, TrustError> {
        self.signer.sign(&handshake_message(nonce))
    }

    /// Check a handshake signature against the key in `certificate`
    pub fn verify_handshake(
        &self,
        certificate: &CertificateDer<'_>,
        nonce: &[u8],
        signature: &HandshakeSignature,
    ) -> Result<(), TrustError> {
        let facts = parse_cert(certificate)?;
        let algorithm: &'static dyn signature::VerificationAlgorithm = match signature.algorithm {
            SignatureAlgorithm::EcdsaP256Sha256 => &signature::ECDSA_P256_SHA256_ASN1,
            SignatureAlgorithm::Ed25519 => &signature::ED25519,
        };

        UnparsedPublicKey::new(algorithm, &facts.public_key)
            .verify(&handshake_message(nonce), &signature.bytes)
            .map_err(|_| TrustError::UntrustedPeer("handshake signature mismatch".to_string()))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn roots(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }

    pub(crate) fn verifier(&self) -> &PeerVerifier {
        &self.verifier
    }
}
