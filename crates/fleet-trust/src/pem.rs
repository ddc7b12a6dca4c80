//! PEM loading helpers

use crate::error::TrustError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TrustError> {
    let file = File::open(path).map_err(|e| {
        TrustError::Material(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let certs = read_certs(&mut BufReader::new(file))?;
    if certs.is_empty() {
        return Err(TrustError::Material(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TrustError> {
    let file = File::open(path).map_err(|e| {
        TrustError::Material(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    read_private_key(&mut BufReader::new(file))
}

pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, TrustError> {
    read_certs(&mut pem.as_bytes())
}

pub fn private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>, TrustError> {
    read_private_key(&mut pem.as_bytes())
}

fn read_certs(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>, TrustError> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TrustError::Material(format!("Failed to parse certs: {}", e)))
}

fn read_private_key(reader: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>, TrustError> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| TrustError::Material(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TrustError::Material("No private key found".to_string()))
}
