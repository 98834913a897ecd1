//! Caller identity from the verified client certificate.

use thiserror::Error;
use tonic::Request;
use x509_parser::prelude::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no verified client certificate")]
    NoCertificate,
    #[error("client certificate cannot be parsed: {0}")]
    Malformed(String),
    #[error("client certificate has no common name")]
    NoCommonName,
}

/// Subject common name of a DER encoded certificate.
pub fn common_name(der: &[u8]) -> Result<String, IdentityError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|err| IdentityError::Malformed(err.to_string()))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or(IdentityError::NoCommonName)?;
    let cn = cn.as_str().map_err(|err| IdentityError::Malformed(err.to_string()))?;
    if cn.trim().is_empty() {
        return Err(IdentityError::NoCommonName);
    }
    Ok(cn.to_string())
}

/// Identity of the peer: the common name of the leaf of its verified chain.
pub fn caller_identity<T>(request: &Request<T>) -> Result<String, IdentityError> {
    let certs = request.peer_certs().ok_or(IdentityError::NoCertificate)?;
    let leaf = certs.first().ok_or(IdentityError::NoCertificate)?;
    common_name(leaf.as_ref())
}
