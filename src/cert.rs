use base64::prelude::*;
use der::{asn1::Ia5String, Encode as _};
use pkcs8::EncodePrivateKey as _;
use rsa::{pkcs1v15, RsaPrivateKey};
use sha2::Sha256;
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const CERTIFICATE_KEY_BITS: usize = 2048;

/// Makes a fresh RSA private key for a certificate.
pub(crate) fn create_rsa_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), CERTIFICATE_KEY_BITS).map_err(Error::crypto)
}

/// Creates a CSR with `domains` and signs it with `key`, returned as base64url DER.
///
/// The first item of `domains` is picked for the CSR's Common Name (CN). All domains are added to a
/// Subject Alternative Name (SAN) extension.
pub(crate) fn create_csr(key: &RsaPrivateKey, domains: &[String]) -> Result<String> {
    let primary_domain = domains
        .first()
        .ok_or_else(|| Error::crypto("CSR needs at least one domain"))?;
    let subject = format!("CN={primary_domain}")
        .parse::<Name>()
        .map_err(Error::crypto)?;

    let signer = pkcs1v15::SigningKey::<Sha256>::new(key.clone());
    let mut csr = CsrBuilder::new(subject, &signer).map_err(Error::crypto)?;

    let names = domains
        .iter()
        .map(|domain| Ia5String::new(domain).map(GeneralName::DnsName))
        .collect::<der::Result<Vec<_>>>()
        .map_err(Error::crypto)?;

    csr.add_extension(&SubjectAltName(names))
        .map_err(Error::crypto)?;

    let der = csr
        .build::<pkcs1v15::Signature>()
        .map_err(Error::crypto)?
        .to_der()
        .map_err(Error::crypto)?;

    Ok(BASE64_URL_SAFE_NO_PAD.encode(der))
}

/// The private key in PKCS#8 PEM format.
pub(crate) fn private_key_pem(key: &RsaPrivateKey) -> Result<Zeroizing<String>> {
    key.to_pkcs8_pem(pem::LineEnding::LF).map_err(Error::crypto)
}

/// Parses every certificate of a PEM chain; the leaf comes first.
pub(crate) fn parse_chain(pem: &[u8]) -> Result<Vec<x509_cert::Certificate>> {
    // load_pem_chain underflows on blank input
    if pem.trim_ascii().is_empty() {
        return Err(Error::crypto("no certificates in PEM data"));
    }

    let chain = x509_cert::Certificate::load_pem_chain(pem).map_err(Error::crypto)?;

    if chain.is_empty() {
        return Err(Error::crypto("no certificates in PEM data"));
    }

    Ok(chain)
}

/// Issued certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    private_key_pem: Zeroizing<String>,
    certificate: String,
}

impl Certificate {
    pub(crate) fn new(private_key_pem: Zeroizing<String>, certificate: String) -> Self {
        Certificate {
            private_key_pem,
            certificate,
        }
    }

    /// The private key in PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// The issued certificate chain in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }
}

#[cfg(test)]
pub(crate) fn test_rsa_key() -> &'static RsaPrivateKey {
    static KEY: std::sync::OnceLock<RsaPrivateKey> = std::sync::OnceLock::new();
    KEY.get_or_init(|| create_rsa_key().unwrap())
}
