use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use x509_parser::parse_x509_certificate;

use crate::error::{EbicsError, Result};

/// The parts of an X.509 certificate EBICS documents refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub issuer: String,
    pub subject: String,
    /// Serial number in decimal, as `ds:X509SerialNumber` wants it.
    pub serial: String,
}

fn parse(der: &[u8]) -> Result<x509_parser::certificate::X509Certificate<'_>> {
    if der.is_empty() {
        return Err(EbicsError::Certificate("certificate data is empty".into()));
    }
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| EbicsError::Certificate(format!("invalid X.509 certificate: {}", e)))?;
    Ok(cert)
}

pub fn certificate_info(der: &[u8]) -> Result<CertificateInfo> {
    let cert = parse(der)?;
    Ok(CertificateInfo {
        issuer: cert.issuer().to_string(),
        subject: cert.subject().to_string(),
        serial: cert.tbs_certificate.serial.to_string(),
    })
}

/// The RSA public key a certificate was issued for.
pub fn certificate_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    let cert = parse(der)?;
    RsaPublicKey::from_public_key_der(cert.public_key().raw)
        .map_err(|e| EbicsError::Certificate(format!("certificate does not hold an RSA key: {}", e)))
}
