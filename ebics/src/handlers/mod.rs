//! Builders and checkers of the signed parts of EBICS documents.

pub mod auth_signature;
pub mod order_data;
pub mod user_signature;

pub use auth_signature::AuthSignatureHandler;
pub use order_data::OrderDataHandler;
pub use user_signature::UserSignatureHandler;

use base64::{engine::general_purpose, Engine as _};

use crate::certificate::certificate_info;
use crate::error::Result;
use crate::xml::Element;

/// `ds:X509Data` for a DER certificate.
pub(crate) fn x509_data(der: &[u8]) -> Result<Element> {
    let info = certificate_info(der)?;
    Ok(Element::ds("X509Data")
        .with_child(
            Element::ds("X509IssuerSerial")
                .with_child(Element::ds("X509IssuerName").with_text(info.issuer))
                .with_child(Element::ds("X509SerialNumber").with_text(info.serial)),
        )
        .with_child(Element::ds("X509Certificate").with_text(general_purpose::STANDARD.encode(der))))
}
