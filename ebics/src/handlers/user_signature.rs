use base64::{engine::general_purpose, Engine as _};

use super::x509_data;
use crate::crypto::{CryptService, SignatureVersion};
use crate::error::{EbicsError, Result};
use crate::keyring::{Keyring, SignatureType};
use crate::models::User;
use crate::version::{VersionConfig, XMLDSIG_NAMESPACE};
use crate::xml::Element;

/// Builds the `UserSignatureData` document (S001 up to H004, S002 for H005).
#[derive(Debug, Clone, Copy)]
pub struct UserSignatureHandler {
    config: VersionConfig,
}

impl UserSignatureHandler {
    pub fn new(config: VersionConfig) -> Self {
        UserSignatureHandler { config }
    }

    /// Signs `digest`, the SHA-256 of the order data, with the user's A key.
    pub fn handle(&self, digest: &[u8], keyring: &Keyring, crypt: &CryptService, user: &User) -> Result<Element> {
        let signature = keyring.require_user_signature(SignatureType::A)?;
        let version: SignatureVersion = signature.version().parse()?;
        if version == SignatureVersion::X002 {
            return Err(EbicsError::Algorithm(format!(
                "{} is not an order signature version",
                version
            )));
        }
        let private_key = signature
            .private_key()
            .ok_or_else(|| EbicsError::InvalidState("user A key has no private part".into()))?;
        let value = crypt.sign(private_key, keyring.password(), version, digest)?;

        let x509 = match signature.certificate() {
            Some(der) => Some(x509_data(der)?),
            None if self.config.certificates_only => {
                return Err(EbicsError::Certificate(format!(
                    "{} order signatures require the A key certificate",
                    self.config.version
                )))
            }
            None => None,
        };

        let document = Element::new("UserSignatureData")
            .with_namespace("", self.config.signature_namespace)
            .with_namespace("ds", XMLDSIG_NAMESPACE)
            .with_child(
                Element::new("OrderSignatureData")
                    .with_child(Element::text_element("SignatureVersion", version.as_str()))
                    .with_child(Element::text_element(
                        "SignatureValue",
                        general_purpose::STANDARD.encode(value),
                    ))
                    .with_child(Element::text_element("PartnerID", user.partner_id.as_str()))
                    .with_child(Element::text_element("UserID", user.user_id.as_str()))
                    .with_opt_child(x509),
            );
        self.validate(&document)?;
        Ok(document)
    }

    /// Structural check against the signature schema of the active version.
    pub fn validate(&self, document: &Element) -> Result<()> {
        let schema = self.config.signature_schema;
        let err = |message: String| EbicsError::schema(schema, message);

        if document.name != "UserSignatureData" {
            return Err(err(format!("root element is <{}>", document.name)));
        }
        if document.declared_namespace("") != Some(self.config.signature_namespace) {
            return Err(err(format!(
                "UserSignatureData is not in namespace {}",
                self.config.signature_namespace
            )));
        }
        let mut count = 0;
        for data in document.children_named("OrderSignatureData") {
            count += 1;
            match data.text_at(&["SignatureVersion"]).as_deref() {
                Some("A005") | Some("A006") => {}
                other => return Err(err(format!("invalid SignatureVersion {:?}", other))),
            }
            let value = data
                .text_at(&["SignatureValue"])
                .ok_or_else(|| err("SignatureValue is missing".into()))?;
            general_purpose::STANDARD
                .decode(value)
                .map_err(|e| err(format!("SignatureValue is not base64: {}", e)))?;
            for field in ["PartnerID", "UserID"] {
                if data.text_at(&[field]).is_none() {
                    return Err(err(format!("{} is missing", field)));
                }
            }
            if self.config.certificates_only && data.text_at(&["X509Data", "X509Certificate"]).is_none() {
                return Err(err("X509Data with X509Certificate is required".into()));
            }
        }
        if count == 0 {
            return Err(err("no OrderSignatureData".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashAlgorithm;
    use crate::test_support::{crypt, keyring};
    use crate::version::Version;

    fn user() -> User {
        User::new("PARTNER1", "USER1")
    }

    #[test]
    fn test_s001_signature_data_verifies_with_a_key() {
        let config = VersionConfig::for_version(Version::H004);
        let keyring = keyring(Version::H004);
        let crypt = crypt();
        let digest = CryptService::hash(b"<Document/>", HashAlgorithm::Sha256);

        let doc = UserSignatureHandler::new(config).handle(&digest, &keyring, &crypt, &user()).unwrap();
        assert_eq!(doc.declared_namespace(""), Some("http://www.ebics.org/S001"));
        let data = doc.child("OrderSignatureData").unwrap();
        assert_eq!(data.text_at(&["SignatureVersion"]).as_deref(), Some("A006"));
        assert_eq!(data.text_at(&["PartnerID"]).as_deref(), Some("PARTNER1"));
        assert!(data.child("X509Data").is_none());

        let value = general_purpose::STANDARD.decode(data.text_at(&["SignatureValue"]).unwrap()).unwrap();
        let public = keyring.user_signature(SignatureType::A).unwrap().rsa_public_key(crypt.locator()).unwrap();
        CryptService::verify(&public, SignatureVersion::A006, &digest, &value).unwrap();
    }

    #[test]
    fn test_s002_embeds_certificate() {
        let config = VersionConfig::for_version(Version::H005);
        let doc = UserSignatureHandler::new(config)
            .handle(&[7u8; 32], &keyring(Version::H005), &crypt(), &user())
            .unwrap();
        assert_eq!(doc.declared_namespace(""), Some("http://www.ebics.org/S002"));
        let x509 = doc.find("X509Data").unwrap();
        assert!(x509.text_at(&["X509IssuerSerial", "X509IssuerName"]).unwrap().contains("CN=user_a"));
        assert!(x509.text_at(&["X509Certificate"]).is_some());
    }

    #[test]
    fn s002_without_certificate_fails() {
        let config = VersionConfig::for_version(Version::H005);
        // H004 keyring carries no certificates
        let result = UserSignatureHandler::new(config).handle(&[7u8; 32], &keyring(Version::H004), &crypt(), &user());
        assert!(matches!(result, Err(EbicsError::Certificate(_))));
    }

    #[test]
    fn validation_reports_the_schema() {
        let handler = UserSignatureHandler::new(VersionConfig::for_version(Version::H004));
        let doc = Element::new("UserSignatureData")
            .with_namespace("", "http://www.ebics.org/S001")
            .with_child(
                Element::new("OrderSignatureData")
                    .with_child(Element::text_element("SignatureVersion", "A006"))
                    .with_child(Element::text_element("SignatureValue", "AAAA")),
            );
        match handler.validate(&doc) {
            Err(EbicsError::Schema { schema, message }) => {
                assert_eq!(schema, "user_signature_S001.xsd");
                assert!(message.contains("PartnerID"));
            }
            other => panic!("expected a schema error, got {:?}", other),
        }
        assert!(handler.validate(&Element::new("UserSignatureData")).is_err());
    }
}
