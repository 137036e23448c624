//! Public key order data of INI, HIA and HPB.
//!
//! Up to H004 keys travel as `PubKeyValue` (RSA modulus, exponent and a
//! timestamp), optionally next to an `X509Data` block. H005 exchanges
//! certificates only, so the `PubKeyValue` step does nothing and a missing
//! certificate is an error.

use base64::{engine::general_purpose, Engine as _};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};

use super::x509_data;
use crate::certificate::certificate_public_key;
use crate::error::{EbicsError, Result};
use crate::keyring::storage::StorageLocator;
use crate::keyring::{Keyring, Signature, SignatureType};
use crate::models::User;
use crate::version::{VersionConfig, XMLDSIG_NAMESPACE};
use crate::xml::Element;

#[derive(Debug, Clone, Copy)]
pub struct OrderDataHandler {
    config: VersionConfig,
}

impl OrderDataHandler {
    pub fn new(config: VersionConfig) -> Self {
        OrderDataHandler { config }
    }

    /// INI order data carrying the user's A key.
    pub fn signature_pub_key_order_data(
        &self,
        keyring: &Keyring,
        locator: &StorageLocator,
        user: &User,
    ) -> Result<Element> {
        let a = keyring.require_user_signature(SignatureType::A)?;
        let info = self
            .pub_key_info("SignaturePubKeyInfo", a, locator)?
            .with_child(Element::text_element("SignatureVersion", a.version()));
        Ok(Element::new("SignaturePubKeyOrderData")
            .with_namespace("", self.config.signature_namespace)
            .with_namespace("ds", XMLDSIG_NAMESPACE)
            .with_child(info)
            .with_child(Element::text_element("PartnerID", user.partner_id.as_str()))
            .with_child(Element::text_element("UserID", user.user_id.as_str())))
    }

    /// HIA order data carrying the user's X and E keys.
    pub fn hia_request_order_data(
        &self,
        keyring: &Keyring,
        locator: &StorageLocator,
        user: &User,
    ) -> Result<Element> {
        let x = keyring.require_user_signature(SignatureType::X)?;
        let e = keyring.require_user_signature(SignatureType::E)?;
        let authentication = self
            .pub_key_info("AuthenticationPubKeyInfo", x, locator)?
            .with_child(Element::text_element("AuthenticationVersion", x.version()));
        let encryption = self
            .pub_key_info("EncryptionPubKeyInfo", e, locator)?
            .with_child(Element::text_element("EncryptionVersion", e.version()));
        Ok(Element::new("HIARequestOrderData")
            .with_namespace("", self.config.namespace)
            .with_namespace("ds", XMLDSIG_NAMESPACE)
            .with_child(authentication)
            .with_child(encryption)
            .with_child(Element::text_element("PartnerID", user.partner_id.as_str()))
            .with_child(Element::text_element("UserID", user.user_id.as_str())))
    }

    fn pub_key_info(&self, name: &str, signature: &Signature, locator: &StorageLocator) -> Result<Element> {
        let mut info = Element::new(name);
        self.add_x509_data(&mut info, signature)?;
        self.add_pub_key_value(&mut info, signature, locator)?;
        Ok(info)
    }

    fn add_x509_data(&self, info: &mut Element, signature: &Signature) -> Result<()> {
        match signature.certificate() {
            Some(der) => info.push(x509_data(der)?),
            None if self.config.certificates_only => {
                return Err(EbicsError::Certificate(format!(
                    "{} key exchange requires a certificate for the {} key",
                    self.config.version,
                    signature.signature_type()
                )))
            }
            None => {}
        }
        Ok(())
    }

    fn add_pub_key_value(&self, info: &mut Element, signature: &Signature, locator: &StorageLocator) -> Result<()> {
        if self.config.certificates_only {
            return Ok(());
        }
        let key = signature.rsa_public_key(locator)?;
        info.push(
            Element::new("PubKeyValue")
                .with_child(
                    Element::ds("RSAKeyValue")
                        .with_child(Element::ds("Modulus").with_text(general_purpose::STANDARD.encode(key.n().to_bytes_be())))
                        .with_child(Element::ds("Exponent").with_text(general_purpose::STANDARD.encode(key.e().to_bytes_be()))),
                )
                .with_child(Element::text_element(
                    "TimeStamp",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                )),
        );
        Ok(())
    }

    /// The bank's X key from `HPBResponseOrderData`.
    pub fn retrieve_authentication_signature(&self, document: &Element, locator: &StorageLocator) -> Result<Signature> {
        self.retrieve(document, locator, SignatureType::X, "AuthenticationPubKeyInfo", "AuthenticationVersion")
    }

    /// The bank's E key from `HPBResponseOrderData`.
    pub fn retrieve_encryption_signature(&self, document: &Element, locator: &StorageLocator) -> Result<Signature> {
        self.retrieve(document, locator, SignatureType::E, "EncryptionPubKeyInfo", "EncryptionVersion")
    }

    fn retrieve(
        &self,
        document: &Element,
        locator: &StorageLocator,
        signature_type: SignatureType,
        info_name: &str,
        version_name: &str,
    ) -> Result<Signature> {
        let schema = self.config.key_management_schema;
        let info = document
            .find(info_name)
            .ok_or_else(|| EbicsError::schema(schema, format!("{} is missing", info_name)))?;
        let version = info
            .text_at(&[version_name])
            .unwrap_or_else(|| signature_type.default_version().to_string());

        let certificate = match info.find("X509Certificate") {
            Some(el) => Some(
                general_purpose::STANDARD
                    .decode(el.text().split_whitespace().collect::<String>())
                    .map_err(|e| EbicsError::Certificate(format!("X509Certificate is not base64: {}", e)))?,
            ),
            None => None,
        };

        let (public_key, certificate) = match certificate {
            Some(der) => (certificate_public_key(&der)?, Some(der)),
            None if self.config.certificates_only => {
                return Err(EbicsError::Certificate(format!(
                    "{} is not supported for non-certified banks",
                    self.config.version
                )))
            }
            None => (self.rsa_key_value(info)?, None),
        };

        let stored = locator.default_storage()?.write_public_key(&public_key)?;
        let signature = Signature::new(signature_type, version, stored);
        log::debug!(
            "bank {} key retrieved ({})",
            signature_type,
            if certificate.is_some() { "certificate" } else { "modulus/exponent" }
        );
        Ok(match certificate {
            Some(der) => signature.with_certificate(der),
            None => signature,
        })
    }

    fn rsa_key_value(&self, info: &Element) -> Result<RsaPublicKey> {
        let schema = self.config.key_management_schema;
        let number = |name: &str| -> Result<BigUint> {
            let text = info
                .find(name)
                .map(|el| el.text().split_whitespace().collect::<String>())
                .filter(|text| !text.is_empty())
                .ok_or_else(|| EbicsError::schema(schema, format!("{} is missing from {}", name, info.name)))?;
            let bytes = general_purpose::STANDARD
                .decode(text)
                .map_err(|e| EbicsError::schema(schema, format!("{} is not base64: {}", name, e)))?;
            Ok(BigUint::from_bytes_be(&bytes))
        };
        RsaPublicKey::new(number("Modulus")?, number("Exponent")?)
            .map_err(|e| EbicsError::Crypto(format!("invalid bank RSA key: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{keyring, locator};
    use crate::version::Version;

    fn user() -> User {
        User::new("PARTNER1", "USER1")
    }

    #[test]
    fn test_ini_order_data_h004() {
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H004));
        let doc = handler
            .signature_pub_key_order_data(&keyring(Version::H004), &locator(), &user())
            .unwrap();
        assert_eq!(doc.name, "SignaturePubKeyOrderData");
        assert_eq!(doc.declared_namespace(""), Some("http://www.ebics.org/S001"));
        let info = doc.child("SignaturePubKeyInfo").unwrap();
        assert!(info.child("X509Data").is_none());
        assert!(info.find_path(&["PubKeyValue", "RSAKeyValue", "Modulus"]).is_some());
        assert!(info.text_at(&["PubKeyValue", "TimeStamp"]).is_some());
        assert_eq!(info.text_at(&["SignatureVersion"]).as_deref(), Some("A006"));
        assert_eq!(doc.text_at(&["UserID"]).as_deref(), Some("USER1"));
    }

    #[test]
    fn test_hia_order_data_h005_is_certificate_only() {
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H005));
        let doc = handler
            .hia_request_order_data(&keyring(Version::H005), &locator(), &user())
            .unwrap();
        assert_eq!(doc.declared_namespace(""), Some("urn:org:ebics:H005"));
        for name in ["AuthenticationPubKeyInfo", "EncryptionPubKeyInfo"] {
            let info = doc.child(name).unwrap();
            assert!(info.child("X509Data").is_some());
            assert!(info.child("PubKeyValue").is_none());
        }
    }

    #[test]
    fn h005_key_exchange_without_certificate_fails() {
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H005));
        let result = handler.hia_request_order_data(&keyring(Version::H004), &locator(), &user());
        assert!(matches!(result, Err(EbicsError::Certificate(_))));
    }

    #[test]
    fn test_retrieve_from_modulus_and_exponent() {
        // HIA and HPB share the PubKeyInfo layout
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H004));
        let keyring = keyring(Version::H004);
        let locator = locator();
        let doc = handler.hia_request_order_data(&keyring, &locator, &user()).unwrap();
        let doc = crate::xml::parse(&doc.to_document()).unwrap();

        let x = handler.retrieve_authentication_signature(&doc, &locator).unwrap();
        let e = handler.retrieve_encryption_signature(&doc, &locator).unwrap();
        assert_eq!(x.signature_type(), SignatureType::X);
        assert_eq!(x.version(), "X002");
        assert_eq!(e.version(), "E002");
        assert!(!x.is_certified());
        let expected = keyring.user_signature(SignatureType::E).unwrap().rsa_public_key(&locator).unwrap();
        assert_eq!(e.rsa_public_key(&locator).unwrap(), expected);
    }

    #[test]
    fn test_retrieve_prefers_certificate() {
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H005));
        let keyring = keyring(Version::H005);
        let locator = locator();
        let doc = handler.hia_request_order_data(&keyring, &locator, &user()).unwrap();

        let x = handler.retrieve_authentication_signature(&doc, &locator).unwrap();
        assert!(x.is_certified());
        assert_eq!(x.certificate(), keyring.user_signature(SignatureType::X).unwrap().certificate());
        let expected = keyring.user_signature(SignatureType::X).unwrap().rsa_public_key(&locator).unwrap();
        assert_eq!(x.rsa_public_key(&locator).unwrap(), expected);
    }

    #[test]
    fn h005_bank_without_certificate_is_rejected() {
        let legacy = OrderDataHandler::new(VersionConfig::for_version(Version::H004));
        let doc = legacy.hia_request_order_data(&keyring(Version::H004), &locator(), &user()).unwrap();
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H005));
        match handler.retrieve_encryption_signature(&doc, &locator()) {
            Err(EbicsError::Certificate(message)) => assert!(message.contains("non-certified")),
            other => panic!("expected a certificate error, got {:?}", other),
        }
    }

    #[test]
    fn missing_key_info_is_a_schema_error() {
        let handler = OrderDataHandler::new(VersionConfig::for_version(Version::H004));
        let doc = Element::new("HPBResponseOrderData");
        assert!(matches!(
            handler.retrieve_authentication_signature(&doc, &locator()),
            Err(EbicsError::Schema { .. })
        ));
    }
}
