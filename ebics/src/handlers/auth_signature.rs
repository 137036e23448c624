//! The X002 `AuthSignature` of requests and responses.
//!
//! The signature covers the canonical form of every element flagged
//! `authenticate="true"`. `sign` must run after the document is complete:
//! any later change to an authenticated element invalidates it.

use base64::{engine::general_purpose, Engine as _};
use rsa::RsaPublicKey;

use crate::crypto::{CryptService, HashAlgorithm, SignatureVersion};
use crate::error::{EbicsError, ProtocolContext, Result};
use crate::keyring::{Keyring, SignatureType};
use crate::version::{VersionConfig, C14N_ALGORITHM, RSA_SHA256_ALGORITHM, SHA256_ALGORITHM};
use crate::xml::c14n::{canonicalize, canonicalize_authenticated};
use crate::xml::Element;

pub const AUTHENTICATED_REFERENCE: &str = "#xpointer(//*[@authenticate='true'])";

#[derive(Debug, Clone, Copy)]
pub struct AuthSignatureHandler {
    config: VersionConfig,
}

fn is_signed_info(el: &Element) -> bool {
    el.name == "SignedInfo"
}

impl AuthSignatureHandler {
    pub fn new(config: VersionConfig) -> Self {
        AuthSignatureHandler { config }
    }

    pub fn config(&self) -> VersionConfig {
        self.config
    }

    fn signed_info(digest: &[u8]) -> Element {
        Element::ds("SignedInfo")
            .with_child(Element::ds("CanonicalizationMethod").with_attr("Algorithm", C14N_ALGORITHM))
            .with_child(Element::ds("SignatureMethod").with_attr("Algorithm", RSA_SHA256_ALGORITHM))
            .with_child(
                Element::ds("Reference")
                    .with_attr("URI", AUTHENTICATED_REFERENCE)
                    .with_child(
                        Element::ds("Transforms").with_child(
                            Element::ds("Transform").with_attr("Algorithm", C14N_ALGORITHM),
                        ),
                    )
                    .with_child(Element::ds("DigestMethod").with_attr("Algorithm", SHA256_ALGORITHM))
                    .with_child(
                        Element::ds("DigestValue").with_text(general_purpose::STANDARD.encode(digest)),
                    ),
            )
    }

    /// Signs `document` with the user's X key and inserts `AuthSignature` after `header`.
    pub fn sign(&self, document: &mut Element, keyring: &Keyring, crypt: &CryptService) -> Result<()> {
        let signature = keyring.require_user_signature(SignatureType::X)?;
        let private_key = signature.private_key().ok_or_else(|| {
            EbicsError::InvalidState("user X key has no private part".into())
        })?;

        let digest = CryptService::hash(&canonicalize_authenticated(document), HashAlgorithm::Sha256);
        document.insert_after(
            "header",
            Element::new("AuthSignature").with_child(Self::signed_info(&digest)),
        )?;

        let signed_info_digest = CryptService::hash(&canonicalize(document, is_signed_info), HashAlgorithm::Sha256);
        let value = crypt.sign(private_key, keyring.password(), SignatureVersion::X002, &signed_info_digest)?;

        let auth = document
            .child_mut("AuthSignature")
            .ok_or_else(|| EbicsError::Xml("AuthSignature vanished from the request".into()))?;
        auth.push(Element::ds("SignatureValue").with_text(general_purpose::STANDARD.encode(value)));
        log::debug!("request signed with X002");
        Ok(())
    }

    /// Checks the bank's `AuthSignature` on a response.
    ///
    /// Unknown algorithms yield `Algorithm`; a digest or signature mismatch yields `Protocol`.
    pub fn verify(&self, document: &Element, bank_x: &RsaPublicKey) -> Result<()> {
        let fail = |message: &str| EbicsError::protocol(message, ProtocolContext::default());

        let auth = document
            .child("AuthSignature")
            .ok_or_else(|| fail("response carries no AuthSignature"))?;
        let signed_info = auth
            .child("SignedInfo")
            .ok_or_else(|| fail("AuthSignature has no SignedInfo"))?;

        let algorithm = |path: &[&str]| -> Result<String> {
            signed_info
                .find_path(path)
                .and_then(|el| el.attr("Algorithm"))
                .map(str::to_string)
                .ok_or_else(|| fail(&format!("SignedInfo lacks {}", path.join("/"))))
        };
        let canonicalization = algorithm(&["CanonicalizationMethod"])?;
        if canonicalization != C14N_ALGORITHM {
            return Err(EbicsError::Algorithm(format!("canonicalization {}", canonicalization)));
        }
        let signature_method = algorithm(&["SignatureMethod"])?;
        if signature_method != RSA_SHA256_ALGORITHM {
            return Err(EbicsError::Algorithm(format!("signature method {}", signature_method)));
        }
        for transform in signed_info
            .find_path(&["Reference", "Transforms"])
            .into_iter()
            .flat_map(|t| t.children_named("Transform"))
        {
            let uri = transform.attr("Algorithm").unwrap_or_default();
            if uri != C14N_ALGORITHM {
                return Err(EbicsError::Algorithm(format!("transform {}", uri)));
            }
        }
        let digest_method = HashAlgorithm::from_uri(&algorithm(&["Reference", "DigestMethod"])?)?;

        let reference = signed_info.child("Reference").and_then(|r| r.attr("URI"));
        if reference != Some(AUTHENTICATED_REFERENCE) {
            return Err(fail("SignedInfo does not reference the authenticated elements"));
        }

        let expected = signed_info
            .text_at(&["Reference", "DigestValue"])
            .ok_or_else(|| fail("SignedInfo has no DigestValue"))?;
        let expected = general_purpose::STANDARD
            .decode(expected)
            .map_err(|e| fail(&format!("DigestValue is not base64: {}", e)))?;
        let actual = CryptService::hash(&canonicalize_authenticated(document), digest_method);
        if actual != expected {
            return Err(fail("digest of the authenticated elements does not match DigestValue"));
        }

        let value = auth
            .text_at(&["SignatureValue"])
            .ok_or_else(|| fail("AuthSignature has no SignatureValue"))?;
        let value = general_purpose::STANDARD
            .decode(value)
            .map_err(|e| fail(&format!("SignatureValue is not base64: {}", e)))?;
        let signed_info_digest = CryptService::hash(&canonicalize(document, is_signed_info), HashAlgorithm::Sha256);
        CryptService::verify(bank_x, SignatureVersion::X002, &signed_info_digest, &value)
            .map_err(|_| fail("bank signature could not be verified"))?;
        log::debug!("bank signature verified");
        Ok(())
    }
}
