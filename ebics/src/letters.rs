//! Data of the INI and HIA initialisation letters.
//!
//! The bank compares the hashes printed on the signed paper letters with the
//! keys it received electronically before it unlocks the subscriber.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use rsa::traits::PublicKeyParts;

use crate::crypto::{CryptService, HashAlgorithm};
use crate::error::Result;
use crate::keyring::storage::StorageLocator;
use crate::keyring::{Keyring, SignatureType};
use crate::models::{Bank, User};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLetter {
    /// INI or HIA.
    pub order_type: &'static str,
    pub signature_type: SignatureType,
    pub version: String,
    /// Upper case hex, empty for certificate letters.
    pub exponent: String,
    pub modulus: String,
    /// Whether `digest` is a certificate fingerprint rather than a key hash.
    pub certificate: bool,
    pub digest: Vec<u8>,
}

impl KeyLetter {
    /// The digest as printed: upper case hex pairs, 16 per line.
    pub fn formatted_digest(&self) -> String {
        self.digest
            .chunks(16)
            .map(|line| line.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct Letters {
    pub host_id: String,
    pub partner_id: String,
    pub user_id: String,
    pub created: DateTime<Utc>,
    pub keys: Vec<KeyLetter>,
}

impl Letters {
    /// Certificates are printed as fingerprints; bare keys as exponent, modulus and hash.
    pub fn new(bank: &Bank, user: &User, keyring: &Keyring, locator: &StorageLocator) -> Result<Self> {
        let mut keys = Vec::new();
        for (order_type, signature_type) in [
            ("INI", SignatureType::A),
            ("HIA", SignatureType::X),
            ("HIA", SignatureType::E),
        ] {
            let signature = keyring.require_user_signature(signature_type)?;
            let letter = match signature.certificate() {
                Some(der) => KeyLetter {
                    order_type,
                    signature_type,
                    version: signature.version().to_string(),
                    exponent: String::new(),
                    modulus: String::new(),
                    certificate: true,
                    digest: CryptService::calculate_certificate_fingerprint(der),
                },
                None => {
                    let key = signature.rsa_public_key(locator)?;
                    KeyLetter {
                        order_type,
                        signature_type,
                        version: signature.version().to_string(),
                        exponent: hex::encode_upper(key.e().to_bytes_be()),
                        modulus: hex::encode_upper(key.n().to_bytes_be()),
                        certificate: false,
                        digest: CryptService::calculate_public_key_digest(&key, HashAlgorithm::Sha256),
                    }
                }
            };
            keys.push(letter);
        }
        Ok(Letters {
            host_id: bank.host_id.clone(),
            partner_id: user.partner_id.clone(),
            user_id: user.user_id.clone(),
            created: Utc::now(),
            keys,
        })
    }

    pub fn letter(&self, signature_type: SignatureType) -> Option<&KeyLetter> {
        self.keys.iter().find(|k| k.signature_type == signature_type)
    }

    /// Plain text rendering of both letters.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for order_type in ["INI", "HIA"] {
            let _ = writeln!(out, "{} letter", order_type);
            let _ = writeln!(out, "Host ID:    {}", self.host_id);
            let _ = writeln!(out, "Partner ID: {}", self.partner_id);
            let _ = writeln!(out, "User ID:    {}", self.user_id);
            let _ = writeln!(out, "Date:       {}", self.created.format("%Y-%m-%d %H:%M:%S UTC"));
            for key in self.keys.iter().filter(|k| k.order_type == order_type) {
                let _ = writeln!(out);
                let _ = writeln!(out, "{} key, version {}", key.signature_type, key.version);
                if key.certificate {
                    let _ = writeln!(out, "Certificate fingerprint (SHA-256):");
                } else {
                    let _ = writeln!(out, "Exponent: {}", key.exponent);
                    let _ = writeln!(out, "Modulus:  {}", key.modulus);
                    let _ = writeln!(out, "Hash (SHA-256):");
                }
                let _ = writeln!(out, "{}", key.formatted_digest());
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "Date, signature: ________________________");
            let _ = writeln!(out);
        }
        out
    }
}
