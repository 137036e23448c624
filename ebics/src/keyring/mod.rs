//! The keyring: the user's three signature key pairs, the bank's two public
//! keys, and the password that unlocks the stored private keys.

pub mod manager;
pub mod storage;

use std::fmt;

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{EbicsError, Result};
use crate::version::Version;
use storage::{Key, StorageLocator};

/// The role a key pair plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureType {
    /// Order data signing (A005/A006).
    A,
    /// Authentication (X002).
    X,
    /// Encryption (E002).
    E,
}

impl SignatureType {
    /// The version tag used for new keys of this type.
    pub fn default_version(&self) -> &'static str {
        match self {
            SignatureType::A => "A006",
            SignatureType::X => "X002",
            SignatureType::E => "E002",
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            SignatureType::A => "A",
            SignatureType::X => "X",
            SignatureType::E => "E",
        };
        f.write_str(tag)
    }
}

/// One key pair (or, for the bank, one public key) together with its version tag
/// and optional X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    signature_type: SignatureType,
    version: String,
    public_key: Key,
    private_key: Option<Key>,
    certificate: Option<Vec<u8>>,
}

impl Signature {
    pub fn new(signature_type: SignatureType, version: impl Into<String>, public_key: Key) -> Self {
        Signature {
            signature_type,
            version: version.into(),
            public_key,
            private_key: None,
            certificate: None,
        }
    }

    pub fn with_private_key(mut self, private_key: Key) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Attaches DER-encoded certificate content.
    pub fn with_certificate(mut self, der: Vec<u8>) -> Self {
        self.certificate = Some(der);
        self
    }

    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn public_key(&self) -> &Key {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&Key> {
        self.private_key.as_ref()
    }

    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    pub fn is_certified(&self) -> bool {
        self.certificate.is_some()
    }

    pub fn rsa_public_key(&self, locator: &StorageLocator) -> Result<RsaPublicKey> {
        locator.read_public_key(&self.public_key)
    }
}

/// All cryptographic material of one EBICS connection.
pub struct Keyring {
    version: Version,
    password: Zeroizing<String>,
    user_a: Option<Signature>,
    user_x: Option<Signature>,
    user_e: Option<Signature>,
    bank_x: Option<Signature>,
    bank_e: Option<Signature>,
}

impl Keyring {
    pub fn new(version: Version, password: impl Into<String>) -> Self {
        Keyring {
            version,
            password: Zeroizing::new(password.into()),
            user_a: None,
            user_x: None,
            user_e: None,
            bank_x: None,
            bank_e: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn user_signature(&self, signature_type: SignatureType) -> Option<&Signature> {
        match signature_type {
            SignatureType::A => self.user_a.as_ref(),
            SignatureType::X => self.user_x.as_ref(),
            SignatureType::E => self.user_e.as_ref(),
        }
    }

    fn user_slot(&mut self, signature_type: SignatureType) -> &mut Option<Signature> {
        match signature_type {
            SignatureType::A => &mut self.user_a,
            SignatureType::X => &mut self.user_x,
            SignatureType::E => &mut self.user_e,
        }
    }

    pub fn set_user_signature(&mut self, signature: Signature) {
        let signature_type = signature.signature_type();
        *self.user_slot(signature_type) = Some(signature);
    }

    pub fn bank_signature(&self, signature_type: SignatureType) -> Option<&Signature> {
        match signature_type {
            SignatureType::X => self.bank_x.as_ref(),
            SignatureType::E => self.bank_e.as_ref(),
            SignatureType::A => None,
        }
    }

    pub fn set_bank_signature(&mut self, signature: Signature) -> Result<()> {
        match signature.signature_type() {
            SignatureType::X => self.bank_x = Some(signature),
            SignatureType::E => self.bank_e = Some(signature),
            SignatureType::A => {
                return Err(EbicsError::InvalidState(
                    "banks do not publish an order signature key".into(),
                ))
            }
        }
        Ok(())
    }

    pub fn require_user_signature(&self, signature_type: SignatureType) -> Result<&Signature> {
        self.user_signature(signature_type).ok_or_else(|| {
            EbicsError::InvalidState(format!("keyring has no user {} key", signature_type))
        })
    }

    pub fn require_bank_signature(&self, signature_type: SignatureType) -> Result<&Signature> {
        self.bank_signature(signature_type).ok_or_else(|| {
            EbicsError::InvalidState(format!(
                "keyring has no bank {} key, download it with HPB first",
                signature_type
            ))
        })
    }

    pub fn has_user_keys(&self) -> bool {
        self.user_a.is_some() && self.user_x.is_some() && self.user_e.is_some()
    }

    pub fn has_bank_keys(&self) -> bool {
        self.bank_x.is_some() && self.bank_e.is_some()
    }

    /// Unlocks the user's private key of the given type.
    pub fn user_private_key(
        &self,
        signature_type: SignatureType,
        locator: &StorageLocator,
    ) -> Result<RsaPrivateKey> {
        let signature = self.require_user_signature(signature_type)?;
        let key = signature.private_key().ok_or_else(|| {
            EbicsError::InvalidState(format!("user {} key has no private part", signature_type))
        })?;
        locator.read_private_key(key, &self.password)
    }

    fn user_signatures(&self) -> impl Iterator<Item = &Signature> {
        [&self.user_a, &self.user_x, &self.user_e]
            .into_iter()
            .filter_map(Option::as_ref)
    }

    /// True when every stored private key unlocks with the keyring password.
    pub fn check(&self, locator: &StorageLocator) -> bool {
        self.user_signatures()
            .filter_map(Signature::private_key)
            .all(|key| locator.read_private_key(key, &self.password).is_ok())
    }

    /// Rewraps every private key under `new_password`.
    ///
    /// All keys are rewrapped before any is replaced; on error the keyring is untouched.
    pub fn change_password(&mut self, locator: &StorageLocator, new_password: &str) -> Result<()> {
        let mut rewrapped = Vec::new();
        for signature in self.user_signatures() {
            if let Some(key) = signature.private_key() {
                let key = locator.rewrap_private_key(key, &self.password, new_password)?;
                rewrapped.push((signature.signature_type(), key));
            }
        }
        for (signature_type, key) in rewrapped {
            if let Some(signature) = self.user_slot(signature_type).as_mut() {
                signature.private_key = Some(key);
            }
        }
        self.password = Zeroizing::new(new_password.to_string());
        log::info!("keyring password changed");
        Ok(())
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("version", &self.version)
            .field("user_a", &self.user_a)
            .field("user_x", &self.user_x)
            .field("user_e", &self.user_e)
            .field("bank_x", &self.bank_x)
            .field("bank_e", &self.bank_e)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::storage::{KeyFormat, KeyKind};

    fn public(signature_type: SignatureType, material: &str) -> Signature {
        Signature::new(
            signature_type,
            signature_type.default_version(),
            Key::new(KeyKind::Public, KeyFormat::Der, material),
        )
    }

    #[test]
    fn user_signatures_land_in_their_own_slot() {
        let mut keyring = Keyring::new(Version::H004, "secret");
        keyring.set_user_signature(public(SignatureType::X, "x1"));
        keyring.set_user_signature(public(SignatureType::E, "e1"));
        assert!(keyring.user_signature(SignatureType::A).is_none());
        assert!(!keyring.has_user_keys());

        keyring.set_user_signature(public(SignatureType::A, "a1"));
        keyring.set_user_signature(public(SignatureType::X, "x2"));
        assert!(keyring.has_user_keys());
        assert_eq!(keyring.user_signature(SignatureType::X).unwrap().public_key().material(), "x2");
        assert_eq!(keyring.user_signature(SignatureType::E).unwrap().public_key().material(), "e1");
        assert!(keyring.bank_signature(SignatureType::X).is_none());
    }
}
