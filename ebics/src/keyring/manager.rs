//! Persistence of a [`Keyring`] as one JSON document.
//!
//! The document holds the key material exactly as the storage backends wrote
//! it (private keys stay wrapped), the PBKDF2 parameters and the protocol
//! version. The password itself is never written.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::storage::{Key, KeyFormat, StorageLocator};
use super::{Keyring, Signature, SignatureType};
use crate::error::{EbicsError, Result};
use crate::version::Version;

const DOCUMENT_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct KdfParameters {
    algorithm: String,
    iterations: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCertificate {
    format: KeyFormat,
    content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSignature {
    #[serde(rename = "type")]
    signature_type: SignatureType,
    version: String,
    public_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate: Option<StoredCertificate>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyringDocument {
    format: u32,
    protocol_version: Version,
    kdf: KdfParameters,
    user: Vec<StoredSignature>,
    bank: Vec<StoredSignature>,
}

/// Reads and writes keyrings through the shared storage locator.
#[derive(Debug, Clone)]
pub struct KeyringManager {
    locator: Arc<StorageLocator>,
}

impl KeyringManager {
    pub fn new(locator: Arc<StorageLocator>) -> Self {
        KeyringManager { locator }
    }

    fn store(&self, signature: &Signature) -> Result<StoredSignature> {
        let certificate = match signature.certificate() {
            Some(der) => {
                let storage = self.locator.default_storage()?;
                Some(StoredCertificate {
                    format: storage.format(),
                    content: storage.write_certificate(der),
                })
            }
            None => None,
        };
        Ok(StoredSignature {
            signature_type: signature.signature_type(),
            version: signature.version().to_string(),
            public_key: signature.public_key().clone(),
            private_key: signature.private_key().cloned(),
            certificate,
        })
    }

    fn restore(&self, stored: StoredSignature) -> Result<Signature> {
        let mut signature = Signature::new(stored.signature_type, stored.version, stored.public_key);
        if let Some(private_key) = stored.private_key {
            signature = signature.with_private_key(private_key);
        }
        if let Some(certificate) = stored.certificate {
            let der = self
                .locator
                .locate(certificate.format)?
                .read_certificate(&certificate.content)?;
            signature = signature.with_certificate(der);
        }
        Ok(signature)
    }

    pub fn to_json(&self, keyring: &Keyring) -> Result<String> {
        let user = [SignatureType::A, SignatureType::X, SignatureType::E]
            .into_iter()
            .filter_map(|t| keyring.user_signature(t))
            .map(|s| self.store(s))
            .collect::<Result<Vec<_>>>()?;
        let bank = [SignatureType::X, SignatureType::E]
            .into_iter()
            .filter_map(|t| keyring.bank_signature(t))
            .map(|s| self.store(s))
            .collect::<Result<Vec<_>>>()?;

        let document = KeyringDocument {
            format: DOCUMENT_FORMAT,
            protocol_version: keyring.version(),
            kdf: KdfParameters {
                algorithm: "PBKDF2-HMAC-SHA256".into(),
                iterations: self.locator.kdf_iterations(),
            },
            user,
            bank,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Rebuilds a keyring; the password is kept in memory for later unlocking.
    pub fn from_json(&self, json: &str, password: &str) -> Result<Keyring> {
        let document: KeyringDocument = serde_json::from_str(json)?;
        if document.format != DOCUMENT_FORMAT {
            return Err(EbicsError::Storage(format!(
                "unsupported keyring document format {}",
                document.format
            )));
        }

        let mut keyring = Keyring::new(document.protocol_version, password);
        for stored in document.user {
            if stored.private_key.is_none() {
                return Err(EbicsError::Storage(format!(
                    "user {} key is stored without its private part",
                    stored.signature_type
                )));
            }
            keyring.set_user_signature(self.restore(stored)?);
        }
        for stored in document.bank {
            keyring.set_bank_signature(self.restore(stored)?)?;
        }
        Ok(keyring)
    }

    pub fn save(&self, keyring: &Keyring, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json(keyring)?;
        // replaced atomically
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        log::debug!("keyring written to {}", path.display());
        Ok(())
    }

    pub fn load(&self, path: impl AsRef<Path>, password: &str) -> Result<Keyring> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        log::debug!("keyring read from {}", path.display());
        self.from_json(&json, password)
    }
}
