use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{SignatureVersion, DEFAULT_KEY_BITS};
use crate::error::{EbicsError, Result};
use crate::keyring::storage::{DerStorage, KeyFormat, PemStorage, StorageLocator, DEFAULT_KDF_ITERATIONS};
use crate::models::{Bank, User};
use crate::transaction::DEFAULT_SEGMENT_SIZE;
use crate::version::Version;

fn default_product() -> String {
    concat!("ebics-client ", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_signature_version() -> String {
    "A006".to_string()
}

fn default_key_bits() -> usize {
    DEFAULT_KEY_BITS
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

fn default_key_format() -> KeyFormat {
    KeyFormat::Pem
}

fn default_timeout_secs() -> u64 {
    60
}

fn yes() -> bool {
    true
}

/// Connection settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub bank_url: String,
    pub host_id: String,
    pub version: Version,
    pub partner_id: String,
    pub user_id: String,
    #[serde(default = "default_product")]
    pub product: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Raw bytes per upload segment.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Order signature version of new A keys (A005 or A006).
    #[serde(default = "default_signature_version")]
    pub signature_version: String,
    #[serde(default = "yes")]
    pub verify_bank_signature: bool,
    /// Close uploads with a Receipt request.
    #[serde(default = "yes")]
    pub upload_receipt: bool,
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default = "default_key_format")]
    pub key_format: KeyFormat,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(
        bank_url: impl Into<String>,
        host_id: impl Into<String>,
        version: Version,
        partner_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        ClientConfig {
            bank_url: bank_url.into(),
            host_id: host_id.into(),
            version,
            partner_id: partner_id.into(),
            user_id: user_id.into(),
            product: default_product(),
            language: default_language(),
            segment_size: default_segment_size(),
            signature_version: default_signature_version(),
            verify_bank_signature: true,
            upload_receipt: true,
            key_bits: default_key_bits(),
            kdf_iterations: default_kdf_iterations(),
            key_format: default_key_format(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(EbicsError::InvalidState("segment_size must be positive".into()));
        }
        match self.signature_version.parse::<SignatureVersion>()? {
            SignatureVersion::A005 | SignatureVersion::A006 => Ok(()),
            other => Err(EbicsError::Algorithm(format!("{} is not an order signature version", other))),
        }
    }

    pub fn bank(&self) -> Bank {
        Bank::new(self.host_id.as_str(), self.bank_url.as_str(), self.version)
    }

    pub fn user(&self) -> User {
        User::new(self.partner_id.as_str(), self.user_id.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The stock PEM and DER backends, new keys written in `key_format`.
    pub fn storage_locator(&self) -> StorageLocator {
        StorageLocator::new(self.key_format, self.kdf_iterations)
            .with_backend(Box::new(PemStorage))
            .with_backend(Box::new(DerStorage))
    }
}
