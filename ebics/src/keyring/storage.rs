//! Key material at rest.
//!
//! A [`Key`] is an opaque, serialisable blob plus the tags needed to find the
//! backend that understands it. Backends are registered with a
//! [`StorageLocator`], built once and handed to everything that has to turn
//! stored keys into usable RSA keys. Private keys only ever exist at rest as
//! PKCS#8 `EncryptedPrivateKeyInfo` (PBES2: PBKDF2-HMAC-SHA256 + AES-256-CBC).

use std::collections::HashMap;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use pkcs8::pkcs5::pbes2;
use pkcs8::{EncryptedPrivateKeyInfo, PrivateKeyInfo};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{EbicsError, Result};

/// PBKDF2 rounds used when wrapping private keys unless configured otherwise.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const ENCRYPTED_PRIVATE_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const CERTIFICATE_LABEL: &str = "CERTIFICATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// PEM text (SPKI public keys, encrypted PKCS#8 private keys).
    Pem,
    /// Base64 of the DER encoding (PKCS#1 public keys, encrypted PKCS#8 private keys).
    Der,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Public,
    Private,
}

/// Stored key material with its type and format tags.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    kind: KeyKind,
    format: KeyFormat,
    material: String,
}

impl Key {
    pub fn new(kind: KeyKind, format: KeyFormat, material: impl Into<String>) -> Self {
        Key {
            kind,
            format,
            material: material.into(),
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn format(&self) -> KeyFormat {
        self.format
    }

    pub fn material(&self) -> &str {
        &self.material
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("material_len", &self.material.len())
            .finish()
    }
}

/// A backend able to write and read one [`KeyFormat`].
///
/// Writing and reading are symmetric: reading what was written yields the
/// same key material.
pub trait KeyStorage: Send + Sync {
    fn format(&self) -> KeyFormat;

    fn write_public_key(&self, key: &RsaPublicKey) -> Result<Key>;

    fn read_public_key(&self, key: &Key) -> Result<RsaPublicKey>;

    /// Wraps `key` under `password`.
    fn write_private_key(&self, key: &RsaPrivateKey, password: &str, iterations: u32) -> Result<Key>;

    /// Unwraps a private key; a wrong password is a [`EbicsError::Credential`].
    fn read_private_key(&self, key: &Key, password: &str) -> Result<RsaPrivateKey>;

    fn write_certificate(&self, der: &[u8]) -> String;

    fn read_certificate(&self, stored: &str) -> Result<Vec<u8>>;
}

fn storage_err(e: impl fmt::Display) -> EbicsError {
    EbicsError::Storage(e.to_string())
}

fn expect_kind(key: &Key, kind: KeyKind) -> Result<()> {
    if key.kind != kind {
        return Err(EbicsError::Storage(format!(
            "expected a {:?} key, found a {:?} key",
            kind, key.kind
        )));
    }
    Ok(())
}

fn wrap_private_key(key: &RsaPrivateKey, password: &str, iterations: u32) -> Result<Vec<u8>> {
    let plain = key.to_pkcs8_der().map_err(storage_err)?;
    let info = PrivateKeyInfo::try_from(plain.as_bytes()).map_err(storage_err)?;

    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let params =
        pbes2::Parameters::pbkdf2_sha256_aes256cbc(iterations, &salt, &iv).map_err(storage_err)?;
    let encrypted = info
        .encrypt_with_params(params, password.as_bytes())
        .map_err(storage_err)?;
    Ok(encrypted.as_bytes().to_vec())
}

fn unwrap_private_key(der: &[u8], password: &str) -> Result<RsaPrivateKey> {
    let encrypted = EncryptedPrivateKeyInfo::try_from(der).map_err(storage_err)?;
    let plain = encrypted
        .decrypt(password.as_bytes())
        .map_err(|_| EbicsError::Credential("password does not unlock the private key".into()))?;
    RsaPrivateKey::from_pkcs8_der(plain.as_bytes())
        .map_err(|_| EbicsError::Credential("password does not unlock the private key".into()))
}

/// PEM text, the format keyrings are written in by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct PemStorage;

impl KeyStorage for PemStorage {
    fn format(&self) -> KeyFormat {
        KeyFormat::Pem
    }

    fn write_public_key(&self, key: &RsaPublicKey) -> Result<Key> {
        let pem = key.to_public_key_pem(LineEnding::LF).map_err(storage_err)?;
        Ok(Key::new(KeyKind::Public, KeyFormat::Pem, pem))
    }

    fn read_public_key(&self, key: &Key) -> Result<RsaPublicKey> {
        expect_kind(key, KeyKind::Public)?;
        let pem = pem::parse(key.material()).map_err(storage_err)?;
        match pem.tag() {
            "PUBLIC KEY" => RsaPublicKey::from_public_key_der(pem.contents()).map_err(storage_err),
            "RSA PUBLIC KEY" => RsaPublicKey::from_pkcs1_der(pem.contents()).map_err(storage_err),
            other => Err(EbicsError::Storage(format!("unexpected PEM label {}", other))),
        }
    }

    fn write_private_key(&self, key: &RsaPrivateKey, password: &str, iterations: u32) -> Result<Key> {
        let der = wrap_private_key(key, password, iterations)?;
        let pem = pem::encode(&pem::Pem::new(ENCRYPTED_PRIVATE_KEY_LABEL, der));
        Ok(Key::new(KeyKind::Private, KeyFormat::Pem, pem))
    }

    fn read_private_key(&self, key: &Key, password: &str) -> Result<RsaPrivateKey> {
        expect_kind(key, KeyKind::Private)?;
        let pem = pem::parse(key.material()).map_err(storage_err)?;
        if pem.tag() != ENCRYPTED_PRIVATE_KEY_LABEL {
            return Err(EbicsError::Storage(format!(
                "private keys must be stored encrypted, found PEM label {}",
                pem.tag()
            )));
        }
        unwrap_private_key(pem.contents(), password)
    }

    fn write_certificate(&self, der: &[u8]) -> String {
        pem::encode(&pem::Pem::new(CERTIFICATE_LABEL, der.to_vec()))
    }

    fn read_certificate(&self, stored: &str) -> Result<Vec<u8>> {
        let pem = pem::parse(stored).map_err(|e| EbicsError::Certificate(e.to_string()))?;
        if pem.tag() != CERTIFICATE_LABEL {
            return Err(EbicsError::Certificate(format!(
                "unexpected PEM label {}",
                pem.tag()
            )));
        }
        Ok(pem.contents().to_vec())
    }
}

/// Base64 DER, for embedding keys inline in a single document.
#[derive(Debug, Default, Clone, Copy)]
pub struct DerStorage;

impl DerStorage {
    fn decode(material: &str) -> Result<Vec<u8>> {
        general_purpose::STANDARD
            .decode(material.trim())
            .map_err(storage_err)
    }
}

impl KeyStorage for DerStorage {
    fn format(&self) -> KeyFormat {
        KeyFormat::Der
    }

    fn write_public_key(&self, key: &RsaPublicKey) -> Result<Key> {
        let der = key.to_pkcs1_der().map_err(storage_err)?;
        Ok(Key::new(
            KeyKind::Public,
            KeyFormat::Der,
            general_purpose::STANDARD.encode(der.as_bytes()),
        ))
    }

    fn read_public_key(&self, key: &Key) -> Result<RsaPublicKey> {
        expect_kind(key, KeyKind::Public)?;
        RsaPublicKey::from_pkcs1_der(&Self::decode(key.material())?).map_err(storage_err)
    }

    fn write_private_key(&self, key: &RsaPrivateKey, password: &str, iterations: u32) -> Result<Key> {
        let der = wrap_private_key(key, password, iterations)?;
        Ok(Key::new(
            KeyKind::Private,
            KeyFormat::Der,
            general_purpose::STANDARD.encode(der),
        ))
    }

    fn read_private_key(&self, key: &Key, password: &str) -> Result<RsaPrivateKey> {
        expect_kind(key, KeyKind::Private)?;
        unwrap_private_key(&Self::decode(key.material())?, password)
    }

    fn write_certificate(&self, der: &[u8]) -> String {
        general_purpose::STANDARD.encode(der)
    }

    fn read_certificate(&self, stored: &str) -> Result<Vec<u8>> {
        general_purpose::STANDARD
            .decode(stored.trim())
            .map_err(|e| EbicsError::Certificate(e.to_string()))
    }
}

/// Registry mapping each [`KeyFormat`] to its backend.
pub struct StorageLocator {
    backends: HashMap<KeyFormat, Box<dyn KeyStorage>>,
    default_format: KeyFormat,
    kdf_iterations: u32,
}

impl StorageLocator {
    /// An empty registry; see [`StorageLocator::default`] for the stock backends.
    pub fn new(default_format: KeyFormat, kdf_iterations: u32) -> Self {
        StorageLocator {
            backends: HashMap::new(),
            default_format,
            kdf_iterations,
        }
    }

    /// Registers `backend` for its format, replacing a previous one.
    pub fn register(&mut self, backend: Box<dyn KeyStorage>) {
        self.backends.insert(backend.format(), backend);
    }

    pub fn with_backend(mut self, backend: Box<dyn KeyStorage>) -> Self {
        self.register(backend);
        self
    }

    pub fn locate(&self, format: KeyFormat) -> Result<&dyn KeyStorage> {
        self.backends
            .get(&format)
            .map(|backend| backend.as_ref())
            .ok_or_else(|| EbicsError::Storage(format!("no storage registered for {:?}", format)))
    }

    /// Backend new keys are written with.
    pub fn default_storage(&self) -> Result<&dyn KeyStorage> {
        self.locate(self.default_format)
    }

    pub fn default_format(&self) -> KeyFormat {
        self.default_format
    }

    pub fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    pub fn read_public_key(&self, key: &Key) -> Result<RsaPublicKey> {
        self.locate(key.format())?.read_public_key(key)
    }

    pub fn read_private_key(&self, key: &Key, password: &str) -> Result<RsaPrivateKey> {
        self.locate(key.format())?.read_private_key(key, password)
    }

    /// Rewraps a stored private key under a new password, keeping its format.
    pub fn rewrap_private_key(&self, key: &Key, old_password: &str, new_password: &str) -> Result<Key> {
        let storage = self.locate(key.format())?;
        let private = storage.read_private_key(key, old_password)?;
        storage.write_private_key(&private, new_password, self.kdf_iterations)
    }
}

impl Default for StorageLocator {
    fn default() -> Self {
        StorageLocator::new(KeyFormat::Pem, DEFAULT_KDF_ITERATIONS)
            .with_backend(Box::new(PemStorage))
            .with_backend(Box::new(DerStorage))
    }
}

impl fmt::Debug for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut formats: Vec<_> = self.backends.keys().collect();
        formats.sort_by_key(|format| format!("{:?}", format));
        f.debug_struct("StorageLocator")
            .field("formats", &formats)
            .field("default_format", &self.default_format)
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}
