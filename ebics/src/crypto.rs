//! RSA, AES and digest primitives of the EBICS security procedures.
//!
//! Procedures of EBICS 2.5, chapter 11 and appendix 15:
//! * A005 / X002: RSASSA-PKCS1-v1_5 with SHA-256
//! * A006: RSASSA-PSS with SHA-256, MGF1-SHA-256 and a 32 byte salt
//! * E002: the transaction key is RSAES-PKCS1-v1_5 encrypted, order data is
//!   AES-128-CBC encrypted with ICV 0 and ANSI X9.23 padding

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use aes::cipher::block_padding::{AnsiX923, NoPadding};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{EbicsError, Result};
use crate::keyring::storage::{Key, StorageLocator};
use crate::version::SHA256_ALGORITHM;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const TRANSACTION_KEY_LENGTH: usize = 16;
const AES_BLOCK: usize = 16;
const ICV: [u8; AES_BLOCK] = [0; AES_BLOCK];

pub const DEFAULT_KEY_BITS: usize = 2048;
const MIN_KEY_BITS: usize = 1536;
const MAX_KEY_BITS: usize = 4096;

const ORDER_ID_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Maps an xmldsig/xmlenc digest URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        match uri {
            SHA256_ALGORITHM => Ok(HashAlgorithm::Sha256),
            "http://www.w3.org/2001/04/xmlenc#sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(EbicsError::Algorithm(format!("digest method {}", other))),
        }
    }
}

/// Versions of the signing procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVersion {
    A005,
    A006,
    X002,
}

impl SignatureVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureVersion::A005 => "A005",
            SignatureVersion::A006 => "A006",
            SignatureVersion::X002 => "X002",
        }
    }
}

impl fmt::Display for SignatureVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureVersion {
    type Err = EbicsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A005" => Ok(SignatureVersion::A005),
            "A006" => Ok(SignatureVersion::A006),
            "X002" => Ok(SignatureVersion::X002),
            other => Err(EbicsError::Algorithm(format!("signature version {}", other))),
        }
    }
}

/// A freshly generated key pair as stored material.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: Key,
    pub private_key: Key,
}

/// Cryptographic operations; key material is resolved through the shared storage locator.
#[derive(Debug, Clone)]
pub struct CryptService {
    locator: Arc<StorageLocator>,
}

impl CryptService {
    pub fn new(locator: Arc<StorageLocator>) -> Self {
        CryptService { locator }
    }

    pub fn locator(&self) -> &StorageLocator {
        &self.locator
    }

    pub fn shared_locator(&self) -> Arc<StorageLocator> {
        Arc::clone(&self.locator)
    }

    pub fn hash(data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
        match algorithm {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Signs a SHA-256 `digest` with a stored private key.
    pub fn sign(
        &self,
        private_key: &Key,
        password: &str,
        version: SignatureVersion,
        digest: &[u8],
    ) -> Result<Vec<u8>> {
        let key = self.locator.read_private_key(private_key, password)?;
        Self::sign_digest(&key, version, digest)
    }

    pub fn sign_digest(key: &RsaPrivateKey, version: SignatureVersion, digest: &[u8]) -> Result<Vec<u8>> {
        match version {
            SignatureVersion::A005 | SignatureVersion::X002 => key
                .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                .map_err(|e| EbicsError::Signing(e.to_string())),
            SignatureVersion::A006 => {
                let signature = key
                    .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), digest)
                    .map_err(|e| EbicsError::Signing(e.to_string()))?;
                Self::checked_pss_signature(&key.to_public_key(), digest, signature)
            }
        }
    }

    /// Releases a PSS signature only when it verifies against `public_key`.
    pub(crate) fn checked_pss_signature(
        public_key: &RsaPublicKey,
        digest: &[u8],
        signature: Vec<u8>,
    ) -> Result<Vec<u8>> {
        Self::verify(public_key, SignatureVersion::A006, digest, &signature).map_err(|_| {
            EbicsError::Signing("A006 signature failed self-verification".into())
        })?;
        Ok(signature)
    }

    pub fn verify(
        public_key: &RsaPublicKey,
        version: SignatureVersion,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let res = match version {
            SignatureVersion::A005 | SignatureVersion::X002 => {
                public_key.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            }
            SignatureVersion::A006 => public_key.verify(Pss::new::<Sha256>(), digest, signature),
        };
        res.map_err(|e| EbicsError::Signing(format!("{} signature does not verify: {}", version, e)))
    }

    /// AES-128-CBC with ICV 0 and ANSI X9.23 padding.
    pub fn encrypt_by_key(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes128CbcEnc::new_from_slices(key, &ICV)
            .map_err(|e| EbicsError::Crypto(format!("invalid transaction key: {}", e)))?;
        Ok(cipher.encrypt_padded_vec_mut::<AnsiX923>(data))
    }

    /// Inverse of [`CryptService::encrypt_by_key`].
    ///
    /// Blocks are decrypted raw and the pad length is taken from the final byte,
    /// which covers both ANSI X9.23 and ISO 10126 padding.
    pub fn decrypt_by_key(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % AES_BLOCK != 0 {
            return Err(EbicsError::Crypto(format!(
                "encrypted data of {} bytes is not block aligned",
                data.len()
            )));
        }
        let cipher = Aes128CbcDec::new_from_slices(key, &ICV)
            .map_err(|e| EbicsError::Crypto(format!("invalid transaction key: {}", e)))?;
        let mut plain = cipher
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|e| EbicsError::Crypto(e.to_string()))?;

        let pad = plain.last().copied().unwrap_or(0) as usize;
        if pad == 0 || pad > AES_BLOCK || pad > plain.len() {
            return Err(EbicsError::Crypto("invalid padding in decrypted data".into()));
        }
        plain.truncate(plain.len() - pad);
        Ok(plain)
    }

    pub fn encrypt_transaction_key(public_key: &RsaPublicKey, transaction_key: &[u8]) -> Result<Vec<u8>> {
        public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, transaction_key)
            .map_err(|e| EbicsError::Crypto(e.to_string()))
    }

    /// Unwraps the bank-issued transaction key with the user's E002 key.
    pub fn decrypt_transaction_key(&self, private_key: &Key, password: &str, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.locator.read_private_key(private_key, password)?;
        let transaction_key = key
            .decrypt(Pkcs1v15Encrypt, data)
            .map_err(|e| EbicsError::Crypto(format!("transaction key could not be decrypted: {}", e)))?;
        if transaction_key.len() != TRANSACTION_KEY_LENGTH {
            return Err(EbicsError::Crypto(format!(
                "transaction key has {} bytes, expected {}",
                transaction_key.len(),
                TRANSACTION_KEY_LENGTH
            )));
        }
        Ok(transaction_key)
    }

    /// Generates an RSA key pair; the private half is wrapped under `password`.
    pub fn generate_key_pair(&self, password: &str, algorithm: &str, bits: usize) -> Result<KeyPair> {
        if !algorithm.eq_ignore_ascii_case("rsa") {
            return Err(EbicsError::Algorithm(format!("key algorithm {}", algorithm)));
        }
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(EbicsError::Algorithm(format!(
                "RSA key length {} (supported {}..={})",
                bits, MIN_KEY_BITS, MAX_KEY_BITS
            )));
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| EbicsError::Crypto(e.to_string()))?;
        let storage = self.locator.default_storage()?;
        Ok(KeyPair {
            public_key: storage.write_public_key(&private.to_public_key())?,
            private_key: storage.write_private_key(&private, password, self.locator.kdf_iterations())?,
        })
    }

    /// Takes over an existing unencrypted PKCS#8 PEM private key, wrapping it under `password`.
    pub fn import_key_pair(&self, private_key_pem: &str, password: &str) -> Result<KeyPair> {
        use rsa::pkcs8::DecodePrivateKey;

        let private = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| EbicsError::Storage(format!("unreadable private key: {}", e)))?;
        let storage = self.locator.default_storage()?;
        Ok(KeyPair {
            public_key: storage.write_public_key(&private.to_public_key())?,
            private_key: storage.write_private_key(&private, password, self.locator.kdf_iterations())?,
        })
    }

    /// Digest of a public key as published in the initialisation letters and
    /// `BankPubKeyDigests`.
    ///
    /// The exponent and the modulus are written as lower case hex without
    /// leading zeros, joined by one blank, and the ASCII bytes are hashed.
    pub fn calculate_public_key_digest(public_key: &RsaPublicKey, algorithm: HashAlgorithm) -> Vec<u8> {
        let exponent = hex::encode(public_key.e().to_bytes_be());
        let modulus = hex::encode(public_key.n().to_bytes_be());
        let combined = format!(
            "{} {}",
            exponent.trim_start_matches('0'),
            modulus.trim_start_matches('0')
        );
        Self::hash(combined.as_bytes(), algorithm)
    }

    pub fn calculate_certificate_fingerprint(der: &[u8]) -> Vec<u8> {
        Self::hash(der, HashAlgorithm::Sha256)
    }

    /// 16 random bytes as 32 upper case hex characters.
    pub fn generate_nonce() -> String {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        hex::encode_upper(nonce)
    }

    pub fn generate_transaction_key() -> [u8; TRANSACTION_KEY_LENGTH] {
        let mut key = [0u8; TRANSACTION_KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// One upper case letter followed by three base-36 characters.
    pub fn generate_order_id() -> String {
        let mut rng = OsRng;
        let mut id = String::with_capacity(4);
        id.push(char::from(b'A' + rng.gen_range(0..26u8)));
        for _ in 0..3 {
            id.push(char::from(ORDER_ID_CHARS[rng.gen_range(0..ORDER_ID_CHARS.len())]));
        }
        id
    }

    /// zlib (RFC 1950), as EBICS order data is compressed.
    pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| EbicsError::Crypto(format!("order data could not be decompressed: {}", e)))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
    }

    #[test]
    fn test_aes_round_trip() {
        let key = CryptService::generate_transaction_key();
        for len in [0usize, 1, 15, 16, 17, 1000, 4096] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let encrypted = CryptService::encrypt_by_key(&key, &plain).unwrap();
            assert_eq!(encrypted.len() % 16, 0);
            assert!(encrypted.len() > plain.len());
            assert_eq!(CryptService::decrypt_by_key(&key, &encrypted).unwrap(), plain);
        }
    }

    #[test]
    fn test_aes_rejects_unaligned_input() {
        let key = CryptService::generate_transaction_key();
        assert!(CryptService::decrypt_by_key(&key, &[0u8; 15]).is_err());
        assert!(CryptService::decrypt_by_key(&key, &[]).is_err());
    }

    #[test]
    fn test_pss_signature_self_verifies() {
        let key = test_key();
        let digest = CryptService::hash(b"order data", HashAlgorithm::Sha256);
        let signature = CryptService::sign_digest(key, SignatureVersion::A006, &digest).unwrap();
        assert!(CryptService::verify(&key.to_public_key(), SignatureVersion::A006, &digest, &signature).is_ok());
    }

    #[test]
    fn test_corrupted_pss_signature_aborts() {
        let key = test_key();
        let digest = CryptService::hash(b"order data", HashAlgorithm::Sha256);
        let mut signature = CryptService::sign_digest(key, SignatureVersion::A006, &digest).unwrap();
        signature[10] ^= 0x01;
        match CryptService::checked_pss_signature(&key.to_public_key(), &digest, signature) {
            Err(EbicsError::Signing(_)) => {}
            other => panic!("expected a signing error, got {:?}", other),
        }
    }

    #[test]
    fn test_pkcs1_signature_verifies_and_detects_tampering() {
        let key = test_key();
        let digest = CryptService::hash(b"signed info", HashAlgorithm::Sha256);
        let signature = CryptService::sign_digest(key, SignatureVersion::X002, &digest).unwrap();
        let public = key.to_public_key();
        assert!(CryptService::verify(&public, SignatureVersion::X002, &digest, &signature).is_ok());
        let other = CryptService::hash(b"something else", HashAlgorithm::Sha256);
        assert!(CryptService::verify(&public, SignatureVersion::X002, &other, &signature).is_err());
    }

    #[test]
    fn test_transaction_key_unwrapping() {
        let locator = Arc::new(StorageLocator::new(crate::keyring::storage::KeyFormat::Pem, 1_000)
            .with_backend(Box::new(crate::keyring::storage::PemStorage)));
        let crypt = CryptService::new(locator.clone());
        let key = test_key();
        let stored = locator.default_storage().unwrap().write_private_key(key, "secret", 1_000).unwrap();

        let transaction_key = CryptService::generate_transaction_key();
        let wrapped = CryptService::encrypt_transaction_key(&key.to_public_key(), &transaction_key).unwrap();
        assert_eq!(crypt.decrypt_transaction_key(&stored, "secret", &wrapped).unwrap(), transaction_key);
        assert!(matches!(
            crypt.decrypt_transaction_key(&stored, "wrong", &wrapped),
            Err(EbicsError::Credential(_))
        ));
    }

    #[test]
    fn test_public_key_digest_strips_leading_zeros() {
        // e = 65537 -> "10001", n = 0x00ff -> "ff"
        let public = RsaPublicKey::new_unchecked(rsa::BigUint::from(0xffu32), rsa::BigUint::from(65537u32));
        let digest = CryptService::calculate_public_key_digest(&public, HashAlgorithm::Sha256);
        assert_eq!(digest, Sha256::digest(b"10001 ff").to_vec());
    }

    #[test]
    fn test_random_identifiers() {
        let nonce = CryptService::generate_nonce();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(nonce, CryptService::generate_nonce());

        for _ in 0..100 {
            let id = CryptService::generate_order_id();
            let bytes = id.as_bytes();
            assert_eq!(bytes.len(), 4);
            assert!(bytes[0].is_ascii_uppercase());
            assert!(bytes[1..].iter().all(|b| ORDER_ID_CHARS.contains(b)));
        }
    }

    #[test]
    fn test_compression_round_trip() {
        let data = b"<Document>statement</Document>".repeat(20);
        let compressed = CryptService::compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(CryptService::decompress(&compressed).unwrap(), data);
        assert!(CryptService::decompress(b"not zlib").is_err());
    }

    #[test]
    fn test_unknown_versions_and_algorithms() {
        assert!(matches!("E002".parse::<SignatureVersion>(), Err(EbicsError::Algorithm(_))));
        assert!(matches!(HashAlgorithm::from_uri("http://www.w3.org/2000/09/xmldsig#sha1"), Err(EbicsError::Algorithm(_))));
        let crypt = CryptService::new(Arc::new(StorageLocator::default()));
        assert!(matches!(crypt.generate_key_pair("pw", "rsa", 512), Err(EbicsError::Algorithm(_))));
        assert!(matches!(crypt.generate_key_pair("pw", "dsa", 2048), Err(EbicsError::Algorithm(_))));
    }
}
