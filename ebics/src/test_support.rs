//! Keyrings built from the fixture keys in `data/test/keys`.

use std::sync::{Arc, OnceLock};

use crate::crypto::CryptService;
use crate::keyring::storage::{DerStorage, KeyFormat, PemStorage, StorageLocator};
use crate::keyring::{Keyring, Signature, SignatureType};
use crate::version::Version;

pub(crate) const PASSWORD: &str = "test-password";

pub(crate) const USER_A_KEY: &str = include_str!("../../data/test/keys/user_a.key.pem");
pub(crate) const USER_X_KEY: &str = include_str!("../../data/test/keys/user_x.key.pem");
pub(crate) const USER_E_KEY: &str = include_str!("../../data/test/keys/user_e.key.pem");
pub(crate) const BANK_X_KEY: &str = include_str!("../../data/test/keys/bank_x.key.pem");
pub(crate) const BANK_E_KEY: &str = include_str!("../../data/test/keys/bank_e.key.pem");

pub(crate) const USER_A_CERT: &str = include_str!("../../data/test/keys/user_a.crt.pem");
pub(crate) const USER_X_CERT: &str = include_str!("../../data/test/keys/user_x.crt.pem");
pub(crate) const USER_E_CERT: &str = include_str!("../../data/test/keys/user_e.crt.pem");
pub(crate) const BANK_X_CERT: &str = include_str!("../../data/test/keys/bank_x.crt.pem");
pub(crate) const BANK_E_CERT: &str = include_str!("../../data/test/keys/bank_e.crt.pem");

pub(crate) fn locator() -> Arc<StorageLocator> {
    static LOCATOR: OnceLock<Arc<StorageLocator>> = OnceLock::new();
    LOCATOR
        .get_or_init(|| {
            Arc::new(
                StorageLocator::new(KeyFormat::Pem, 1_000)
                    .with_backend(Box::new(PemStorage))
                    .with_backend(Box::new(DerStorage)),
            )
        })
        .clone()
}

pub(crate) fn crypt() -> CryptService {
    CryptService::new(locator())
}

pub(crate) fn der(cert_pem: &str) -> Vec<u8> {
    pem::parse(cert_pem).unwrap().contents().to_vec()
}

pub(crate) fn signature(signature_type: SignatureType, key_pem: &str, cert_pem: Option<&str>) -> Signature {
    let pair = crypt().import_key_pair(key_pem, PASSWORD).unwrap();
    let signature = Signature::new(signature_type, signature_type.default_version(), pair.public_key)
        .with_private_key(pair.private_key);
    match cert_pem {
        Some(cert) => signature.with_certificate(der(cert)),
        None => signature,
    }
}

/// User keys only; certificates are attached for H005.
pub(crate) fn keyring(version: Version) -> Keyring {
    let certified = version == Version::H005;
    let mut keyring = Keyring::new(version, PASSWORD);
    keyring.set_user_signature(signature(SignatureType::A, USER_A_KEY, certified.then_some(USER_A_CERT)));
    keyring.set_user_signature(signature(SignatureType::X, USER_X_KEY, certified.then_some(USER_X_CERT)));
    keyring.set_user_signature(signature(SignatureType::E, USER_E_KEY, certified.then_some(USER_E_CERT)));
    keyring
}

/// A keyring whose user keys are the fixture bank keys, for signing bank responses.
pub(crate) fn bank_keyring(version: Version) -> Keyring {
    let mut keyring = Keyring::new(version, PASSWORD);
    keyring.set_user_signature(signature(SignatureType::X, BANK_X_KEY, Some(BANK_X_CERT)));
    keyring.set_user_signature(signature(SignatureType::E, BANK_E_KEY, Some(BANK_E_CERT)));
    keyring
}
