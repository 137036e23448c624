#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use ebics::handlers::{AuthSignatureHandler, OrderDataHandler};
use ebics::keyring::storage::{DerStorage, KeyFormat, PemStorage, StorageLocator};
use ebics::version::XMLDSIG_NAMESPACE;
use ebics::xml::Element;
use ebics::{
    ClientConfig, CryptService, EbicsClient, FixtureTransport, Keyring, Signature, SignatureType, TransactionPhase,
    User, Version, VersionConfig,
};
use rsa::RsaPublicKey;

pub const PASSWORD: &str = "test-password";
pub const HOST_ID: &str = "EBIXQUAL";
pub const URL: &str = "https://ebics.bank.example/ebicsweb";

pub const USER_A_KEY: &str = include_str!("../../../data/test/keys/user_a.key.pem");
pub const USER_X_KEY: &str = include_str!("../../../data/test/keys/user_x.key.pem");
pub const USER_E_KEY: &str = include_str!("../../../data/test/keys/user_e.key.pem");
pub const BANK_X_KEY: &str = include_str!("../../../data/test/keys/bank_x.key.pem");
pub const BANK_E_KEY: &str = include_str!("../../../data/test/keys/bank_e.key.pem");
pub const USER_A_CERT: &str = include_str!("../../../data/test/keys/user_a.crt.pem");
pub const USER_X_CERT: &str = include_str!("../../../data/test/keys/user_x.crt.pem");
pub const USER_E_CERT: &str = include_str!("../../../data/test/keys/user_e.crt.pem");
pub const BANK_X_CERT: &str = include_str!("../../../data/test/keys/bank_x.crt.pem");
pub const BANK_E_CERT: &str = include_str!("../../../data/test/keys/bank_e.crt.pem");

pub fn locator() -> Arc<StorageLocator> {
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

pub fn crypt() -> CryptService {
    CryptService::new(locator())
}

pub fn der(cert_pem: &str) -> Vec<u8> {
    pem::parse(cert_pem).unwrap().contents().to_vec()
}

pub fn signature(signature_type: SignatureType, key_pem: &str, cert_pem: Option<&str>) -> Signature {
    let pair = crypt().import_key_pair(key_pem, PASSWORD).unwrap();
    let signature = Signature::new(signature_type, signature_type.default_version(), pair.public_key)
        .with_private_key(pair.private_key);
    match cert_pem {
        Some(cert) => signature.with_certificate(der(cert)),
        None => signature,
    }
}

/// The fixture user keys; certified for H005.
pub fn user_keyring(version: Version) -> Keyring {
    let certified = version == Version::H005;
    let mut keyring = Keyring::new(version, PASSWORD);
    keyring.set_user_signature(signature(SignatureType::A, USER_A_KEY, certified.then_some(USER_A_CERT)));
    keyring.set_user_signature(signature(SignatureType::X, USER_X_KEY, certified.then_some(USER_X_CERT)));
    keyring.set_user_signature(signature(SignatureType::E, USER_E_KEY, certified.then_some(USER_E_CERT)));
    keyring
}

/// Installs the public halves of the fixture bank keys.
pub fn with_bank_keys(mut keyring: Keyring) -> Keyring {
    let certified = keyring.version() == Version::H005;
    for (signature_type, key, cert) in [
        (SignatureType::X, BANK_X_KEY, BANK_X_CERT),
        (SignatureType::E, BANK_E_KEY, BANK_E_CERT),
    ] {
        let full = signature(signature_type, key, Some(cert));
        let mut public = Signature::new(signature_type, full.version(), full.public_key().clone());
        if certified {
            public = public.with_certificate(der(cert));
        }
        keyring.set_bank_signature(public).unwrap();
    }
    keyring
}

pub fn config(version: Version) -> ClientConfig {
    let mut config = ClientConfig::new(URL, HOST_ID, version, "PARTNER1", "USER1");
    config.kdf_iterations = 1_000;
    config
}

pub fn client(version: Version, keyring: Keyring, transport: FixtureTransport) -> EbicsClient<FixtureTransport> {
    EbicsClient::new(config(version), keyring, crypt(), transport).unwrap()
}

pub fn user_e_public_key() -> RsaPublicKey {
    signature(SignatureType::E, USER_E_KEY, None)
        .rsa_public_key(&locator())
        .unwrap()
}

/// Decrypts order data the way the bank would, with the bank E key.
pub fn bank_decrypt(wrapped_key: &[u8], encrypted: &[u8]) -> Vec<u8> {
    let bank_e = signature(SignatureType::E, BANK_E_KEY, None);
    let key = crypt()
        .decrypt_transaction_key(bank_e.private_key().unwrap(), PASSWORD, wrapped_key)
        .unwrap();
    CryptService::decompress(&CryptService::decrypt_by_key(&key, encrypted).unwrap()).unwrap()
}

/// Builds bank responses signed with the fixture bank X key.
pub struct TestBank {
    pub config: VersionConfig,
    signer: Keyring,
    crypt: CryptService,
}

impl TestBank {
    pub fn new(version: Version) -> Self {
        let mut signer = Keyring::new(version, PASSWORD);
        signer.set_user_signature(signature(SignatureType::X, BANK_X_KEY, Some(BANK_X_CERT)));
        signer.set_user_signature(signature(SignatureType::E, BANK_E_KEY, Some(BANK_E_CERT)));
        TestBank {
            config: VersionConfig::for_version(version),
            signer,
            crypt: crypt(),
        }
    }

    /// A bank that signs with a key the client does not know.
    pub fn impostor(version: Version) -> Self {
        TestBank {
            config: VersionConfig::for_version(version),
            signer: user_keyring(version),
            crypt: crypt(),
        }
    }

    fn root(&self, name: &str) -> Element {
        Element::new(name)
            .with_namespace("", self.config.namespace)
            .with_namespace("ds", XMLDSIG_NAMESPACE)
            .with_attr("Version", self.config.version.as_str())
            .with_attr("Revision", "1")
    }

    fn sign(&self, mut document: Element) -> String {
        AuthSignatureHandler::new(self.config)
            .sign(&mut document, &self.signer, &self.crypt)
            .unwrap();
        document.to_document()
    }

    /// Compresses and encrypts `data` for the user, cut into `parts` pieces.
    pub fn encrypt_for_user(data: &[u8], parts: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let key = CryptService::generate_transaction_key();
        let encrypted = CryptService::encrypt_by_key(&key, &CryptService::compress(data).unwrap()).unwrap();
        let wrapped = CryptService::encrypt_transaction_key(&user_e_public_key(), &key).unwrap();
        let size = (encrypted.len() + parts - 1) / parts;
        (wrapped, encrypted.chunks(size).map(<[u8]>::to_vec).collect())
    }

    fn data_transfer(wrapped_key: Option<&[u8]>, order_data: &[u8]) -> Element {
        use base64::{engine::general_purpose, Engine as _};
        let mut transfer = Element::new("DataTransfer");
        if let Some(key) = wrapped_key {
            transfer.push(
                Element::new("DataEncryptionInfo")
                    .with_attr("authenticate", "true")
                    .with_child(Element::text_element("TransactionKey", general_purpose::STANDARD.encode(key))),
            );
        }
        transfer.push(Element::text_element("OrderData", general_purpose::STANDARD.encode(order_data)));
        transfer
    }

    /// A signed `ebicsResponse`.
    #[allow(clippy::too_many_arguments)]
    pub fn transaction(
        &self,
        transaction_id: &str,
        phase: TransactionPhase,
        num_segments: Option<u32>,
        segment: Option<(u32, bool)>,
        order_id: Option<&str>,
        data_transfer: Option<Element>,
    ) -> String {
        let mut static_header = Element::new("static").with_child(Element::text_element("TransactionID", transaction_id));
        if let Some(n) = num_segments {
            static_header.push(Element::text_element("NumSegments", n.to_string()));
        }
        let mut mutable = Element::new("mutable").with_child(Element::text_element("TransactionPhase", phase.as_str()));
        if let Some((number, last)) = segment {
            mutable.push(
                Element::text_element("SegmentNumber", number.to_string())
                    .with_attr("lastSegment", if last { "true" } else { "false" }),
            );
        }
        if let Some(order_id) = order_id {
            mutable.push(Element::text_element("OrderID", order_id));
        }
        mutable.push(Element::text_element("ReturnCode", "000000"));
        mutable.push(Element::text_element("ReportText", "[EBICS_OK] OK"));

        let mut body = Element::new("body");
        if let Some(transfer) = data_transfer {
            body.push(transfer);
        }
        body.push(Element::text_element("ReturnCode", "000000").with_attr("authenticate", "true"));

        self.sign(
            self.root("ebicsResponse")
                .with_child(
                    Element::new("header")
                        .with_attr("authenticate", "true")
                        .with_child(static_header)
                        .with_child(mutable),
                )
                .with_child(body),
        )
    }

    /// Download responses: one Initialisation and the Transfer responses of segments 2..
    pub fn download(&self, transaction_id: &str, data: &[u8], parts: usize) -> (String, Vec<String>) {
        let (wrapped, segments) = Self::encrypt_for_user(data, parts);
        let total = segments.len() as u32;
        let init = self.transaction(
            transaction_id,
            TransactionPhase::Initialisation,
            Some(total),
            Some((1, total == 1)),
            None,
            Some(Self::data_transfer(Some(&wrapped), &segments[0])),
        );
        let transfers = segments
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, segment)| {
                let number = i as u32 + 1;
                self.transaction(
                    transaction_id,
                    TransactionPhase::Transfer,
                    None,
                    Some((number, number == total)),
                    None,
                    Some(Self::data_transfer(None, segment)),
                )
            })
            .collect();
        (init, transfers)
    }

    /// HPB response carrying the bank keys, encrypted for the user.
    pub fn hpb(&self) -> String {
        let order_data = OrderDataHandler::new(self.config)
            .hia_request_order_data(&self.signer, &locator(), &User::new("PARTNER1", "USER1"))
            .unwrap()
            .to_document();
        let (wrapped, segments) = Self::encrypt_for_user(order_data.as_bytes(), 1);
        let document = self
            .root("ebicsKeyManagementResponse")
            .with_child(
                Element::new("header")
                    .with_attr("authenticate", "true")
                    .with_child(Element::new("static"))
                    .with_child(
                        Element::new("mutable")
                            .with_child(Element::text_element("ReturnCode", "000000"))
                            .with_child(Element::text_element("ReportText", "[EBICS_OK] OK")),
                    ),
            )
            .with_child(
                Element::new("body")
                    .with_child(Self::data_transfer(Some(&wrapped), &segments[0]))
                    .with_child(Element::text_element("ReturnCode", "000000")),
            );
        document.to_document()
    }
}
