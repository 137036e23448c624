use super::*;
use crate::keyring::SignatureType;
use crate::models::{Bank, User};
use crate::response::{Response, ResponseKind};
use crate::test_support::{bank_keyring, crypt, keyring};
use crate::version::Version;

const KEY_MANAGEMENT_OK: &str = include_str!("../../../data/test/key_management_ok.xml");

fn handlers(version: Version) -> Handlers {
    Handlers::for_version(VersionConfig::for_version(version))
}

fn bank(version: Version) -> Bank {
    Bank::new("EBIXQUAL", "https://bank.example/ebics", version)
}

#[test]
fn test_copy_context_between_download_orders() {
    let version = Version::H004;
    let (bank, user, keyring, crypt) = (bank(version), User::new("P", "U"), keyring(version), crypt());
    let session = Session { bank: &bank, user: &user, keyring: &keyring, crypt: &crypt };

    let mut sta = DownloadOrder::new("STA").unwrap();
    sta.bind(handlers(version));
    let mut vmk = DownloadOrder::new("VMK").unwrap();
    assert!(vmk.handlers().is_none());

    let mut ctx = RequestContext::new("STA");
    copy_context(&sta, &mut vmk, &session, &mut ctx).unwrap();
    assert!(vmk.handlers().is_some());
    assert_eq!(ctx.order_type, "VMK");
    assert_eq!(ctx.order_attribute.as_deref(), Some("DZHNN"));
}

#[test]
fn copy_context_into_other_capability_fails() {
    let version = Version::H004;
    let (bank, user, keyring, crypt) = (bank(version), User::new("P", "U"), keyring(version), crypt());
    let session = Session { bank: &bank, user: &user, keyring: &keyring, crypt: &crypt };

    let mut sta = DownloadOrder::new("STA").unwrap();
    sta.bind(handlers(version));
    let mut upload = UploadOrder::new("CCT", b"<Document/>".to_vec()).unwrap();
    let mut ctx = RequestContext::new("STA");
    match copy_context(&sta, &mut upload, &session, &mut ctx) {
        Err(EbicsError::IncompatibleOrder { from, to }) => {
            assert!(from.contains("STA"));
            assert!(to.contains("upload"));
        }
        other => panic!("expected IncompatibleOrder, got {:?}", other),
    }
    assert!(upload.handlers().is_none());
}

#[test]
fn unbound_order_cannot_prepare() {
    let version = Version::H004;
    let (bank, user, keyring, crypt) = (bank(version), User::new("P", "U"), keyring(version), crypt());
    let session = Session { bank: &bank, user: &user, keyring: &keyring, crypt: &crypt };
    let order = StandardOrder::hpb();
    let mut ctx = RequestContext::new("HPB");
    assert!(matches!(order.prepare_context(&session, &mut ctx), Err(EbicsError::InvalidState(_))));
}

#[test]
fn orders_missing_from_a_version_are_not_implemented() {
    let (user, crypt) = (User::new("P", "U"), crypt());
    for (version, order_type) in [(Version::H005, "STA"), (Version::H005, "FDL"), (Version::H004, "BTD")] {
        let bank = bank(version);
        let keyring = keyring(version);
        let session = Session { bank: &bank, user: &user, keyring: &keyring, crypt: &crypt };
        let mut order = DownloadOrder::new(order_type).unwrap();
        order.bind(handlers(version));
        match order.prepare_context(&session, &mut RequestContext::new(order_type)) {
            Err(EbicsError::NotImplemented { operation, version: v }) => {
                assert_eq!(operation, order_type);
                assert_eq!(v, version.as_str());
            }
            other => panic!("expected NotImplemented, got {:?}", other),
        }
    }
}

#[test]
fn test_ini_context_carries_compressed_order_data() {
    let version = Version::H004;
    let (bank, user, keyring, crypt) = (bank(version), User::new("P", "U"), keyring(version), crypt());
    let session = Session { bank: &bank, user: &user, keyring: &keyring, crypt: &crypt };

    let mut ini = InitializationOrder::ini();
    ini.bind(handlers(version));
    let mut ctx = RequestContext::new("INI");
    ini.prepare_context(&session, &mut ctx).unwrap();
    assert_eq!(ctx.order_attribute.as_deref(), Some("DZNNN"));

    let xml = CryptService::decompress(ctx.order_data.as_ref().unwrap()).unwrap();
    let doc = crate::xml::parse(std::str::from_utf8(&xml).unwrap()).unwrap();
    assert_eq!(doc.name, "SignaturePubKeyOrderData");
    assert_eq!(doc.text_at(&["PartnerID"]).as_deref(), Some("P"));
}

#[test]
fn test_upload_context_is_signed_and_encrypted() {
    let version = Version::H003;
    let (bank, user, keyring, crypt) = (bank(version), User::new("P", "U"), keyring(version), crypt());
    let session = Session { bank: &bank, user: &user, keyring: &keyring, crypt: &crypt };

    let mut order = UploadOrder::new("CCT", b"<Document>pain.001</Document>".to_vec()).unwrap();
    order.bind(handlers(version));
    let mut ctx = RequestContext::new("CCT");
    order.prepare_context(&session, &mut ctx).unwrap();

    // H003 assigns the order id on the client
    let order_id = ctx.order_id.clone().unwrap();
    assert_eq!(order_id.len(), 4);
    assert_eq!(ctx.order_attribute.as_deref(), Some("OZHNN"));
    assert_eq!(ctx.signature_version.as_deref(), Some("A006"));

    let key = ctx.transaction_key.clone().unwrap();
    let plain = CryptService::decrypt_by_key(&key, ctx.signature_data.as_ref().unwrap()).unwrap();
    let xml = CryptService::decompress(&plain).unwrap();
    let doc = crate::xml::parse(std::str::from_utf8(&xml).unwrap()).unwrap();
    assert_eq!(doc.name, "UserSignatureData");
}

#[test]
fn test_hpb_after_execute_installs_bank_keys() {
    let version = Version::H004;
    let crypt = crypt();
    let bank_keys = bank_keyring(version);
    let order_data = OrderDataHandler::new(VersionConfig::for_version(version))
        .hia_request_order_data(&bank_keys, crypt.locator(), &User::new("P", "U"))
        .unwrap();
    let response = Response::parse(
        KEY_MANAGEMENT_OK,
        ResponseKind::KeyManagement,
        VersionConfig::for_version(version),
    )
    .unwrap();
    let result = OrderResult::Standard {
        response,
        order_data: Some(order_data.to_document().into_bytes()),
    };

    let mut keyring = keyring(version);
    assert!(!keyring.has_bank_keys());
    let mut hpb = StandardOrder::hpb();
    hpb.bind(handlers(version));
    hpb.after_execute(&result, &mut keyring, &crypt).unwrap();
    assert!(keyring.has_bank_keys());
    let installed = keyring.bank_signature(SignatureType::E).unwrap().rsa_public_key(crypt.locator()).unwrap();
    let expected = bank_keys.user_signature(SignatureType::E).unwrap().rsa_public_key(crypt.locator()).unwrap();
    assert_eq!(installed, expected);

    // HEV has nothing to install
    let mut hev = StandardOrder::hev();
    hev.bind(handlers(version));
    hev.after_execute(&result, &mut keyring, &crypt).unwrap();
}

#[test]
fn unknown_order_types_are_rejected() {
    assert!(DownloadOrder::new("CCT").is_err());
    assert!(UploadOrder::new("STA", vec![]).is_err());
}
