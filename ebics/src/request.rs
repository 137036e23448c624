//! Request context and the builders of every EBICS request document.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{CryptService, HashAlgorithm};
use crate::error::{EbicsError, ProtocolContext, Result};
use crate::handlers::AuthSignatureHandler;
use crate::keyring::{Keyring, Signature, SignatureType};
use crate::models::{Bank, User};
use crate::version::{VersionConfig, H000_NAMESPACE, SHA256_ALGORITHM, XMLDSIG_NAMESPACE};
use crate::xml::Element;

/// Decides on the receipt of a download: `true` sends a positive receipt.
pub type Acknowledge = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionPhase {
    Initialisation,
    Transfer,
    Receipt,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPhase::Initialisation => "Initialisation",
            TransactionPhase::Transfer => "Transfer",
            TransactionPhase::Receipt => "Receipt",
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionPhase {
    type Err = EbicsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Initialisation" => Ok(TransactionPhase::Initialisation),
            "Transfer" => Ok(TransactionPhase::Transfer),
            "Receipt" => Ok(TransactionPhase::Receipt),
            other => Err(EbicsError::protocol(
                format!("unknown transaction phase {}", other),
                ProtocolContext::default(),
            )),
        }
    }
}

/// Business transaction service of H005 BTD/BTU orders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// `ServiceName`, e.g. `STM` or `SCT`.
    pub name: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub option: Option<String>,
    /// `containerType`, e.g. `ZIP`.
    #[serde(default)]
    pub container: Option<String>,
    /// `MsgName`, e.g. `camt.053`.
    pub message_name: String,
    #[serde(default)]
    pub message_version: Option<String>,
}

impl Service {
    pub fn new(name: impl Into<String>, message_name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            message_name: message_name.into(),
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_message_version(mut self, version: impl Into<String>) -> Self {
        self.message_version = Some(version.into());
        self
    }

    fn to_element(&self) -> Element {
        let mut msg_name = Element::text_element("MsgName", self.message_name.as_str());
        if let Some(version) = &self.message_version {
            msg_name.set_attr("version", version.as_str());
        }
        Element::new("Service")
            .with_child(Element::text_element("ServiceName", self.name.as_str()))
            .with_opt_child(self.scope.as_deref().map(|s| Element::text_element("Scope", s)))
            .with_opt_child(self.option.as_deref().map(|o| Element::text_element("ServiceOption", o)))
            .with_opt_child(
                self.container
                    .as_deref()
                    .map(|c| Element::new("Container").with_attr("containerType", c)),
            )
            .with_child(msg_name)
    }
}

/// Everything one request is built from.
///
/// `segment_number`, `num_segments` and `last_segment` are only meaningful in
/// the Transfer phase and are always set together through [`RequestContext::set_segment`].
#[derive(Clone)]
pub struct RequestContext {
    pub order_type: String,
    pub order_attribute: Option<String>,
    pub phase: TransactionPhase,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// `FileFormat` of FDL/FUL.
    pub file_format: Option<String>,
    pub country_code: Option<String>,
    pub service: Option<Service>,
    /// Client-assigned order id (H003 uploads).
    pub order_id: Option<String>,
    pub transaction_id: Option<String>,
    pub transaction_key: Option<Zeroizing<Vec<u8>>>,
    segment_number: Option<u32>,
    num_segments: Option<u32>,
    last_segment: bool,
    /// Order data of the current request as it goes on the wire, before base64.
    pub order_data: Option<Vec<u8>>,
    /// Encrypted, compressed `UserSignatureData`.
    pub signature_data: Option<Vec<u8>>,
    /// SHA-256 of the plain order data.
    pub data_digest: Option<Vec<u8>>,
    pub signature_version: Option<String>,
    pub receipt_code: Option<u8>,
    pub language: String,
    pub product: String,
    pub acknowledge: Option<Acknowledge>,
}

impl RequestContext {
    pub fn new(order_type: impl Into<String>) -> Self {
        RequestContext {
            order_type: order_type.into(),
            order_attribute: None,
            phase: TransactionPhase::Initialisation,
            start_date: None,
            end_date: None,
            file_format: None,
            country_code: None,
            service: None,
            order_id: None,
            transaction_id: None,
            transaction_key: None,
            segment_number: None,
            num_segments: None,
            last_segment: false,
            order_data: None,
            signature_data: None,
            data_digest: None,
            signature_version: None,
            receipt_code: None,
            language: "en".into(),
            product: concat!("ebics-client ", env!("CARGO_PKG_VERSION")).into(),
            acknowledge: None,
        }
    }

    /// Marks the request as carrying segment `number` of `total`.
    pub fn set_segment(&mut self, number: u32, total: u32) -> Result<()> {
        if number == 0 || number > total {
            return Err(EbicsError::protocol(
                format!("segment {} of {} is out of range", number, total),
                self.protocol_context(),
            ));
        }
        self.segment_number = Some(number);
        self.num_segments = Some(total);
        self.last_segment = number == total;
        Ok(())
    }

    /// Announces the segment count of an upload without addressing a segment.
    pub fn set_num_segments(&mut self, total: u32) {
        self.segment_number = None;
        self.num_segments = Some(total);
        self.last_segment = false;
    }

    pub fn clear_segment(&mut self) {
        self.segment_number = None;
        self.num_segments = None;
        self.last_segment = false;
    }

    pub fn segment_number(&self) -> Option<u32> {
        self.segment_number
    }

    pub fn num_segments(&self) -> Option<u32> {
        self.num_segments
    }

    pub fn is_last_segment(&self) -> bool {
        self.last_segment
    }

    pub fn protocol_context(&self) -> ProtocolContext {
        ProtocolContext {
            order_type: Some(self.order_type.clone()),
            transaction_id: self.transaction_id.clone(),
            return_code: None,
        }
    }

    fn require_transaction_id(&self) -> Result<&str> {
        self.transaction_id.as_deref().ok_or_else(|| {
            EbicsError::protocol("request needs a transaction id", self.protocol_context())
        })
    }

    fn date_range(&self) -> Option<Element> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => Some(
                Element::new("DateRange")
                    .with_child(Element::text_element("Start", start.format("%Y-%m-%d").to_string()))
                    .with_child(Element::text_element("End", end.format("%Y-%m-%d").to_string())),
            ),
            _ => None,
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("order_type", &self.order_type)
            .field("phase", &self.phase)
            .field("file_format", &self.file_format)
            .field("service", &self.service)
            .field("transaction_id", &self.transaction_id)
            .field("segment_number", &self.segment_number)
            .field("num_segments", &self.num_segments)
            .field("last_segment", &self.last_segment)
            .field("acknowledge", &self.acknowledge.is_some())
            .finish_non_exhaustive()
    }
}

/// The connection a request is made for.
#[derive(Debug, Clone, Copy)]
pub struct Session<'a> {
    pub bank: &'a Bank,
    pub user: &'a User,
    pub keyring: &'a Keyring,
    pub crypt: &'a CryptService,
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn b64(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

/// Builds request documents for one protocol version.
#[derive(Debug, Clone, Copy)]
pub struct RequestFactory {
    config: VersionConfig,
    auth: AuthSignatureHandler,
}

impl RequestFactory {
    pub fn new(config: VersionConfig) -> Self {
        RequestFactory {
            config,
            auth: AuthSignatureHandler::new(config),
        }
    }

    pub fn config(&self) -> VersionConfig {
        self.config
    }

    pub fn auth_signature_handler(&self) -> &AuthSignatureHandler {
        &self.auth
    }

    fn root(&self, name: &str) -> Element {
        Element::new(name)
            .with_namespace("", self.config.namespace)
            .with_namespace("ds", XMLDSIG_NAMESPACE)
            .with_attr("Version", self.config.version.as_str())
            .with_attr("Revision", self.config.revision)
    }

    fn product(ctx: &RequestContext) -> Element {
        Element::text_element("Product", ctx.product.as_str()).with_attr("Language", ctx.language.as_str())
    }

    /// `OrderDetails` of the static header.
    fn order_details(&self, ctx: &RequestContext) -> Element {
        let mut details = Element::new("OrderDetails");
        if self.config.uses_admin_order_type() {
            details.push(Element::text_element("AdminOrderType", ctx.order_type.as_str()));
            match ctx.order_type.as_str() {
                "BTD" | "BTU" => {
                    let mut params = Element::new(format!("{}OrderParams", ctx.order_type));
                    if let Some(service) = &ctx.service {
                        params.push(service.to_element());
                    }
                    if let Some(range) = ctx.date_range() {
                        params.push(range);
                    }
                    details.push(params);
                }
                "INI" | "HIA" | "HPB" => {}
                _ => {
                    details.push(Element::new("StandardOrderParams").with_opt_child(ctx.date_range()));
                }
            }
            return details;
        }

        details.push(Element::text_element("OrderType", ctx.order_type.as_str()));
        if self.config.client_order_ids {
            if let Some(order_id) = &ctx.order_id {
                details.push(Element::text_element("OrderID", order_id.as_str()));
            }
        }
        if let Some(attribute) = &ctx.order_attribute {
            details.push(Element::text_element("OrderAttribute", attribute.as_str()));
        }
        match ctx.order_type.as_str() {
            "INI" | "HIA" | "HPB" => {}
            "FDL" | "FUL" => {
                let mut file_format =
                    Element::text_element("FileFormat", ctx.file_format.clone().unwrap_or_default());
                if let Some(country) = &ctx.country_code {
                    file_format.set_attr("CountryCode", country.as_str());
                }
                let params = Element::new(format!("{}OrderParams", ctx.order_type))
                    .with_opt_child(ctx.date_range())
                    .with_child(file_format);
                details.push(params);
            }
            _ => details.push(Element::new("StandardOrderParams").with_opt_child(ctx.date_range())),
        }
        details
    }

    fn digest_of(&self, signature: &Signature, session: &Session<'_>) -> Result<Vec<u8>> {
        match (self.config.certificates_only, signature.certificate()) {
            (true, Some(der)) => Ok(CryptService::calculate_certificate_fingerprint(der)),
            (true, None) => Err(EbicsError::Certificate(format!(
                "bank {} key has no certificate",
                signature.signature_type()
            ))),
            (false, _) => {
                let key = signature.rsa_public_key(session.crypt.locator())?;
                Ok(CryptService::calculate_public_key_digest(&key, HashAlgorithm::Sha256))
            }
        }
    }

    fn bank_pub_key_digests(&self, session: &Session<'_>) -> Result<Element> {
        let x = session.keyring.require_bank_signature(SignatureType::X)?;
        let e = session.keyring.require_bank_signature(SignatureType::E)?;
        Ok(Element::new("BankPubKeyDigests")
            .with_child(
                Element::text_element("Authentication", b64(&self.digest_of(x, session)?))
                    .with_attr("Version", x.version())
                    .with_attr("Algorithm", SHA256_ALGORITHM),
            )
            .with_child(
                Element::text_element("Encryption", b64(&self.digest_of(e, session)?))
                    .with_attr("Version", e.version())
                    .with_attr("Algorithm", SHA256_ALGORITHM),
            ))
    }

    /// `ebicsHEVRequest`, the unsigned version discovery.
    pub fn hev(&self, bank: &Bank) -> Element {
        Element::new("ebicsHEVRequest")
            .with_namespace("", H000_NAMESPACE)
            .with_child(Element::text_element("HostID", bank.host_id.as_str()))
    }

    /// `ebicsUnsecuredRequest` of INI and HIA.
    pub fn unsecured(&self, session: &Session<'_>, ctx: &RequestContext) -> Result<Element> {
        let order_data = ctx.order_data.as_deref().ok_or_else(|| {
            EbicsError::InvalidState(format!("{} request has no order data", ctx.order_type))
        })?;
        let header = Element::new("header")
            .with_attr("authenticate", "true")
            .with_child(
                Element::new("static")
                    .with_child(Element::text_element("HostID", session.bank.host_id.as_str()))
                    .with_child(Element::text_element("PartnerID", session.user.partner_id.as_str()))
                    .with_child(Element::text_element("UserID", session.user.user_id.as_str()))
                    .with_child(Self::product(ctx))
                    .with_child(self.order_details(ctx))
                    .with_child(Element::text_element("SecurityMedium", "0000")),
            )
            .with_child(Element::new("mutable"));
        Ok(self
            .root("ebicsUnsecuredRequest")
            .with_child(header)
            .with_child(
                Element::new("body").with_child(
                    Element::new("DataTransfer").with_child(Element::text_element("OrderData", b64(order_data))),
                ),
            ))
    }

    /// Signed `ebicsNoPubKeyDigestsRequest` of HPB.
    pub fn no_pub_key_digests(&self, session: &Session<'_>, ctx: &RequestContext) -> Result<Element> {
        let header = Element::new("header")
            .with_attr("authenticate", "true")
            .with_child(
                Element::new("static")
                    .with_child(Element::text_element("HostID", session.bank.host_id.as_str()))
                    .with_child(Element::text_element("Nonce", CryptService::generate_nonce()))
                    .with_child(Element::text_element("Timestamp", timestamp()))
                    .with_child(Element::text_element("PartnerID", session.user.partner_id.as_str()))
                    .with_child(Element::text_element("UserID", session.user.user_id.as_str()))
                    .with_child(Self::product(ctx))
                    .with_child(self.order_details(ctx))
                    .with_child(Element::text_element("SecurityMedium", "0000")),
            )
            .with_child(Element::new("mutable"));
        let mut document = self
            .root("ebicsNoPubKeyDigestsRequest")
            .with_child(header)
            .with_child(Element::new("body"));
        self.auth.sign(&mut document, session.keyring, session.crypt)?;
        Ok(document)
    }

    /// Signed `ebicsRequest` opening a download or upload transaction.
    pub fn initialization(&self, session: &Session<'_>, ctx: &RequestContext) -> Result<Element> {
        let mut static_header = Element::new("static")
            .with_child(Element::text_element("HostID", session.bank.host_id.as_str()))
            .with_child(Element::text_element("Nonce", CryptService::generate_nonce()))
            .with_child(Element::text_element("Timestamp", timestamp()))
            .with_child(Element::text_element("PartnerID", session.user.partner_id.as_str()))
            .with_child(Element::text_element("UserID", session.user.user_id.as_str()))
            .with_child(Self::product(ctx))
            .with_child(self.order_details(ctx))
            .with_child(self.bank_pub_key_digests(session)?)
            .with_child(Element::text_element("SecurityMedium", "0000"));
        if let Some(total) = ctx.num_segments() {
            static_header.push(Element::text_element("NumSegments", total.to_string()));
        }

        let header = Element::new("header")
            .with_attr("authenticate", "true")
            .with_child(static_header)
            .with_child(
                Element::new("mutable")
                    .with_child(Element::text_element("TransactionPhase", TransactionPhase::Initialisation.as_str())),
            );

        let mut body = Element::new("body");
        if let Some(signature_data) = &ctx.signature_data {
            body.push(self.upload_data_transfer(session, ctx, signature_data)?);
        }

        let mut document = self.root("ebicsRequest").with_child(header).with_child(body);
        self.auth.sign(&mut document, session.keyring, session.crypt)?;
        Ok(document)
    }

    fn upload_data_transfer(&self, session: &Session<'_>, ctx: &RequestContext, signature_data: &[u8]) -> Result<Element> {
        let transaction_key = ctx.transaction_key.as_ref().ok_or_else(|| {
            EbicsError::InvalidState("upload initialisation without transaction key".into())
        })?;
        let bank_e = session.keyring.require_bank_signature(SignatureType::E)?;
        let wrapped = CryptService::encrypt_transaction_key(
            &bank_e.rsa_public_key(session.crypt.locator())?,
            transaction_key,
        )?;

        let mut transfer = Element::new("DataTransfer")
            .with_child(
                Element::new("DataEncryptionInfo")
                    .with_attr("authenticate", "true")
                    .with_child(
                        Element::text_element("EncryptionPubKeyDigest", b64(&self.digest_of(bank_e, session)?))
                            .with_attr("Version", bank_e.version())
                            .with_attr("Algorithm", SHA256_ALGORITHM),
                    )
                    .with_child(Element::text_element("TransactionKey", b64(&wrapped))),
            )
            .with_child(Element::text_element("SignatureData", b64(signature_data)).with_attr("authenticate", "true"));

        if self.config.certificates_only {
            let digest = ctx.data_digest.as_deref().ok_or_else(|| {
                EbicsError::InvalidState("upload initialisation without data digest".into())
            })?;
            let mut data_digest = Element::text_element("DataDigest", b64(digest));
            if let Some(version) = &ctx.signature_version {
                data_digest.set_attr("SignatureVersion", version.as_str());
            }
            transfer.push(data_digest);
        }
        Ok(transfer)
    }

    fn transaction_header(&self, session: &Session<'_>, ctx: &RequestContext, mutable: Element) -> Result<Element> {
        Ok(Element::new("header")
            .with_attr("authenticate", "true")
            .with_child(
                Element::new("static")
                    .with_child(Element::text_element("HostID", session.bank.host_id.as_str()))
                    .with_child(Element::text_element("TransactionID", ctx.require_transaction_id()?)),
            )
            .with_child(mutable))
    }

    /// Signed Transfer-phase request; carries the segment in `order_data` for uploads.
    pub fn transfer(&self, session: &Session<'_>, ctx: &RequestContext) -> Result<Element> {
        let number = ctx.segment_number().ok_or_else(|| {
            EbicsError::protocol("transfer request without segment number", ctx.protocol_context())
        })?;
        let mutable = Element::new("mutable")
            .with_child(Element::text_element("TransactionPhase", TransactionPhase::Transfer.as_str()))
            .with_child(
                Element::text_element("SegmentNumber", number.to_string())
                    .with_attr("lastSegment", if ctx.is_last_segment() { "true" } else { "false" }),
            );
        let header = self.transaction_header(session, ctx, mutable)?;

        let mut body = Element::new("body");
        if let Some(segment) = &ctx.order_data {
            body.push(Element::new("DataTransfer").with_child(Element::text_element("OrderData", b64(segment))));
        }

        let mut document = self.root("ebicsRequest").with_child(header).with_child(body);
        self.auth.sign(&mut document, session.keyring, session.crypt)?;
        Ok(document)
    }

    /// Signed Receipt-phase request acknowledging a download.
    pub fn receipt(&self, session: &Session<'_>, ctx: &RequestContext) -> Result<Element> {
        let code = ctx.receipt_code.ok_or_else(|| {
            EbicsError::InvalidState("receipt request without receipt code".into())
        })?;
        let mutable = Element::new("mutable")
            .with_child(Element::text_element("TransactionPhase", TransactionPhase::Receipt.as_str()));
        let header = self.transaction_header(session, ctx, mutable)?;
        let body = Element::new("body").with_child(
            Element::new("TransferReceipt")
                .with_attr("authenticate", "true")
                .with_child(Element::text_element("ReceiptCode", code.to_string())),
        );

        let mut document = self.root("ebicsRequest").with_child(header).with_child(body);
        self.auth.sign(&mut document, session.keyring, session.crypt)?;
        Ok(document)
    }
}
