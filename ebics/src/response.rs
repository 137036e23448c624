//! Parsing of bank responses and their return codes.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};

use crate::error::{EbicsError, ProtocolContext, Result};
use crate::request::TransactionPhase;
use crate::version::{VersionConfig, H000_NAMESPACE};
use crate::xml::{self, Element};

const HEV_SCHEMA: &str = "ebics_hev.xsd";

/// Return codes that let an exchange continue.
const SUCCESS_CODES: &[&str] = &["000000", "011000", "011001", "031001"];

const CODE_NAMES: &[(&str, &str)] = &[
    ("000000", "EBICS_OK"),
    ("011000", "EBICS_DOWNLOAD_POSTPROCESS_DONE"),
    ("011001", "EBICS_DOWNLOAD_POSTPROCESS_SKIPPED"),
    ("011101", "EBICS_TX_SEGMENT_NUMBER_UNDERRUN"),
    ("031001", "EBICS_ORDER_PARAMS_IGNORED"),
    ("061001", "EBICS_AUTHENTICATION_FAILED"),
    ("061002", "EBICS_INVALID_REQUEST"),
    ("061099", "EBICS_INTERNAL_ERROR"),
    ("061101", "EBICS_TX_RECOVERY_SYNC"),
    ("090003", "EBICS_AUTHORISATION_ORDER_TYPE_FAILED"),
    ("090004", "EBICS_INVALID_ORDER_DATA_FORMAT"),
    ("090005", "EBICS_NO_DOWNLOAD_DATA_AVAILABLE"),
    ("090006", "EBICS_UNSUPPORTED_REQUEST_FOR_ORDER_INSTANCE"),
    ("091002", "EBICS_INVALID_USER_OR_USER_STATE"),
    ("091003", "EBICS_USER_UNKNOWN"),
    ("091004", "EBICS_INVALID_USER_STATE"),
    ("091005", "EBICS_INVALID_ORDER_TYPE"),
    ("091006", "EBICS_UNSUPPORTED_ORDER_TYPE"),
    ("091008", "EBICS_BANK_PUBKEY_UPDATE_REQUIRED"),
    ("091009", "EBICS_SEGMENT_SIZE_EXCEEDED"),
    ("091010", "EBICS_INVALID_XML"),
    ("091011", "EBICS_INVALID_HOST_ID"),
    ("091101", "EBICS_TX_UNKNOWN_TXID"),
    ("091102", "EBICS_TX_ABORT"),
    ("091103", "EBICS_TX_MESSAGE_REPLAY"),
    ("091104", "EBICS_TX_SEGMENT_NUMBER_EXCEEDED"),
    ("091112", "EBICS_INVALID_ORDER_PARAMS"),
    ("091113", "EBICS_INVALID_REQUEST_CONTENT"),
    ("091116", "EBICS_PROCESSING_ERROR"),
    ("091117", "EBICS_MAX_ORDER_DATA_SIZE_EXCEEDED"),
    ("091118", "EBICS_MAX_SEGMENTS_EXCEEDED"),
    ("091119", "EBICS_MAX_TRANSACTIONS_EXCEEDED"),
    ("091120", "EBICS_PARTNER_ID_MISMATCH"),
    ("091121", "EBICS_INCOMPATIBLE_ORDER_ATTRIBUTE"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

/// A six digit EBICS return code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnCode(String);

impl ReturnCode {
    pub fn new(code: impl Into<String>) -> Self {
        ReturnCode(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Symbolic name, e.g. `EBICS_OK`.
    pub fn name(&self) -> Option<&'static str> {
        CODE_NAMES.iter().find(|(code, _)| *code == self.0).map(|(_, name)| *name)
    }

    pub fn severity(&self) -> Severity {
        match self.0.get(..2) {
            Some("00") => Severity::Ok,
            Some("01") | Some("03") => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        SUCCESS_CODES.contains(&self.0.as_str())
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} {}", self.0, name),
            None => f.write_str(&self.0),
        }
    }
}

/// The three response document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// `ebicsHEVResponse`
    Hev,
    /// `ebicsKeyManagementResponse` of INI, HIA and HPB.
    KeyManagement,
    /// `ebicsResponse` of transactions.
    Transaction,
}

impl ResponseKind {
    fn root(&self) -> &'static str {
        match self {
            ResponseKind::Hev => "ebicsHEVResponse",
            ResponseKind::KeyManagement => "ebicsKeyManagementResponse",
            ResponseKind::Transaction => "ebicsResponse",
        }
    }
}

/// A protocol version offered in a HEV response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedVersion {
    pub protocol: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct Response {
    kind: ResponseKind,
    document: Element,
    raw: String,
    technical_code: ReturnCode,
    business_code: Option<ReturnCode>,
    report_text: Option<String>,
    transaction_id: Option<String>,
    phase: Option<TransactionPhase>,
    num_segments: Option<u32>,
    segment_number: Option<u32>,
    last_segment: bool,
    order_id: Option<String>,
    transaction_key: Option<Vec<u8>>,
    order_data: Option<Vec<u8>>,
    versions: Vec<SupportedVersion>,
}

impl Response {
    /// Parses `raw` and checks it against the structure of `expected`.
    pub fn parse(raw: &str, expected: ResponseKind, config: VersionConfig) -> Result<Self> {
        let (schema, namespace) = match expected {
            ResponseKind::Hev => (HEV_SCHEMA, H000_NAMESPACE),
            ResponseKind::KeyManagement => (config.key_management_schema, config.namespace),
            ResponseKind::Transaction => (config.response_schema, config.namespace),
        };
        let document = xml::parse(raw).map_err(|e| EbicsError::schema(schema, e.to_string()))?;
        if document.name != expected.root() {
            return Err(EbicsError::schema(
                schema,
                format!("expected <{}>, got <{}>", expected.root(), document.name),
            ));
        }
        if document.declared_namespace("") != Some(namespace) {
            return Err(EbicsError::schema(
                schema,
                format!("<{}> is not in namespace {}", document.name, namespace),
            ));
        }

        let required = |path: &[&str]| -> Result<String> {
            document
                .text_at(path)
                .ok_or_else(|| EbicsError::schema(schema, format!("{} is missing", path.join("/"))))
        };

        let mut response = Response {
            kind: expected,
            document: Element::default(),
            raw: raw.to_string(),
            technical_code: ReturnCode::new(""),
            business_code: None,
            report_text: None,
            transaction_id: None,
            phase: None,
            num_segments: None,
            segment_number: None,
            last_segment: false,
            order_id: None,
            transaction_key: None,
            order_data: None,
            versions: Vec::new(),
        };

        if expected == ResponseKind::Hev {
            response.technical_code = ReturnCode::new(required(&["SystemReturnCode", "ReturnCode"])?);
            response.report_text = document.text_at(&["SystemReturnCode", "ReportText"]);
            response.versions = document
                .children_named("VersionNumber")
                .map(|el| SupportedVersion {
                    protocol: el.attr("ProtocolVersion").unwrap_or_default().to_string(),
                    version: el.text().trim().to_string(),
                })
                .collect();
            response.document = document;
            return Ok(response);
        }

        let sections: [&[&str]; 3] = [&["header"], &["header", "mutable"], &["body"]];
        for path in sections {
            if document.find_path(path).is_none() {
                return Err(EbicsError::schema(schema, format!("{} is missing", path.join("/"))));
            }
        }
        response.technical_code = ReturnCode::new(required(&["header", "mutable", "ReturnCode"])?);
        response.business_code = Some(ReturnCode::new(required(&["body", "ReturnCode"])?));
        response.report_text = document.text_at(&["header", "mutable", "ReportText"]);
        response.order_id = document.text_at(&["header", "mutable", "OrderID"]);
        response.transaction_id = document.text_at(&["header", "static", "TransactionID"]);
        response.phase = match document.text_at(&["header", "mutable", "TransactionPhase"]) {
            Some(phase) => Some(phase.parse()?),
            None => None,
        };
        response.num_segments = parse_number(&document, &["header", "static", "NumSegments"], schema)?;
        response.segment_number = parse_number(&document, &["header", "mutable", "SegmentNumber"], schema)?;
        response.last_segment = document
            .find_path(&["header", "mutable", "SegmentNumber"])
            .and_then(|el| el.attr("lastSegment"))
            .map_or(false, |flag| flag == "true" || flag == "1");
        response.transaction_key = decode(
            &document,
            &["body", "DataTransfer", "DataEncryptionInfo", "TransactionKey"],
            schema,
        )?;
        response.order_data = decode(&document, &["body", "DataTransfer", "OrderData"], schema)?;
        response.document = document;
        Ok(response)
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn document(&self) -> &Element {
        &self.document
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn technical_code(&self) -> &ReturnCode {
        &self.technical_code
    }

    pub fn business_code(&self) -> Option<&ReturnCode> {
        self.business_code.as_ref()
    }

    pub fn report_text(&self) -> Option<&str> {
        self.report_text.as_deref()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn phase(&self) -> Option<TransactionPhase> {
        self.phase
    }

    pub fn num_segments(&self) -> Option<u32> {
        self.num_segments
    }

    pub fn segment_number(&self) -> Option<u32> {
        self.segment_number
    }

    pub fn is_last_segment(&self) -> bool {
        self.last_segment
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    /// The RSA-wrapped transaction key.
    pub fn transaction_key(&self) -> Option<&[u8]> {
        self.transaction_key.as_deref()
    }

    /// Order data as sent, base64 decoded.
    pub fn order_data(&self) -> Option<&[u8]> {
        self.order_data.as_deref()
    }

    pub fn versions(&self) -> &[SupportedVersion] {
        &self.versions
    }

    /// Fails with `Protocol` unless the technical and the business code both allow to continue.
    pub fn check(&self, order_type: &str) -> Result<()> {
        let failed = if !self.technical_code.is_success() {
            Some(&self.technical_code)
        } else {
            self.business_code.as_ref().filter(|code| !code.is_success())
        };
        if let Some(code) = failed {
            let context = ProtocolContext {
                order_type: Some(order_type.to_string()),
                transaction_id: self.transaction_id.clone(),
                return_code: Some(code.code().to_string()),
            };
            return Err(EbicsError::protocol(
                format!(
                    "bank returned {}{}",
                    code,
                    self.report_text.as_deref().map(|t| format!(": {}", t)).unwrap_or_default()
                ),
                context,
            ));
        }
        for code in std::iter::once(&self.technical_code).chain(self.business_code.as_ref()) {
            if code.severity() == Severity::Warning {
                log::warn!("{}: bank returned {}", order_type, code);
            }
        }
        Ok(())
    }
}

fn parse_number(document: &Element, path: &[&str], schema: &str) -> Result<Option<u32>> {
    match document.text_at(path) {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| EbicsError::schema(schema, format!("{} is not a number: {}", path.join("/"), text))),
        None => Ok(None),
    }
}

fn decode(document: &Element, path: &[&str], schema: &str) -> Result<Option<Vec<u8>>> {
    match document.find_path(path) {
        Some(el) => {
            let text: String = el.text().split_whitespace().collect();
            if text.is_empty() {
                return Ok(None);
            }
            general_purpose::STANDARD
                .decode(text)
                .map(Some)
                .map_err(|e| EbicsError::schema(schema, format!("{} is not base64: {}", path.join("/"), e)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    const HEV: &str = include_str!("../../data/test/hev_response.xml");
    const KEY_MANAGEMENT_OK: &str = include_str!("../../data/test/key_management_ok.xml");
    const DOWNLOAD_ERROR: &str = include_str!("../../data/test/download_no_data.xml");

    fn h004() -> VersionConfig {
        VersionConfig::for_version(Version::H004)
    }

    #[test]
    fn test_hev_response() {
        let response = Response::parse(HEV, ResponseKind::Hev, h004()).unwrap();
        assert!(response.technical_code().is_success());
        let versions: Vec<_> = response.versions().iter().map(|v| v.protocol.as_str()).collect();
        assert_eq!(versions, ["H003", "H004", "H005"]);
        assert_eq!(response.versions()[1].version, "02.50");
        response.check("HEV").unwrap();
    }

    #[test]
    fn test_key_management_response() {
        let response = Response::parse(KEY_MANAGEMENT_OK, ResponseKind::KeyManagement, h004()).unwrap();
        assert_eq!(response.technical_code().code(), "000000");
        assert_eq!(response.business_code().unwrap().name(), Some("EBICS_OK"));
        assert_eq!(response.report_text(), Some("[EBICS_OK] OK"));
        assert!(response.transaction_id().is_none());
        response.check("INI").unwrap();
    }

    #[test]
    fn test_business_error_becomes_protocol_error() {
        let response = Response::parse(DOWNLOAD_ERROR, ResponseKind::Transaction, h004()).unwrap();
        assert_eq!(response.phase(), Some(TransactionPhase::Initialisation));
        match response.check("STA") {
            Err(err @ EbicsError::Protocol { .. }) => {
                assert_eq!(err.return_code(), Some("090005"));
                assert!(err.to_string().contains("EBICS_NO_DOWNLOAD_DATA_AVAILABLE"));
                assert!(err.to_string().contains("STA"));
            }
            other => panic!("expected a protocol error, got {:?}", other),
        }
    }

    #[test]
    fn wrong_root_or_namespace_is_a_schema_error() {
        match Response::parse(KEY_MANAGEMENT_OK, ResponseKind::Transaction, h004()) {
            Err(EbicsError::Schema { schema, .. }) => assert_eq!(schema, "ebics_response_H004.xsd"),
            other => panic!("expected a schema error, got {:?}", other),
        }
        let h005 = VersionConfig::for_version(Version::H005);
        assert!(matches!(
            Response::parse(KEY_MANAGEMENT_OK, ResponseKind::KeyManagement, h005),
            Err(EbicsError::Schema { .. })
        ));
        assert!(matches!(
            Response::parse("<ebicsResponse", ResponseKind::Transaction, h004()),
            Err(EbicsError::Schema { .. })
        ));
    }

    #[test]
    fn missing_return_code_is_a_schema_error() {
        let xml = r#"<ebicsKeyManagementResponse xmlns="urn:org:ebics:H004"><header authenticate="true"><static/><mutable/></header><body/></ebicsKeyManagementResponse>"#;
        match Response::parse(xml, ResponseKind::KeyManagement, h004()) {
            Err(EbicsError::Schema { message, .. }) => assert!(message.contains("ReturnCode")),
            other => panic!("expected a schema error, got {:?}", other),
        }
    }

    #[test]
    fn return_code_classification() {
        assert_eq!(ReturnCode::new("000000").severity(), Severity::Ok);
        assert_eq!(ReturnCode::new("031001").severity(), Severity::Warning);
        assert!(ReturnCode::new("031001").is_success());
        assert!(ReturnCode::new("011000").is_success());
        assert!(!ReturnCode::new("061001").is_success());
        assert_eq!(ReturnCode::new("061001").severity(), Severity::Error);
        assert_eq!(ReturnCode::new("091002").to_string(), "091002 EBICS_INVALID_USER_OR_USER_STATE");
        assert_eq!(ReturnCode::new("099999").name(), None);
    }
}
