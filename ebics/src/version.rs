//! EBICS protocol versions and the per-version namespaces, schemas and order rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EbicsError, Result};

/// Namespace of the version-independent HEV exchange.
pub const H000_NAMESPACE: &str = "http://www.ebics.org/H000";
pub const XMLDSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const RSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// EBICS protocol versions this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// EBICS 2.4
    H003,
    /// EBICS 2.5
    H004,
    /// EBICS 3.0
    H005,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::H003 => "H003",
            Version::H004 => "H004",
            Version::H005 => "H005",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = EbicsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "H003" => Ok(Version::H003),
            "H004" => Ok(Version::H004),
            "H005" => Ok(Version::H005),
            other => Err(EbicsError::not_implemented("protocol version", other)),
        }
    }
}

// Orders every version knows.
const ADMIN_ORDERS: &[&str] = &["HEV", "INI", "HIA", "HPB", "HPD", "HKD", "HTD", "HAA", "HAC"];
// Order types replaced by BTD/BTU in EBICS 3.0.
const LEGACY_ORDERS: &[&str] = &[
    "PTK", "STA", "VMK", "C52", "C53", "C54", "Z53", "FDL", "FUL", "CCT", "CDD", "XE2",
];
const SERVICE_ORDERS: &[&str] = &["BTD", "BTU"];

/// Per-version constants handed to every handler by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionConfig {
    pub version: Version,
    /// Namespace of request and response documents.
    pub namespace: &'static str,
    /// Namespace of UserSignatureData and SignaturePubKeyOrderData.
    pub signature_namespace: &'static str,
    pub revision: &'static str,
    pub request_schema: &'static str,
    pub response_schema: &'static str,
    pub key_management_schema: &'static str,
    pub signature_schema: &'static str,
    /// The client assigns the order id of uploads itself.
    pub client_order_ids: bool,
    /// Key material is exchanged exclusively as X.509 certificates.
    pub certificates_only: bool,
}

impl VersionConfig {
    pub fn for_version(version: Version) -> Self {
        match version {
            Version::H003 => VersionConfig {
                version,
                namespace: "http://www.ebics.org/H003",
                signature_namespace: "http://www.ebics.org/S001",
                revision: "1",
                request_schema: "ebics_request_H003.xsd",
                response_schema: "ebics_response_H003.xsd",
                key_management_schema: "ebics_keymgmt_response_H003.xsd",
                signature_schema: "user_signature_S001.xsd",
                client_order_ids: true,
                certificates_only: false,
            },
            Version::H004 => VersionConfig {
                version,
                namespace: "urn:org:ebics:H004",
                signature_namespace: "http://www.ebics.org/S001",
                revision: "1",
                request_schema: "ebics_request_H004.xsd",
                response_schema: "ebics_response_H004.xsd",
                key_management_schema: "ebics_keymgmt_response_H004.xsd",
                signature_schema: "user_signature_S001.xsd",
                client_order_ids: false,
                certificates_only: false,
            },
            Version::H005 => VersionConfig {
                version,
                namespace: "urn:org:ebics:H005",
                signature_namespace: "http://www.ebics.org/S002",
                revision: "1",
                request_schema: "ebics_request_H005.xsd",
                response_schema: "ebics_response_H005.xsd",
                key_management_schema: "ebics_keymgmt_response_H005.xsd",
                signature_schema: "user_signature_S002.xsd",
                client_order_ids: false,
                certificates_only: true,
            },
        }
    }

    /// Orders are addressed through `AdminOrderType` plus service parameters.
    pub fn uses_admin_order_type(&self) -> bool {
        self.version == Version::H005
    }

    /// Fails with `NotImplemented` when `order_type` does not exist in this version.
    pub fn supports(&self, order_type: &str) -> Result<()> {
        let known = ADMIN_ORDERS.contains(&order_type)
            || match self.version {
                Version::H003 | Version::H004 => LEGACY_ORDERS.contains(&order_type),
                Version::H005 => SERVICE_ORDERS.contains(&order_type),
            };
        if known {
            Ok(())
        } else {
            Err(EbicsError::not_implemented(order_type, self.version.as_str()))
        }
    }
}

impl From<Version> for VersionConfig {
    fn from(version: Version) -> Self {
        VersionConfig::for_version(version)
    }
}
