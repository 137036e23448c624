use serde::{Deserialize, Serialize};

use crate::version::Version;

/// The bank side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bank {
    pub host_id: String,
    pub url: String,
    pub version: Version,
}

impl Bank {
    pub fn new(host_id: impl Into<String>, url: impl Into<String>, version: Version) -> Self {
        Bank {
            host_id: host_id.into(),
            url: url.into(),
            version,
        }
    }
}

/// Subscriber state as the bank sees it (see HKD/HTD `UserInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserStatus {
    /// No keys sent yet.
    #[default]
    New,
    /// INI sent, HIA outstanding.
    PartlyInitializedIni,
    /// HIA sent, INI outstanding.
    PartlyInitializedHia,
    /// Keys sent, waiting for the bank to unlock them.
    Initialized,
    /// Unlocked; business orders are possible.
    Ready,
    Suspended,
}

impl UserStatus {
    /// Bank status codes of `UserInfo/@Status`.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(UserStatus::Ready),
            "1" => Some(UserStatus::New),
            "2" => Some(UserStatus::PartlyInitializedIni),
            "3" => Some(UserStatus::PartlyInitializedHia),
            "4" => Some(UserStatus::Initialized),
            "5" | "8" | "9" => Some(UserStatus::Suspended),
            _ => None,
        }
    }
}

/// The EBICS subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub partner_id: String,
    pub user_id: String,
    #[serde(default)]
    pub status: UserStatus,
}

impl User {
    pub fn new(partner_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        User {
            partner_id: partner_id.into(),
            user_id: user_id.into(),
            status: UserStatus::New,
        }
    }
}
