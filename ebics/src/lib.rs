//! EBICS client protocol engine.
//!
//! Builds, signs and encrypts EBICS requests for the protocol versions H003,
//! H004 and H005, verifies and decrypts the bank's responses, and drives
//! segmented upload and download transactions over a pluggable transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ebics::{ClientConfig, CryptService, EbicsClient, HttpTransport, Keyring};
//!
//! # fn main() -> ebics::Result<()> {
//! let config = ClientConfig::load("ebics.json")?;
//! let crypt = CryptService::new(Arc::new(config.storage_locator()));
//! let keyring = Keyring::new(config.version, "secret");
//! let transport = HttpTransport::new(config.timeout())?;
//! let mut client = EbicsClient::new(config, keyring, crypt, transport)?;
//! client.create_user_signatures()?;
//! client.ini()?;
//! client.hia()?;
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod keyring;
pub mod letters;
pub mod models;
pub mod orders;
pub mod request;
pub mod response;
pub mod transaction;
pub mod transport;
pub mod version;
pub mod xml;

#[cfg(test)]
mod test_support;

pub use client::EbicsClient;
pub use config::ClientConfig;
pub use crypto::{CryptService, SignatureVersion};
pub use error::{EbicsError, ProtocolContext, Result};
pub use keyring::manager::KeyringManager;
pub use keyring::storage::{KeyFormat, StorageLocator};
pub use keyring::{Keyring, Signature, SignatureType};
pub use letters::Letters;
pub use models::{Bank, User, UserStatus};
pub use orders::{DownloadOrder, DownloadedFile, InitializationOrder, Order, OrderResult, StandardOrder, UploadOrder};
pub use request::{Acknowledge, Service, TransactionPhase};
pub use transport::{FixtureTransport, HttpTransport, Transport};
pub use version::{Version, VersionConfig};
