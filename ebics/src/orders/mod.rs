//! Order descriptors.
//!
//! Every order belongs to one of four capability sets and fills a
//! [`RequestContext`] from its own parameters and the handlers it is bound
//! to. The client drives the exchange; orders only prepare and post-process.

mod download;
mod initialization;
mod standard;
mod upload;

#[cfg(test)]
mod test_orders;

pub use download::{DownloadOrder, DOWNLOAD_ORDER_TYPES};
pub use initialization::InitializationOrder;
pub use standard::StandardOrder;
pub use upload::{UploadOrder, UPLOAD_ORDER_TYPES};

use std::fmt;

use crate::crypto::CryptService;
use crate::error::{EbicsError, Result};
use crate::handlers::{OrderDataHandler, UserSignatureHandler};
use crate::keyring::Keyring;
use crate::request::{RequestContext, RequestFactory, Session};
use crate::response::Response;
use crate::transaction::UploadTransaction;
use crate::version::VersionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Initialization,
    Standard,
    Download,
    Upload,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Initialization => "initialization",
            Capability::Standard => "standard",
            Capability::Download => "download",
            Capability::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// The dependencies an order prepares its context with.
#[derive(Debug, Clone, Copy)]
pub struct Handlers {
    pub request_factory: RequestFactory,
    pub order_data_handler: OrderDataHandler,
    pub user_signature_handler: UserSignatureHandler,
}

impl Handlers {
    pub fn for_version(config: VersionConfig) -> Self {
        Handlers {
            request_factory: RequestFactory::new(config),
            order_data_handler: OrderDataHandler::new(config),
            user_signature_handler: UserSignatureHandler::new(config),
        }
    }

    pub fn config(&self) -> VersionConfig {
        self.request_factory.config()
    }
}

pub trait Order: fmt::Debug {
    fn order_type(&self) -> &str;

    fn capability(&self) -> Capability;

    fn bind(&mut self, handlers: Handlers);

    fn handlers(&self) -> Option<&Handlers>;

    /// Fills `ctx` for the Initialisation phase.
    fn prepare_context(&self, session: &Session<'_>, ctx: &mut RequestContext) -> Result<()>;

    /// Runs once the exchange succeeded.
    fn after_execute(&mut self, _result: &OrderResult, _keyring: &mut Keyring, _crypt: &CryptService) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn bound<'a>(order_type: &str, handlers: Option<&'a Handlers>) -> Result<&'a Handlers> {
    handlers.ok_or_else(|| EbicsError::InvalidState(format!("{} order is not bound to handlers", order_type)))
}

/// Hands the handlers of `from` to `to` and prepares `ctx` for `to`.
pub fn copy_context(from: &dyn Order, to: &mut dyn Order, session: &Session<'_>, ctx: &mut RequestContext) -> Result<()> {
    if from.capability() != to.capability() {
        return Err(EbicsError::IncompatibleOrder {
            from: format!("{} ({})", from.order_type(), from.capability()),
            to: format!("{} ({})", to.order_type(), to.capability()),
        });
    }
    let handlers = *bound(from.order_type(), from.handlers())?;
    to.bind(handlers);
    to.prepare_context(session, ctx)
}

/// One file of a download; archives yield one per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub name: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum OrderResult {
    Initialization {
        response: Response,
    },
    Standard {
        response: Response,
        /// Decrypted, decompressed order data, if the order returns any.
        order_data: Option<Vec<u8>>,
    },
    Download {
        response: Response,
        data: Vec<u8>,
        files: Vec<DownloadedFile>,
    },
    Upload {
        response: Response,
        transaction: UploadTransaction,
    },
}

impl OrderResult {
    /// The last response of the exchange.
    pub fn response(&self) -> &Response {
        match self {
            OrderResult::Initialization { response }
            | OrderResult::Standard { response, .. }
            | OrderResult::Download { response, .. }
            | OrderResult::Upload { response, .. } => response,
        }
    }

    pub fn order_data(&self) -> Option<&[u8]> {
        match self {
            OrderResult::Standard { order_data, .. } => order_data.as_deref(),
            OrderResult::Download { data, .. } => Some(data),
            _ => None,
        }
    }
}
