use zeroize::Zeroizing;

use super::{bound, Capability, Handlers, Order};
use crate::crypto::{CryptService, HashAlgorithm};
use crate::error::{EbicsError, Result};
use crate::keyring::SignatureType;
use crate::request::{RequestContext, Service, Session};
use crate::transaction::UploadTransaction;

pub const UPLOAD_ORDER_TYPES: &[&str] = &["FUL", "CCT", "CDD", "XE2", "BTU"];

/// Signed, encrypted upload of a payment or file.
#[derive(Debug)]
pub struct UploadOrder {
    order_type: String,
    payload: Vec<u8>,
    file_format: Option<String>,
    country_code: Option<String>,
    service: Option<Service>,
    transaction: Option<UploadTransaction>,
    handlers: Option<Handlers>,
}

impl UploadOrder {
    pub fn new(order_type: &str, payload: Vec<u8>) -> Result<Self> {
        if !UPLOAD_ORDER_TYPES.contains(&order_type) {
            return Err(EbicsError::InvalidState(format!("{} is not an upload order", order_type)));
        }
        Ok(UploadOrder {
            order_type: order_type.to_string(),
            payload,
            file_format: None,
            country_code: None,
            service: None,
            transaction: None,
            handlers: None,
        })
    }

    /// FUL of a bank-specific file format.
    pub fn ful(file_format: impl Into<String>, country_code: Option<String>, payload: Vec<u8>) -> Self {
        UploadOrder {
            order_type: "FUL".into(),
            payload,
            file_format: Some(file_format.into()),
            country_code,
            service: None,
            transaction: None,
            handlers: None,
        }
    }

    /// H005 business transaction upload.
    pub fn btu(service: Service, payload: Vec<u8>) -> Self {
        UploadOrder {
            order_type: "BTU".into(),
            payload,
            file_format: None,
            country_code: None,
            service: Some(service),
            transaction: None,
            handlers: None,
        }
    }

    /// The plain order data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn accept_transaction(&mut self, transaction: UploadTransaction) {
        self.transaction = Some(transaction);
    }

    pub fn transaction(&self) -> Option<&UploadTransaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut UploadTransaction> {
        self.transaction.as_mut()
    }

    pub fn take_transaction(&mut self) -> Option<UploadTransaction> {
        self.transaction.take()
    }
}

impl Order for UploadOrder {
    fn order_type(&self) -> &str {
        &self.order_type
    }

    fn capability(&self) -> Capability {
        Capability::Upload
    }

    fn bind(&mut self, handlers: Handlers) {
        self.handlers = Some(handlers);
    }

    fn handlers(&self) -> Option<&Handlers> {
        self.handlers.as_ref()
    }

    /// Signs the payload and encrypts the signature with the transaction key,
    /// generating the key unless `ctx` already holds one.
    fn prepare_context(&self, session: &Session<'_>, ctx: &mut RequestContext) -> Result<()> {
        let handlers = bound(&self.order_type, self.handlers())?;
        let config = handlers.config();
        config.supports(&self.order_type)?;
        if self.order_type == "BTU" && self.service.is_none() {
            return Err(EbicsError::InvalidState("BTU needs a service".into()));
        }

        let digest = CryptService::hash(&self.payload, HashAlgorithm::Sha256);
        let signature = handlers
            .user_signature_handler
            .handle(&digest, session.keyring, session.crypt, session.user)?;
        let key = ctx
            .transaction_key
            .get_or_insert_with(|| Zeroizing::new(CryptService::generate_transaction_key().to_vec()));
        let signature_data = CryptService::encrypt_by_key(
            key.as_slice(),
            &CryptService::compress(signature.to_document().as_bytes())?,
        )?;

        ctx.order_type = self.order_type.clone();
        ctx.order_attribute = (!config.uses_admin_order_type()).then(|| "OZHNN".to_string());
        if config.client_order_ids && ctx.order_id.is_none() {
            ctx.order_id = Some(CryptService::generate_order_id());
        }
        ctx.file_format = self.file_format.clone();
        ctx.country_code = self.country_code.clone();
        ctx.service = self.service.clone();
        ctx.signature_data = Some(signature_data);
        ctx.data_digest = Some(digest);
        ctx.signature_version = Some(session.keyring.require_user_signature(SignatureType::A)?.version().to_string());
        Ok(())
    }
}
