//! The client facade.
//!
//! [`EbicsClient`] owns the keyring and a transport and drives every order
//! through its phases: orders prepare a [`RequestContext`], the client builds
//! and signs the requests, checks and verifies the responses, and moves the
//! segments of a transaction. There are no retries; the first failure ends
//! the transaction and is returned to the caller.

use std::io::{Cursor, Read};

use zeroize::Zeroizing;
use zip::ZipArchive;

use crate::certificate::certificate_public_key;
use crate::config::ClientConfig;
use crate::crypto::CryptService;
use crate::error::{EbicsError, ProtocolContext, Result};
use crate::keyring::{Keyring, Signature, SignatureType};
use crate::letters::Letters;
use crate::models::{Bank, User, UserStatus};
use crate::orders::{
    Capability, DownloadOrder, DownloadedFile, Handlers, InitializationOrder, Order, OrderResult, StandardOrder,
    UploadOrder,
};
use crate::request::{Acknowledge, RequestContext, Session, TransactionPhase};
use crate::response::{Response, ResponseKind, SupportedVersion};
use crate::transaction::{DownloadTransaction, UploadTransaction};
use crate::transport::Transport;
use crate::version::VersionConfig;
use crate::xml::Element;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

pub struct EbicsClient<T: Transport> {
    config: ClientConfig,
    bank: Bank,
    user: User,
    keyring: Keyring,
    crypt: CryptService,
    transport: T,
    handlers: Handlers,
}

impl<T: Transport> EbicsClient<T> {
    /// Fails if the keyring was made for another protocol version than the bank speaks.
    pub fn new(config: ClientConfig, keyring: Keyring, crypt: CryptService, transport: T) -> Result<Self> {
        config.validate()?;
        if keyring.version() != config.version {
            return Err(EbicsError::InvalidState(format!(
                "keyring is for {}, the bank is configured for {}",
                keyring.version(),
                config.version
            )));
        }
        Ok(EbicsClient {
            bank: config.bank(),
            user: config.user(),
            handlers: Handlers::for_version(VersionConfig::for_version(config.version)),
            config,
            keyring,
            crypt,
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn keyring_mut(&mut self) -> &mut Keyring {
        &mut self.keyring
    }

    pub fn into_keyring(self) -> Keyring {
        self.keyring
    }

    pub fn crypt(&self) -> &CryptService {
        &self.crypt
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn session(&self) -> Session<'_> {
        Session {
            bank: &self.bank,
            user: &self.user,
            keyring: &self.keyring,
            crypt: &self.crypt,
        }
    }

    fn context(&self, order_type: &str) -> RequestContext {
        let mut ctx = RequestContext::new(order_type);
        ctx.product = self.config.product.clone();
        ctx.language = self.config.language.clone();
        ctx
    }

    /// Posts `document` and returns the parsed, checked and (for transactions) verified response.
    fn exchange(&self, document: &Element, kind: ResponseKind, ctx: &RequestContext) -> Result<Response> {
        log::debug!("{} {}: sending <{}> to {}", ctx.order_type, ctx.phase, document.name, self.bank.url);
        let raw = self.transport.post(&self.bank.url, &document.to_document())?;
        let response = Response::parse(&raw, kind, self.handlers.config())?;
        response.check(&ctx.order_type)?;
        if kind == ResponseKind::Transaction && self.config.verify_bank_signature {
            let bank_x = self
                .keyring
                .require_bank_signature(SignatureType::X)?
                .rsa_public_key(self.crypt.locator())?;
            self.handlers
                .request_factory
                .auth_signature_handler()
                .verify(response.document(), &bank_x)
                .map_err(|e| with_context(e, ctx))?;
        }
        Ok(response)
    }

    fn expect_capability(order: &dyn Order, capability: Capability) -> Result<()> {
        if order.capability() == capability {
            Ok(())
        } else {
            Err(EbicsError::InvalidState(format!(
                "{} is a {} order, not a {} order",
                order.order_type(),
                order.capability(),
                capability
            )))
        }
    }

    /// Unwraps the transaction key with the user's E key.
    fn transaction_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let e = self.keyring.require_user_signature(SignatureType::E)?;
        let private = e
            .private_key()
            .ok_or_else(|| EbicsError::InvalidState("user E key has no private part".into()))?;
        Ok(Zeroizing::new(self.crypt.decrypt_transaction_key(private, self.keyring.password(), wrapped)?))
    }

    fn decrypt_order_data(&self, wrapped_key: &[u8], encrypted: &[u8]) -> Result<Vec<u8>> {
        let key = self.transaction_key(wrapped_key)?;
        CryptService::decompress(&CryptService::decrypt_by_key(&key, encrypted)?)
    }

    /// Generates the user's A, X and E key pairs, wrapped under the keyring password.
    pub fn create_user_signatures(&mut self) -> Result<()> {
        if self.keyring.has_user_keys() {
            return Err(EbicsError::InvalidState("the keyring already holds user keys".into()));
        }
        for (signature_type, version) in [
            (SignatureType::A, self.config.signature_version.as_str()),
            (SignatureType::X, SignatureType::X.default_version()),
            (SignatureType::E, SignatureType::E.default_version()),
        ] {
            let pair = self
                .crypt
                .generate_key_pair(self.keyring.password(), "rsa", self.config.key_bits)?;
            self.keyring.set_user_signature(
                Signature::new(signature_type, version, pair.public_key).with_private_key(pair.private_key),
            );
            log::info!("generated {} key ({}, {} bits)", signature_type, version, self.config.key_bits);
        }
        Ok(())
    }

    /// Attaches a certificate to a user key; the certificate must certify that very key.
    pub fn set_user_certificate(&mut self, signature_type: SignatureType, der: Vec<u8>) -> Result<()> {
        let signature = self.keyring.require_user_signature(signature_type)?.clone();
        if certificate_public_key(&der)? != signature.rsa_public_key(self.crypt.locator())? {
            return Err(EbicsError::Certificate(format!(
                "certificate does not match the user {} key",
                signature_type
            )));
        }
        self.keyring.set_user_signature(signature.with_certificate(der));
        Ok(())
    }

    pub fn letters(&self) -> Result<Letters> {
        Letters::new(&self.bank, &self.user, &self.keyring, self.crypt.locator())
    }

    /// Protocol versions the bank supports.
    pub fn hev(&mut self) -> Result<Vec<SupportedVersion>> {
        let result = self.execute_standard(&mut StandardOrder::hev())?;
        Ok(result.response().versions().to_vec())
    }

    pub fn ini(&mut self) -> Result<OrderResult> {
        self.execute_initialization(&mut InitializationOrder::ini())
    }

    pub fn hia(&mut self) -> Result<OrderResult> {
        self.execute_initialization(&mut InitializationOrder::hia())
    }

    /// Downloads the bank keys into the keyring.
    pub fn hpb(&mut self) -> Result<OrderResult> {
        self.execute_standard(&mut StandardOrder::hpb())
    }

    pub fn download(&mut self, order: &mut DownloadOrder, acknowledge: Option<Acknowledge>) -> Result<OrderResult> {
        self.execute_download(order, acknowledge)
    }

    pub fn upload(&mut self, order: &mut UploadOrder) -> Result<OrderResult> {
        self.execute_upload(order)
    }

    /// Sends INI or HIA as an unsecured request.
    pub fn execute_initialization(&mut self, order: &mut dyn Order) -> Result<OrderResult> {
        Self::expect_capability(order, Capability::Initialization)?;
        order.bind(self.handlers);
        let mut ctx = self.context(order.order_type());
        order.prepare_context(&self.session(), &mut ctx)?;

        let document = self.handlers.request_factory.unsecured(&self.session(), &ctx)?;
        let response = self.exchange(&document, ResponseKind::KeyManagement, &ctx)?;
        let result = OrderResult::Initialization { response };
        order.after_execute(&result, &mut self.keyring, &self.crypt)?;

        self.user.status = match (ctx.order_type.as_str(), self.user.status) {
            ("INI", UserStatus::PartlyInitializedHia) | ("HIA", UserStatus::PartlyInitializedIni) => {
                UserStatus::Initialized
            }
            ("INI", UserStatus::New) => UserStatus::PartlyInitializedIni,
            ("HIA", UserStatus::New) => UserStatus::PartlyInitializedHia,
            (_, status) => status,
        };
        log::info!("{} accepted, user status {:?}", ctx.order_type, self.user.status);
        Ok(result)
    }

    /// HEV, or HPB with its encrypted order data decrypted.
    pub fn execute_standard(&mut self, order: &mut dyn Order) -> Result<OrderResult> {
        Self::expect_capability(order, Capability::Standard)?;
        order.bind(self.handlers);
        let mut ctx = self.context(order.order_type());
        order.prepare_context(&self.session(), &mut ctx)?;

        let factory = self.handlers.request_factory;
        let result = if ctx.order_type == "HEV" {
            let response = self.exchange(&factory.hev(&self.bank), ResponseKind::Hev, &ctx)?;
            OrderResult::Standard { response, order_data: None }
        } else {
            let document = factory.no_pub_key_digests(&self.session(), &ctx)?;
            let response = self.exchange(&document, ResponseKind::KeyManagement, &ctx)?;
            let order_data = match (response.transaction_key(), response.order_data()) {
                (Some(key), Some(data)) => Some(self.decrypt_order_data(key, data)?),
                (None, Some(_)) => {
                    return Err(EbicsError::protocol(
                        "order data without a transaction key",
                        ctx.protocol_context(),
                    ))
                }
                _ => None,
            };
            OrderResult::Standard { response, order_data }
        };
        order.after_execute(&result, &mut self.keyring, &self.crypt)?;

        if ctx.order_type == "HPB" {
            self.user.status = UserStatus::Ready;
        }
        log::info!("{} done", ctx.order_type);
        Ok(result)
    }

    /// Runs a download through Initialisation, Transfer and Receipt.
    ///
    /// `acknowledge` sees the decompressed data and decides the receipt code;
    /// without one the download is acknowledged. A rejected download is
    /// answered with a negative receipt and then reported as `Protocol`.
    pub fn execute_download(&mut self, order: &mut dyn Order, acknowledge: Option<Acknowledge>) -> Result<OrderResult> {
        Self::expect_capability(order, Capability::Download)?;
        order.bind(self.handlers);
        let mut ctx = self.context(order.order_type());
        order.prepare_context(&self.session(), &mut ctx)?;
        ctx.acknowledge = acknowledge;

        let factory = self.handlers.request_factory;
        let init = self.exchange(&factory.initialization(&self.session(), &ctx)?, ResponseKind::Transaction, &ctx)?;
        let missing = |what: &str, ctx: &RequestContext| {
            EbicsError::protocol(format!("initialisation response carries no {}", what), ctx.protocol_context())
        };
        let id = init
            .transaction_id()
            .ok_or_else(|| missing("transaction id", &ctx))?
            .to_string();
        ctx.transaction_id = Some(id.clone());
        let num_segments = init.num_segments().ok_or_else(|| missing("segment count", &ctx))?;
        let wrapped_key = init
            .transaction_key()
            .ok_or_else(|| missing("transaction key", &ctx))?
            .to_vec();
        let mut transaction = DownloadTransaction::new(ctx.order_type.as_str(), id, num_segments, wrapped_key)?;
        receive_segment(&mut transaction, &init, 1, &ctx)?;
        log::info!(
            "{} transaction {} opened, {} segment(s)",
            ctx.order_type,
            transaction.id(),
            num_segments
        );

        ctx.phase = TransactionPhase::Transfer;
        while let Some(next) = transaction.next_segment() {
            ctx.set_segment(next, num_segments)?;
            let response = self.exchange(&factory.transfer(&self.session(), &ctx)?, ResponseKind::Transaction, &ctx)?;
            same_transaction(&response, &ctx)?;
            receive_segment(&mut transaction, &response, next, &ctx)?;
        }
        ctx.clear_segment();

        let encrypted = transaction.finalize()?;
        let processed = self
            .decrypt_order_data(transaction.wrapped_key(), &encrypted)
            .and_then(|data| unpack(&data, &ctx).map(|files| (data, files)));
        let accepted = match &processed {
            Ok((data, _)) => ctx.acknowledge.as_ref().map_or(true, |ack| ack(data)),
            Err(_) => false,
        };

        ctx.phase = TransactionPhase::Receipt;
        ctx.receipt_code = Some(if accepted { 0 } else { 1 });
        let receipt = self.exchange(&factory.receipt(&self.session(), &ctx)?, ResponseKind::Transaction, &ctx)?;
        same_transaction(&receipt, &ctx)?;
        let (data, files) = match processed {
            Ok(processed) => processed,
            Err(err) => {
                log::warn!(
                    "{} transaction {}: order data unusable, negative receipt sent",
                    ctx.order_type,
                    transaction.id()
                );
                return Err(err);
            }
        };
        if !accepted {
            log::warn!("{} transaction {}: negative receipt sent", ctx.order_type, transaction.id());
            return Err(EbicsError::protocol(
                "download was not acknowledged",
                ctx.protocol_context(),
            ));
        }

        let result = OrderResult::Download {
            response: receipt,
            data,
            files,
        };
        order.after_execute(&result, &mut self.keyring, &self.crypt)?;
        log::info!("{} transaction {} done", ctx.order_type, transaction.id());
        Ok(result)
    }

    /// Runs an upload: Initialisation with the signature, one Transfer per
    /// segment, and the closing Receipt unless `upload_receipt` is off.
    pub fn execute_upload(&mut self, order: &mut UploadOrder) -> Result<OrderResult> {
        order.bind(self.handlers);
        let mut ctx = self.context(order.order_type());
        order.prepare_context(&self.session(), &mut ctx)?;

        let key = ctx
            .transaction_key
            .clone()
            .ok_or_else(|| EbicsError::InvalidState("upload prepared without transaction key".into()))?;
        let encrypted = CryptService::encrypt_by_key(&key, &CryptService::compress(order.payload())?)?;
        let mut transaction =
            UploadTransaction::new(ctx.order_type.as_str(), &encrypted, &key, self.config.segment_size)?;
        let num_segments = transaction.num_segments();
        ctx.set_num_segments(num_segments);

        let factory = self.handlers.request_factory;
        let init = self.exchange(&factory.initialization(&self.session(), &ctx)?, ResponseKind::Transaction, &ctx)?;
        transaction.initialized(init.transaction_id(), init.order_id().or(ctx.order_id.as_deref()))?;
        ctx.transaction_id = transaction.id().map(str::to_string);
        log::info!(
            "{} transaction {} opened, {} segment(s)",
            ctx.order_type,
            ctx.transaction_id.as_deref().unwrap_or_default(),
            num_segments
        );

        ctx.phase = TransactionPhase::Transfer;
        ctx.signature_data = None;
        let mut response = init;
        for segment in transaction.segments() {
            ctx.set_segment(segment.number, num_segments)?;
            ctx.order_data = Some(segment.data.clone());
            response = self.exchange(&factory.transfer(&self.session(), &ctx)?, ResponseKind::Transaction, &ctx)?;
            transaction.check_id(response.transaction_id())?;
            log::debug!("{}: segment {}/{} sent", ctx.order_type, segment.number, num_segments);
        }
        ctx.order_data = None;
        ctx.clear_segment();

        if self.config.upload_receipt {
            ctx.phase = TransactionPhase::Receipt;
            ctx.receipt_code = Some(0);
            response = self.exchange(&factory.receipt(&self.session(), &ctx)?, ResponseKind::Transaction, &ctx)?;
            transaction.check_id(response.transaction_id())?;
        }
        transaction.finish();
        log::info!(
            "{} uploaded, order id {}",
            ctx.order_type,
            transaction.order_id().unwrap_or("-")
        );
        order.accept_transaction(transaction.clone());

        let result = OrderResult::Upload { response, transaction };
        order.after_execute(&result, &mut self.keyring, &self.crypt)?;
        Ok(result)
    }
}

fn with_context(error: EbicsError, ctx: &RequestContext) -> EbicsError {
    match error {
        EbicsError::Protocol { message, context } => EbicsError::Protocol {
            message,
            context: ProtocolContext {
                return_code: context.return_code,
                ..ctx.protocol_context()
            },
        },
        other => other,
    }
}

fn same_transaction(response: &Response, ctx: &RequestContext) -> Result<()> {
    match (response.transaction_id(), ctx.transaction_id.as_deref()) {
        (Some(got), Some(expected)) if got != expected => Err(EbicsError::protocol(
            format!("response belongs to transaction {}", got),
            ctx.protocol_context(),
        )),
        _ => Ok(()),
    }
}

/// Feeds the order data of `response` into `transaction`; a response without
/// `SegmentNumber` carries segment `expected`.
fn receive_segment(
    transaction: &mut DownloadTransaction,
    response: &Response,
    expected: u32,
    ctx: &RequestContext,
) -> Result<()> {
    let data = response.order_data().ok_or_else(|| {
        EbicsError::protocol(format!("segment {} carries no order data", expected), ctx.protocol_context())
    })?;
    let (number, last) = match response.segment_number() {
        Some(number) => (number, response.is_last_segment()),
        None => (expected, expected == transaction.num_segments()),
    };
    transaction.receive(number, last, data.to_vec())
}

/// Splits a zip archive into its files; other data is a single unnamed file.
fn unpack(data: &[u8], ctx: &RequestContext) -> Result<Vec<DownloadedFile>> {
    if !data.starts_with(ZIP_MAGIC) {
        return Ok(vec![DownloadedFile {
            name: None,
            data: data.to_vec(),
        }]);
    }
    let archive_error =
        |e: zip::result::ZipError| EbicsError::protocol(format!("unreadable archive: {}", e), ctx.protocol_context());
    let mut archive = ZipArchive::new(Cursor::new(data)).map_err(archive_error)?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(archive_error)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        files.push(DownloadedFile {
            name: Some(name),
            data: contents,
        });
    }
    Ok(files)
}
