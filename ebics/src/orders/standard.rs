use super::{bound, Capability, Handlers, Order, OrderResult};
use crate::crypto::CryptService;
use crate::error::{EbicsError, ProtocolContext, Result};
use crate::keyring::Keyring;
use crate::request::{RequestContext, Session};
use crate::xml;

/// Single round trip orders: HEV (version discovery) and HPB (bank keys).
#[derive(Debug, Clone)]
pub struct StandardOrder {
    order_type: &'static str,
    handlers: Option<Handlers>,
}

impl StandardOrder {
    pub fn hev() -> Self {
        StandardOrder {
            order_type: "HEV",
            handlers: None,
        }
    }

    pub fn hpb() -> Self {
        StandardOrder {
            order_type: "HPB",
            handlers: None,
        }
    }
}

impl Order for StandardOrder {
    fn order_type(&self) -> &str {
        self.order_type
    }

    fn capability(&self) -> Capability {
        Capability::Standard
    }

    fn bind(&mut self, handlers: Handlers) {
        self.handlers = Some(handlers);
    }

    fn handlers(&self) -> Option<&Handlers> {
        self.handlers.as_ref()
    }

    fn prepare_context(&self, _session: &Session<'_>, ctx: &mut RequestContext) -> Result<()> {
        let config = bound(self.order_type, self.handlers())?.config();
        config.supports(self.order_type)?;
        ctx.order_type = self.order_type.to_string();
        ctx.order_attribute = (self.order_type == "HPB" && !config.uses_admin_order_type()).then(|| "DZHNN".to_string());
        ctx.clear_segment();
        Ok(())
    }

    /// HPB installs the downloaded bank keys into the keyring.
    fn after_execute(&mut self, result: &OrderResult, keyring: &mut Keyring, crypt: &CryptService) -> Result<()> {
        if self.order_type != "HPB" {
            return Ok(());
        }
        let handlers = bound(self.order_type, self.handlers())?;
        let order_data = result.order_data().ok_or_else(|| {
            EbicsError::protocol(
                "HPB response carries no order data",
                ProtocolContext {
                    order_type: Some("HPB".into()),
                    ..Default::default()
                },
            )
        })?;
        let text = std::str::from_utf8(order_data)
            .map_err(|e| EbicsError::Xml(format!("HPB order data is not UTF-8: {}", e)))?;
        let document = xml::parse(text)?;

        let locator = crypt.locator();
        let x = handlers.order_data_handler.retrieve_authentication_signature(&document, locator)?;
        let e = handlers.order_data_handler.retrieve_encryption_signature(&document, locator)?;
        keyring.set_bank_signature(x)?;
        keyring.set_bank_signature(e)?;
        log::info!("bank keys installed");
        Ok(())
    }
}
