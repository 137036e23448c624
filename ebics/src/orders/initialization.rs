use super::{bound, Capability, Handlers, Order};
use crate::crypto::CryptService;
use crate::error::Result;
use crate::request::{RequestContext, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOrder {
    Ini,
    Hia,
}

/// INI (order signature key) or HIA (authentication and encryption keys).
#[derive(Debug, Clone)]
pub struct InitializationOrder {
    kind: KeyOrder,
    handlers: Option<Handlers>,
}

impl InitializationOrder {
    pub fn ini() -> Self {
        InitializationOrder {
            kind: KeyOrder::Ini,
            handlers: None,
        }
    }

    pub fn hia() -> Self {
        InitializationOrder {
            kind: KeyOrder::Hia,
            handlers: None,
        }
    }
}

impl Order for InitializationOrder {
    fn order_type(&self) -> &str {
        match self.kind {
            KeyOrder::Ini => "INI",
            KeyOrder::Hia => "HIA",
        }
    }

    fn capability(&self) -> Capability {
        Capability::Initialization
    }

    fn bind(&mut self, handlers: Handlers) {
        self.handlers = Some(handlers);
    }

    fn handlers(&self) -> Option<&Handlers> {
        self.handlers.as_ref()
    }

    fn prepare_context(&self, session: &Session<'_>, ctx: &mut RequestContext) -> Result<()> {
        let handlers = bound(self.order_type(), self.handlers())?;
        let config = handlers.config();
        config.supports(self.order_type())?;

        let locator = session.crypt.locator();
        let order_data = match self.kind {
            KeyOrder::Ini => handlers
                .order_data_handler
                .signature_pub_key_order_data(session.keyring, locator, session.user)?,
            KeyOrder::Hia => handlers
                .order_data_handler
                .hia_request_order_data(session.keyring, locator, session.user)?,
        };

        ctx.order_type = self.order_type().to_string();
        ctx.order_attribute = (!config.uses_admin_order_type()).then(|| "DZNNN".to_string());
        ctx.order_data = Some(CryptService::compress(order_data.to_document().as_bytes())?);
        ctx.clear_segment();
        Ok(())
    }
}
