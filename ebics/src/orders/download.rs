use chrono::NaiveDate;

use super::{bound, Capability, Handlers, Order};
use crate::error::{EbicsError, Result};
use crate::request::{RequestContext, Service, Session};

pub const DOWNLOAD_ORDER_TYPES: &[&str] = &[
    "HPD", "HKD", "HTD", "HAA", "PTK", "HAC", "STA", "VMK", "C52", "C53", "C54", "Z53", "FDL", "BTD",
];

/// Segmented download of bank parameters, protocols or statements.
#[derive(Debug, Clone)]
pub struct DownloadOrder {
    order_type: String,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    file_format: Option<String>,
    country_code: Option<String>,
    service: Option<Service>,
    handlers: Option<Handlers>,
}

impl DownloadOrder {
    pub fn new(order_type: &str) -> Result<Self> {
        if !DOWNLOAD_ORDER_TYPES.contains(&order_type) {
            return Err(EbicsError::InvalidState(format!("{} is not a download order", order_type)));
        }
        Ok(DownloadOrder {
            order_type: order_type.to_string(),
            start_date: None,
            end_date: None,
            file_format: None,
            country_code: None,
            service: None,
            handlers: None,
        })
    }

    /// FDL of a bank-specific file format.
    pub fn fdl(file_format: impl Into<String>, country_code: Option<String>) -> Self {
        DownloadOrder {
            file_format: Some(file_format.into()),
            country_code,
            ..Self::unchecked("FDL")
        }
    }

    /// H005 business transaction download.
    pub fn btd(service: Service) -> Self {
        DownloadOrder {
            service: Some(service),
            ..Self::unchecked("BTD")
        }
    }

    fn unchecked(order_type: &str) -> Self {
        DownloadOrder {
            order_type: order_type.to_string(),
            start_date: None,
            end_date: None,
            file_format: None,
            country_code: None,
            service: None,
            handlers: None,
        }
    }

    pub fn with_date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }
}

impl Order for DownloadOrder {
    fn order_type(&self) -> &str {
        &self.order_type
    }

    fn capability(&self) -> Capability {
        Capability::Download
    }

    fn bind(&mut self, handlers: Handlers) {
        self.handlers = Some(handlers);
    }

    fn handlers(&self) -> Option<&Handlers> {
        self.handlers.as_ref()
    }

    fn prepare_context(&self, _session: &Session<'_>, ctx: &mut RequestContext) -> Result<()> {
        let config = bound(&self.order_type, self.handlers())?.config();
        config.supports(&self.order_type)?;
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(EbicsError::InvalidState(format!(
                    "date range starts after it ends ({} > {})",
                    start, end
                )));
            }
        }
        if self.order_type == "BTD" && self.service.is_none() {
            return Err(EbicsError::InvalidState("BTD needs a service".into()));
        }

        ctx.order_type = self.order_type.clone();
        ctx.order_attribute = (!config.uses_admin_order_type()).then(|| "DZHNN".to_string());
        ctx.start_date = self.start_date;
        ctx.end_date = self.end_date;
        ctx.file_format = self.file_format.clone();
        ctx.country_code = self.country_code.clone();
        ctx.service = self.service.clone();
        ctx.clear_segment();
        Ok(())
    }
}
