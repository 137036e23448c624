//! Moving request documents to the bank and responses back.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::{EbicsError, Result};
use crate::request::TransactionPhase;
use crate::xml::{self, Element};

pub trait Transport {
    /// Posts one request document and returns the response body.
    fn post(&self, url: &str, body: &str) -> Result<String>;
}

/// HTTPS POST of `text/xml` documents.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EbicsError::Transport(format!("http client error: {}", e)))?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &str, body: &str) -> Result<String> {
        log::debug!("POST {} ({} bytes)", url, body.len());
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=UTF-8")
            .body(body.to_string())
            .send()
            .map_err(|e| EbicsError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EbicsError::Transport(format!("bank answered HTTP {}", status)));
        }
        response.text().map_err(|e| EbicsError::Transport(e.to_string()))
    }
}

/// Selects a canned response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixtureKey {
    pub order_type: String,
    pub file_format: Option<String>,
    pub phase: TransactionPhase,
}

impl FixtureKey {
    pub fn new(order_type: impl Into<String>, file_format: Option<&str>, phase: TransactionPhase) -> Self {
        FixtureKey {
            order_type: order_type.into(),
            file_format: file_format.map(str::to_string),
            phase,
        }
    }
}

/// What the fixture transport saw of one request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub body: String,
    pub key: FixtureKey,
    pub transaction_id: Option<String>,
    pub segment_number: Option<u32>,
    pub last_segment: bool,
    pub receipt_code: Option<u8>,
}

#[derive(Debug, Default)]
struct FixtureState {
    responses: HashMap<FixtureKey, VecDeque<String>>,
    transactions: HashMap<String, (String, Option<String>)>,
    requests: Vec<RecordedRequest>,
}

/// Offline bank serving canned responses by order type, file format and phase.
///
/// Responses queued under one key are served in order; the last one is
/// repeated. Transfer and Receipt requests carry no order type, so it is
/// looked up from the transaction id of the Initialisation response served
/// earlier.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    state: Mutex<FixtureState>,
}

fn phase_from_name(name: &str) -> Option<TransactionPhase> {
    match name.to_ascii_lowercase().as_str() {
        "init" | "initialisation" | "initialization" => Some(TransactionPhase::Initialisation),
        "transfer" => Some(TransactionPhase::Transfer),
        "receipt" => Some(TransactionPhase::Receipt),
        _ => None,
    }
}

/// Splits `ORDER[_FORMAT]_phase[_n]` into key and sequence number.
fn parse_fixture_name(stem: &str) -> Option<(FixtureKey, u32)> {
    let mut parts: Vec<&str> = stem.split('_').collect();
    let sequence = match parts.last().and_then(|p| p.parse::<u32>().ok()) {
        Some(n) => {
            parts.pop();
            n
        }
        None => 1,
    };
    if parts.len() < 2 {
        return None;
    }
    let phase = phase_from_name(parts.pop()?)?;
    let order_type = parts.remove(0);
    let file_format = if parts.is_empty() { None } else { Some(parts.join("_")) };
    Some((
        FixtureKey {
            order_type: order_type.to_string(),
            file_format,
            phase,
        },
        sequence,
    ))
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `ORDER[_FORMAT]_phase[_n].xml` file of `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut fixtures = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match parse_fixture_name(stem) {
                Some((key, sequence)) => fixtures.push((key, sequence, fs::read_to_string(&path)?)),
                None => log::warn!("ignoring fixture {}", path.display()),
            }
        }
        fixtures.sort_by_key(|(key, sequence, _)| (key.order_type.clone(), key.file_format.clone(), *sequence));

        let transport = FixtureTransport::new();
        for (key, _, body) in fixtures {
            transport.push(key, body);
        }
        log::debug!("fixtures loaded from {}", dir.display());
        Ok(transport)
    }

    /// Queues `response` under `key`.
    pub fn push(&self, key: FixtureKey, response: impl Into<String>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.responses.entry(key).or_default().push_back(response.into());
    }

    pub fn with_response(self, key: FixtureKey, response: impl Into<String>) -> Self {
        self.push(key, response);
        self
    }

    /// Every request posted so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).requests.clone()
    }

    fn describe(&self, state: &FixtureState, document: &Element) -> Result<RecordedRequest> {
        let header = document.child("header");
        let transaction_id = header.and_then(|h| h.text_at(&["static", "TransactionID"]));
        let phase = match header.and_then(|h| h.text_at(&["mutable", "TransactionPhase"])) {
            Some(phase) => phase.parse()?,
            None => TransactionPhase::Initialisation,
        };
        let segment = header.and_then(|h| h.find_path(&["mutable", "SegmentNumber"]));

        let (order_type, file_format) = if document.name == "ebicsHEVRequest" {
            ("HEV".to_string(), None)
        } else if let Some(details) = header.and_then(|h| h.find("OrderDetails")) {
            let order_type = details
                .text_at(&["OrderType"])
                .or_else(|| details.text_at(&["AdminOrderType"]))
                .ok_or_else(|| EbicsError::Transport("request names no order type".into()))?;
            let file_format = details
                .find("FileFormat")
                .or_else(|| details.find("MsgName"))
                .map(|el| el.text().trim().to_string());
            (order_type, file_format)
        } else {
            let id = transaction_id
                .as_deref()
                .ok_or_else(|| EbicsError::Transport("request has neither order type nor transaction id".into()))?;
            state
                .transactions
                .get(id)
                .cloned()
                .ok_or_else(|| EbicsError::Transport(format!("unknown transaction {}", id)))?
        };

        Ok(RecordedRequest {
            url: String::new(),
            body: String::new(),
            key: FixtureKey {
                order_type,
                file_format,
                phase,
            },
            transaction_id,
            segment_number: segment.and_then(|s| s.text().trim().parse().ok()),
            last_segment: segment.and_then(|s| s.attr("lastSegment")) == Some("true"),
            receipt_code: document
                .text_at(&["body", "TransferReceipt", "ReceiptCode"])
                .and_then(|c| c.parse().ok()),
        })
    }

    fn next_response(state: &mut FixtureState, key: &FixtureKey) -> Option<String> {
        let fallback = FixtureKey {
            file_format: None,
            ..key.clone()
        };
        let queue = if state.responses.contains_key(key) {
            state.responses.get_mut(key)
        } else {
            state.responses.get_mut(&fallback)
        }?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Transport for FixtureTransport {
    fn post(&self, url: &str, body: &str) -> Result<String> {
        let document = xml::parse(body)?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| EbicsError::Transport("fixture state is poisoned".into()))?;

        let mut request = self.describe(&state, &document)?;
        request.url = url.to_string();
        request.body = body.to_string();
        let key = request.key.clone();
        log::debug!("fixture request {:?}", key);
        state.requests.push(request);

        let response = Self::next_response(&mut state, &key)
            .ok_or_else(|| EbicsError::Transport(format!("no fixture for {:?}", key)))?;

        if key.phase == TransactionPhase::Initialisation {
            if let Ok(parsed) = xml::parse(&response) {
                if let Some(id) = parsed.text_at(&["header", "static", "TransactionID"]) {
                    state.transactions.insert(id, (key.order_type.clone(), key.file_format.clone()));
                }
            }
        }
        Ok(response)
    }
}
