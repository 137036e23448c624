use thiserror::Error;

/// Context attached to protocol failures so callers can decide on messaging or retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolContext {
    pub order_type: Option<String>,
    pub transaction_id: Option<String>,
    pub return_code: Option<String>,
}

impl std::fmt::Display for ProtocolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "order type {}, transaction {}, return code {}",
            self.order_type.as_deref().unwrap_or("-"),
            self.transaction_id.as_deref().unwrap_or("-"),
            self.return_code.as_deref().unwrap_or("-"),
        )
    }
}

/// The error type of every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum EbicsError {
    /// Missing or unreadable X.509 content.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// A document does not have the structure its schema demands.
    #[error("schema error ({schema}): {message}")]
    Schema { schema: String, message: String },

    /// Unsupported canonicalization, signature, digest or key algorithm.
    #[error("unsupported algorithm: {0}")]
    Algorithm(String),

    /// The keyring password does not unlock a private key.
    #[error("credential error: {0}")]
    Credential(String),

    /// Unexpected phase, missing transaction data, or a non-success return code from the bank.
    #[error("protocol error: {message} ({context})")]
    Protocol {
        message: String,
        context: ProtocolContext,
    },

    /// The operation does not exist for the active protocol version.
    #[error("{operation} is not implemented for protocol version {version}")]
    NotImplemented { operation: String, version: String },

    /// Signing failed or the freshly created signature did not verify.
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("cryptography error: {0}")]
    Crypto(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("key storage error: {0}")]
    Storage(String),

    /// Context was copied between orders of different capability sets.
    #[error("cannot copy context from a {from} order into a {to} order")]
    IncompatibleOrder { from: String, to: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EbicsError {
    pub fn protocol(message: impl Into<String>, context: ProtocolContext) -> Self {
        EbicsError::Protocol {
            message: message.into(),
            context,
        }
    }

    pub fn schema(schema: impl Into<String>, message: impl Into<String>) -> Self {
        EbicsError::Schema {
            schema: schema.into(),
            message: message.into(),
        }
    }

    pub fn not_implemented(operation: impl Into<String>, version: impl Into<String>) -> Self {
        EbicsError::NotImplemented {
            operation: operation.into(),
            version: version.into(),
        }
    }

    /// The bank return code carried by a protocol error, if any.
    pub fn return_code(&self) -> Option<&str> {
        match self {
            EbicsError::Protocol { context, .. } => context.return_code.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T, E = EbicsError> = std::result::Result<T, E>;
