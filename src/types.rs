use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Quote payload as returned by the price API under `data`
///
/// Nothing about it is trusted: every field may be missing and the amount
/// arrives either as a JSON string or a number.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawQuote {
    #[serde(default)]
    pub amount: Option<RawAmount>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl RawQuote {
    pub fn new(amount: impl Into<RawAmount>, base: &str, currency: &str) -> Self {
        Self {
            amount: Some(amount.into()),
            base: Some(base.to_string()),
            currency: Some(currency.to_string()),
        }
    }

    /// True when the upstream sent no quote fields at all
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.base.is_none() && self.currency.is_none()
    }
}

/// Amount as sent upstream (Coinbase sends strings, others send numbers)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Text(String),
    Number(f64),
}

impl From<&str> for RawAmount {
    fn from(s: &str) -> Self {
        RawAmount::Text(s.to_string())
    }
}

impl From<f64> for RawAmount {
    fn from(v: f64) -> Self {
        RawAmount::Number(v)
    }
}

/// Envelope of the spot price response: `{ "data": { ... } }`
#[derive(Debug, Deserialize)]
pub struct QuoteEnvelope {
    #[serde(default)]
    pub data: Option<RawQuote>,
}

/// One persisted price observation
///
/// Serialized field names double as the CSV header, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRecord {
    #[serde(rename = "valor")]
    pub value: f64,
    #[serde(rename = "criptomoeda")]
    pub crypto_asset: String,
    #[serde(rename = "moeda")]
    pub quote_currency: String,
    #[serde(rename = "timestamp")]
    pub captured_at: String,
}

impl PriceRecord {
    /// CSV header, matching the serialized field order
    pub const HEADER: [&'static str; 4] = ["valor", "criptomoeda", "moeda", "timestamp"];
}

/// Reasons a quote is rejected before anything is written
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing quote")]
    MissingQuote,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("non-positive value")]
    NonPositiveValue,

    #[error("missing currency")]
    MissingCurrency,
}

/// Error types for the ETL pipeline
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("upstream returned HTTP {status_code}: {body}")]
    Upstream { status_code: u16, body: String },

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure classes surfaced to triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Upstream,
    Validation,
    Io,
    Config,
}

impl EtlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::Upstream { .. } | EtlError::Unreachable(_) | EtlError::InvalidResponse(_) => {
                ErrorKind::Upstream
            }
            EtlError::Validation(_) => ErrorKind::Validation,
            EtlError::Io { .. } => ErrorKind::Io,
            EtlError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether re-running the pipeline could plausibly succeed
    ///
    /// Transport hiccups, garbled bodies and filesystem errors are worth another
    /// attempt; an explicit non-200 answer, a rejected quote or bad settings are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EtlError::Unreachable(_) | EtlError::InvalidResponse(_) | EtlError::Io { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EtlError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Trait for price quote sources
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch the current quote, one request, no retry
    async fn fetch(&self) -> Result<RawQuote>;

    /// Source name
    fn name(&self) -> &str;
}
