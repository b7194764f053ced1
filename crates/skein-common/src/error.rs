//! Transport and HTTP error types shared by every crate in the workspace.

use serde::Deserialize;
use smol_str::SmolStr;

/// Transport-level errors that occur during HTTP communication
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TransportError {
    /// Failed to establish connection to server
    #[error("Connection error: {0}")]
    #[diagnostic(
        code(skein::transport::connect),
        help("check network connectivity and TLS configuration")
    )]
    Connect(String),

    /// Request timed out
    #[error("Request timeout")]
    #[diagnostic(
        code(skein::transport::timeout),
        help("the remote server did not answer within the configured timeout")
    )]
    Timeout,

    /// Request construction failed (malformed URI, headers, etc.)
    #[error("Invalid request: {0}")]
    #[diagnostic(code(skein::transport::invalid_request))]
    InvalidRequest(String),

    /// Other transport error
    #[error("Transport error: {0}")]
    #[diagnostic(code(skein::transport::other))]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Timeouts and connection failures may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_) | Self::Other(_))
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() || e.is_request() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Other(Box::new(e))
        }
    }
}

/// The `{"error": ..., "message": ...}` body XRPC servers return with 4xx/5xx.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct XrpcErrorBody {
    /// Machine-readable error name, e.g. `RecordNotFound`
    pub error: SmolStr,
    /// Human-readable description
    #[serde(default)]
    pub message: Option<SmolStr>,
}

impl XrpcErrorBody {
    /// Parse an error body, returning `None` for anything that isn't the standard shape.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}
