//! Error taxonomy for record calls and the agent facade.
//!
//! Every failure a caller can act on has its own variant, so branching never
//! needs to look at message text. Use [`Error::requires_login`] to decide
//! whether to send the user back through authorization and
//! [`Error::is_transient`] to decide whether a retry can help.

use http::StatusCode;
use skein_common::error::{TransportError, XrpcErrorBody};
use skein_common::types::AtStrError;
use skein_identity::resolver::ResolutionError;
use skein_oauth::dpop::{DpopError, ProofError};
use skein_oauth::error::FlowError;
use skein_oauth::session::SessionError;
use smol_str::SmolStr;

/// Client error type
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum Error {
    /// The account's PDS could not be resolved
    #[error("endpoint resolution failed{}", fmt_context(.context))]
    #[diagnostic(code(skein::resolution))]
    Resolution {
        #[source]
        #[diagnostic_source]
        source: ResolutionError,
        /// Operation that needed the endpoint
        context: Option<SmolStr>,
    },

    /// Authorization flow failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Flow(#[from] FlowError),

    /// DPoP proof could not be built or the token is bound to another key
    #[error(transparent)]
    #[diagnostic(transparent)]
    Proof(#[from] ProofError),

    /// The server asked for a DPoP nonce without offering one
    #[error("server requires a DPoP nonce but did not provide one (HTTP {status})")]
    #[diagnostic(
        code(skein::nonce_required),
        help("the server must send a DPoP-Nonce header with its challenge")
    )]
    NonceRequired { status: StatusCode },

    /// The server refused the access token or its proof
    #[error("authorization rejected (HTTP {status}){}", fmt_xrpc(.error, .message))]
    #[diagnostic(
        code(skein::auth_rejected),
        help("the session is no longer usable; log in again")
    )]
    AuthRejected {
        status: StatusCode,
        error: Option<SmolStr>,
        message: Option<SmolStr>,
    },

    /// The access token is past its expiry
    #[error("access token expired")]
    #[diagnostic(
        code(skein::token_expired),
        help("refresh the session before retrying")
    )]
    TokenExpired,

    /// Refresh was rejected; the session has been removed
    #[error("session refresh failed")]
    #[diagnostic(
        code(skein::refresh_failed),
        help("the user needs to log in again")
    )]
    RefreshFailed(#[source] Box<SessionError>),

    /// No record at this address
    #[error("record not found: {uri}")]
    #[diagnostic(code(skein::record_not_found))]
    RecordNotFound { uri: SmolStr },

    /// The record changed since the CID the write was conditioned on
    #[error("record {uri} was modified concurrently{}", fmt_message(.message))]
    #[diagnostic(
        code(skein::swap_conflict),
        help("re-read the record and apply the change to the current version")
    )]
    SwapConflict {
        uri: SmolStr,
        message: Option<SmolStr>,
    },

    /// Network failure or timeout
    #[error("transport error{}", fmt_context(.context))]
    #[diagnostic(code(skein::transport))]
    Transport {
        #[source]
        #[diagnostic_source]
        source: TransportError,
        /// Operation in progress
        context: Option<SmolStr>,
    },

    /// Operation this client does not implement
    #[error("unsupported: {0}")]
    #[diagnostic(code(skein::unsupported))]
    Unsupported(SmolStr),

    /// Rejected before any request was sent
    #[error("invalid {field}: {reason}")]
    #[diagnostic(code(skein::invalid_input))]
    InvalidInput { field: &'static str, reason: SmolStr },

    /// Any other XRPC error response
    #[error("XRPC error (HTTP {status}): {error}{}", fmt_message(.message))]
    #[diagnostic(code(skein::xrpc))]
    Xrpc {
        status: StatusCode,
        error: SmolStr,
        message: Option<SmolStr>,
    },

    /// Response body did not have the expected shape
    #[error("failed to decode response: {0}")]
    #[diagnostic(code(skein::decode))]
    Decode(#[source] serde_json::Error),

    /// Session storage or lookup failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(SessionError),
}

fn fmt_context(context: &Option<SmolStr>) -> String {
    context
        .as_ref()
        .map(|c| format!(" while {c}"))
        .unwrap_or_default()
}

fn fmt_message(message: &Option<SmolStr>) -> String {
    message
        .as_ref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

fn fmt_xrpc(error: &Option<SmolStr>, message: &Option<SmolStr>) -> String {
    match (error, message) {
        (Some(e), Some(m)) => format!(": {e}: {m}"),
        (Some(e), None) => format!(": {e}"),
        (None, Some(m)) => format!(": {m}"),
        (None, None) => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<SmolStr>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Build the error for a non-success XRPC response.
    pub(crate) fn xrpc(status: StatusCode, body: &[u8]) -> Self {
        match XrpcErrorBody::parse(body) {
            Some(XrpcErrorBody { error, message }) => Self::Xrpc {
                status,
                error,
                message,
            },
            None => Self::Xrpc {
                status,
                error: SmolStr::new(status.canonical_reason().unwrap_or("Unknown")),
                message: None,
            },
        }
    }

    /// Attach the operation that was running. Only resolution and transport
    /// errors carry context; other variants are returned unchanged.
    pub fn with_context(mut self, ctx: impl Into<SmolStr>) -> Self {
        match &mut self {
            Self::Resolution { context, .. } | Self::Transport { context, .. } => {
                *context = Some(ctx.into());
            }
            _ => {}
        }
        self
    }

    /// Operation context, if any.
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::Resolution { context, .. } | Self::Transport { context, .. } => {
                context.as_deref()
            }
            _ => None,
        }
    }

    /// Network-level failures. Safe to retry for idempotent reads.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_transient())
    }

    /// The caller should start a fresh login instead of retrying.
    pub fn requires_login(&self) -> bool {
        match self {
            Self::AuthRejected { .. } | Self::RefreshFailed(_) => true,
            Self::Session(e) => e.requires_login(),
            Self::Proof(ProofError::ThumbprintMismatch { .. }) => true,
            _ => false,
        }
    }
}

impl From<ResolutionError> for Error {
    fn from(source: ResolutionError) -> Self {
        Self::Resolution {
            source,
            context: None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(source: TransportError) -> Self {
        Self::Transport {
            source,
            context: None,
        }
    }
}

impl From<DpopError> for Error {
    fn from(e: DpopError) -> Self {
        match e {
            DpopError::Proof(e) => Self::Proof(e),
            DpopError::NonceRejected {
                status,
                retried: true,
            } => Self::AuthRejected {
                status,
                error: Some(SmolStr::new_static("use_dpop_nonce")),
                message: None,
            },
            DpopError::NonceRejected {
                status,
                retried: false,
            } => Self::NonceRequired { status },
            DpopError::Transport(e) => e.into(),
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        match e {
            e @ SessionError::RefreshFailed(_) => Self::RefreshFailed(Box::new(e)),
            SessionError::Proof(e) => Self::Proof(e),
            e => Self::Session(e),
        }
    }
}

impl From<AtStrError> for Error {
    fn from(e: AtStrError) -> Self {
        Self::InvalidInput {
            field: "identifier",
            reason: SmolStr::new(e.to_string()),
        }
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        TransportError::from(e).into()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
