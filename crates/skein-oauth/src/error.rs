use std::fmt::Display;

use miette::{Diagnostic, LabeledSpan, Severity, SourceCode};
use skein_common::session::SessionStoreError;
use smol_str::SmolStr;
use thiserror::Error;

use crate::dpop::ProofError;
use crate::flow::FlowState;
use crate::request::{RequestError, RequestErrorKind};
use crate::resolver::ResolverError;
use crate::session::SessionError;

/// Errors from the authorization-code flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("callback `state` does not match the pending request")]
    StateMismatch,

    #[error("callback is missing the `state` parameter")]
    MissingState,

    #[error("no pending authorization request for state `{0}`")]
    UnknownState(SmolStr),

    #[error("authorization request expired")]
    RequestExpired,

    #[error("issuer mismatch: expected {expected}, got {}", .actual.as_deref().unwrap_or("nothing"))]
    IssuerMismatch {
        expected: SmolStr,
        actual: Option<SmolStr>,
    },

    #[error("callback carries no authorization code")]
    MissingCode,

    #[error("authorization denied: {error}")]
    Denied {
        error: SmolStr,
        description: Option<SmolStr>,
    },

    #[error("PKCE verification failed: {0}")]
    Pkce(SmolStr),

    #[error("code exchange rejected: {error}")]
    CodeExchangeRejected {
        error: SmolStr,
        description: Option<SmolStr>,
    },

    #[error("client authentication rejected: {error}")]
    ClientAuthRejected {
        error: SmolStr,
        description: Option<SmolStr>,
    },

    #[error("authorization server requires pushed authorization requests")]
    ParRequired,

    #[error("invalid flow transition {from:?} -> {to:?}")]
    InvalidTransition { from: FlowState, to: FlowState },

    #[error(transparent)]
    Discovery(#[from] ResolverError),

    #[error(transparent)]
    Request(RequestError),

    #[error(transparent)]
    Metadata(#[from] crate::atproto::Error),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

// Transparent variants forward everything to the wrapped error.
impl Diagnostic for FlowError {
    fn code<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        if let Some(inner) = self.inner() {
            return inner.code();
        }
        let code = match self {
            FlowError::StateMismatch => "skein_oauth::flow::state_mismatch",
            FlowError::MissingState => "skein_oauth::flow::missing_state",
            FlowError::UnknownState(_) => "skein_oauth::flow::unknown_state",
            FlowError::RequestExpired => "skein_oauth::flow::request_expired",
            FlowError::IssuerMismatch { .. } => "skein_oauth::flow::issuer_mismatch",
            FlowError::MissingCode => "skein_oauth::flow::missing_code",
            FlowError::Denied { .. } => "skein_oauth::flow::denied",
            FlowError::Pkce(_) => "skein_oauth::flow::pkce",
            FlowError::CodeExchangeRejected { .. } => "skein_oauth::flow::code_exchange_rejected",
            FlowError::ClientAuthRejected { .. } => "skein_oauth::flow::client_auth_rejected",
            FlowError::ParRequired => "skein_oauth::flow::par_required",
            FlowError::InvalidTransition { .. } => "skein_oauth::flow::invalid_transition",
            _ => return None,
        };
        Some(Box::new(code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        if let Some(inner) = self.inner() {
            return inner.help();
        }
        let help = match self {
            FlowError::StateMismatch => {
                "the callback was not issued for this authorization attempt"
            }
            FlowError::UnknownState(_) => {
                "the request was already used, expired from the store, or never existed"
            }
            FlowError::RequestExpired => "start the login again",
            FlowError::Pkce(_) => {
                "the code verifier sent does not match the challenge of the authorization request"
            }
            FlowError::ClientAuthRejected { .. } => {
                "check the client metadata document, keyset and token endpoint auth method"
            }
            FlowError::ParRequired => "enable PAR, or the server did not advertise a PAR endpoint",
            _ => return None,
        };
        Some(Box::new(help))
    }

    fn severity(&self) -> Option<Severity> {
        self.inner().and_then(|inner| inner.severity())
    }

    fn url<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        self.inner().and_then(|inner| inner.url())
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        self.inner().and_then(|inner| inner.source_code())
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        self.inner().and_then(|inner| inner.labels())
    }

    fn related<'a>(&'a self) -> Option<Box<dyn Iterator<Item = &'a dyn Diagnostic> + 'a>> {
        self.inner().and_then(|inner| inner.related())
    }

    fn diagnostic_source(&self) -> Option<&dyn Diagnostic> {
        self.inner().and_then(|inner| inner.diagnostic_source())
    }
}

impl FlowError {
    fn inner(&self) -> Option<&dyn Diagnostic> {
        match self {
            FlowError::Discovery(e) => Some(e),
            FlowError::Request(e) => Some(e),
            FlowError::Metadata(e) => Some(e),
            FlowError::Proof(e) => Some(e),
            FlowError::Session(e) => Some(e),
            FlowError::Store(e) => Some(e),
            _ => None,
        }
    }

    /// Classify a failed token-endpoint call by the OAuth error it carries.
    ///
    /// `private_key_auth` is whether the client authenticated with
    /// `private_key_jwt`; servers report unsupported assertion setups as
    /// `invalid_scope` in that case.
    pub fn from_request(err: RequestError, private_key_auth: bool) -> Self {
        if matches!(err.kind(), RequestErrorKind::UnsupportedAuthMethod) {
            return FlowError::ClientAuthRejected {
                error: SmolStr::new_static("unsupported_auth_method"),
                description: err.context().map(SmolStr::new),
            };
        }
        let Some(oauth) = err.oauth_error() else {
            return FlowError::Request(err);
        };
        let description = oauth.error_description;
        match oauth.error.as_str() {
            "invalid_grant"
                if description
                    .as_deref()
                    .is_some_and(|d| d.contains("verifier")) =>
            {
                FlowError::Pkce(description.unwrap_or_default())
            }
            "invalid_grant" => FlowError::CodeExchangeRejected {
                error: oauth.error,
                description,
            },
            "invalid_client" | "unauthorized_client" => FlowError::ClientAuthRejected {
                error: oauth.error,
                description,
            },
            "invalid_scope" if private_key_auth => FlowError::ClientAuthRejected {
                error: oauth.error,
                description,
            },
            _ => FlowError::CodeExchangeRejected {
                error: oauth.error,
                description,
            },
        }
    }

    /// Network trouble rather than a verdict from the server.
    pub fn is_transient(&self) -> bool {
        match self {
            FlowError::Discovery(e) => e.is_transient(),
            FlowError::Request(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<RequestError> for FlowError {
    fn from(err: RequestError) -> Self {
        FlowError::from_request(err, false)
    }
}

impl From<url::ParseError> for FlowError {
    fn from(err: url::ParseError) -> Self {
        FlowError::Discovery(ResolverError::Uri(err))
    }
}

pub type Result<T> = core::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn rejected(body: serde_json::Value) -> RequestError {
        RequestError::http_status_with_body(StatusCode::BAD_REQUEST, body)
    }

    #[test]
    fn server_errors_are_classified() {
        let err = FlowError::from(rejected(
            serde_json::json!({"error": "invalid_grant", "error_description": "code already used"}),
        ));
        assert!(matches!(err, FlowError::CodeExchangeRejected { ref error, .. } if error == "invalid_grant"));

        let err = FlowError::from(rejected(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Invalid code_verifier"
        })));
        assert!(matches!(err, FlowError::Pkce(_)));

        let err = FlowError::from(rejected(serde_json::json!({"error": "invalid_client"})));
        assert!(matches!(err, FlowError::ClientAuthRejected { .. }));

        let err = FlowError::from(rejected(serde_json::json!({"error": "unauthorized_client"})));
        assert!(matches!(err, FlowError::ClientAuthRejected { .. }));
    }

    #[test]
    fn invalid_scope_depends_on_auth_method() {
        let body = serde_json::json!({"error": "invalid_scope"});
        assert!(matches!(
            FlowError::from_request(rejected(body.clone()), true),
            FlowError::ClientAuthRejected { .. }
        ));
        assert!(matches!(
            FlowError::from_request(rejected(body), false),
            FlowError::CodeExchangeRejected { .. }
        ));
    }

    #[test]
    fn other_failures_stay_requests() {
        let err = FlowError::from(RequestError::http_status(StatusCode::BAD_GATEWAY));
        assert!(err.is_transient());
        assert!(matches!(err, FlowError::Request(_)));
        assert!(matches!(
            FlowError::from(RequestError::unsupported_auth_method()),
            FlowError::ClientAuthRejected { .. }
        ));
    }

    #[test]
    fn diagnostics_forward_through_wrapped_errors() {
        let code = |e: &FlowError| e.code().map(|c| c.to_string());
        let help = |e: &FlowError| e.help().map(|h| h.to_string());

        assert_eq!(
            code(&FlowError::StateMismatch).as_deref(),
            Some("skein_oauth::flow::state_mismatch")
        );
        assert_eq!(help(&FlowError::RequestExpired).as_deref(), Some("start the login again"));
        assert!(help(&FlowError::MissingCode).is_none());

        let wrapped = FlowError::from(ProofError::ThumbprintMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        assert_eq!(
            code(&wrapped).as_deref(),
            Some("skein_oauth::dpop::thumbprint_mismatch")
        );
        assert!(help(&wrapped).is_some_and(|h| h.contains("different DPoP key")));
    }
}
