//! Fundamental AT Protocol string types used by the client.

use miette::SourceSpan;
use smol_str::SmolStr;

pub mod aturi;
pub mod did;
pub mod did_doc;
pub mod handle;
pub mod nsid;

pub use aturi::AtUri;
pub use did::{Did, DidMethod};
pub use did_doc::DidDocument;
pub use handle::Handle;
pub use nsid::Nsid;

/// Parsing error for atproto string types
///
/// `spec` refers to the final url path segment on atproto.com/specs,
/// detailing the format of the type. `source` is the input string.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("error in `{source}`: {kind}")]
#[diagnostic(url("https://atproto.com/specs/{spec}"))]
pub struct AtStrError {
    /// Format name, e.g. `did`
    pub spec: SmolStr,
    /// The rejected input
    #[source_code]
    pub source: String,
    /// What went wrong
    #[source]
    #[diagnostic_source]
    pub kind: StrParseKind,
}

impl AtStrError {
    /// Input exceeded the maximum length for its format
    pub fn too_long(spec: &'static str, source: &str, max: usize, actual: usize) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source: source.to_string(),
            kind: StrParseKind::TooLong { max, actual },
        }
    }

    /// Input did not match the format's grammar
    pub fn regex(spec: &'static str, source: &str, message: SmolStr) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source: source.to_string(),
            kind: StrParseKind::RegexFail {
                span: None,
                message,
            },
        }
    }

    /// A required component was absent, optionally pointing at where it should be
    pub fn missing(spec: &'static str, source: &str, expected: &str, at: Option<usize>) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source: source.to_string(),
            kind: StrParseKind::MissingComponent {
                span: at.map(|start| SourceSpan::new(start.into(), 0)),
                message: SmolStr::new(expected),
            },
        }
    }
}

/// Kinds of string parsing failure
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StrParseKind {
    /// Grammar mismatch
    #[error("regex failure - {message}")]
    #[diagnostic(code(skein::types::regex_fail))]
    RegexFail {
        /// Offending region, when known
        #[label]
        span: Option<SourceSpan>,
        /// Explanation
        #[help]
        message: SmolStr,
    },
    /// Over the length limit
    #[error("string too long (allowed: {max}, actual: {actual})")]
    #[diagnostic(code(skein::types::wrong_length))]
    TooLong {
        /// Maximum allowed length
        max: usize,
        /// Actual length
        actual: usize,
    },
    /// Required piece absent
    #[error("missing - {message}")]
    #[diagnostic(code(skein::types::missing_component))]
    MissingComponent {
        /// Where the component was expected
        #[label]
        span: Option<SourceSpan>,
        /// The component that was expected
        #[help]
        message: SmolStr,
    },
}
