//! Identity resolution: handle → DID, DID → document, and DID → PDS endpoint.
//!
//! `did:plc` documents come from a PLC directory. `did:web` endpoints are
//! derived from the host name without a network round trip; the document can
//! still be fetched from its well-known location when a caller wants it.

use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use http::StatusCode;
use miette::Diagnostic;
use percent_encoding::percent_decode_str;
use skein_common::error::TransportError;
use skein_common::types::did::{Did, DidMethod};
use skein_common::types::did_doc::DidDocument;
use skein_common::types::{AtStrError, Handle};
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during identity resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolutionError {
    /// DID method other than `plc` or `web`
    #[error("unsupported DID method `{method}` in {did}")]
    #[diagnostic(
        code(skein_identity::unsupported_did_method),
        help("supported DID methods: did:web, did:plc")
    )]
    UnsupportedDidMethod {
        /// Requested DID
        did: SmolStr,
        /// Method segment
        method: SmolStr,
    },

    /// The directory could not be reached or answered with a non-success status
    #[error("directory unavailable resolving {did}{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    #[diagnostic(
        code(skein_identity::directory_unavailable),
        help("the PLC directory or did:web host may be down; retry later")
    )]
    DirectoryUnavailable {
        /// DID being resolved
        did: SmolStr,
        /// Response status, when a response arrived
        status: Option<StatusCode>,
        /// Transport failure, when no response arrived
        #[source]
        source: Option<TransportError>,
    },

    /// The document has no `AtprotoPersonalDataServer` service
    #[error("no PDS service endpoint in DID document for {did}")]
    #[diagnostic(
        code(skein_identity::no_service_endpoint),
        help("the account's DID document must list an AtprotoPersonalDataServer service")
    )]
    NoServiceEndpoint {
        /// DID being resolved
        did: SmolStr,
    },

    /// The directory answered with something that is not a DID document
    #[error("invalid DID document for {did}: {source}")]
    #[diagnostic(code(skein_identity::invalid_document))]
    InvalidDocument {
        /// DID being resolved
        did: SmolStr,
        /// Decode failure
        #[source]
        source: serde_json::Error,
    },

    /// DID document id did not match requested DID; includes the fetched document
    #[error("DID doc id mismatch: expected {expected}, got {}", .doc.id)]
    #[diagnostic(
        code(skein_identity::doc_id_mismatch),
        help("document id differs from requested DID; do not trust this document")
    )]
    DocIdMismatch {
        /// Requested DID
        expected: Did,
        /// Fetched document
        doc: Box<DidDocument>,
    },

    /// Input was not a well-formed DID
    #[error(transparent)]
    #[diagnostic(code(skein_identity::invalid_did))]
    InvalidDid(#[from] AtStrError),

    /// Handle could not be resolved to a DID
    #[error("could not resolve handle {handle}")]
    #[diagnostic(
        code(skein_identity::handle_not_resolved),
        help("expected https://<handle>/.well-known/atproto-did to contain a DID")
    )]
    HandleNotResolved {
        /// Handle being resolved
        handle: SmolStr,
        /// Transport failure, if any
        #[source]
        source: Option<TransportError>,
    },

    /// URL construction failed
    #[error("URL parse error: {0}")]
    #[diagnostic(code(skein_identity::url))]
    Url(#[from] url::ParseError),
}

impl ResolutionError {
    pub(crate) fn unsupported(did: &Did) -> Self {
        Self::UnsupportedDidMethod {
            did: SmolStr::new(did.as_str()),
            method: SmolStr::new(did.method().as_str()),
        }
    }

    pub(crate) fn directory_transport(did: &Did, source: TransportError) -> Self {
        Self::DirectoryUnavailable {
            did: SmolStr::new(did.as_str()),
            status: None,
            source: Some(source),
        }
    }

    /// True for failures that may clear up on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DirectoryUnavailable { status, source, .. } => {
                source.as_ref().is_some_and(TransportError::is_transient)
                    || status.is_some_and(|s| {
                        s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS
                    })
            }
            _ => false,
        }
    }
}

/// Result alias for resolution operations
pub type Result<T> = std::result::Result<T, ResolutionError>;

/// PLC directory to fetch `did:plc` documents from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcSource {
    /// Base URL for the PLC directory
    pub base: Url,
}

impl Default for PlcSource {
    fn default() -> Self {
        Self {
            base: Url::parse("https://plc.directory/").expect("valid url"),
        }
    }
}

impl PlcSource {
    /// Use a directory at `base`
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    /// Document URL for a DID.
    ///
    /// Built by string concatenation: `Url::join` would read `did:` as a scheme.
    pub fn doc_url(&self, did: &Did) -> Result<Url> {
        let base = self.base.as_str();
        let sep = if base.ends_with('/') { "" } else { "/" };
        Ok(Url::parse(&format!("{base}{sep}{did}"))?)
    }
}

/// DID Document fetch response.
///
/// Carries the raw response bytes and the HTTP status, plus the requested DID
/// to enable validation.
#[derive(Debug, Clone)]
pub struct DidDocResponse {
    /// Response body
    pub buffer: Bytes,
    /// Response status
    pub status: StatusCode,
    /// DID we intended to resolve
    pub requested: Did,
}

impl DidDocResponse {
    /// Parse the document, mapping non-success statuses to `DirectoryUnavailable`.
    pub fn parse(&self) -> Result<DidDocument> {
        if !self.status.is_success() {
            return Err(ResolutionError::DirectoryUnavailable {
                did: SmolStr::new(self.requested.as_str()),
                status: Some(self.status),
                source: None,
            });
        }
        serde_json::from_slice::<DidDocument>(&self.buffer).map_err(|source| {
            ResolutionError::InvalidDocument {
                did: SmolStr::new(self.requested.as_str()),
                source,
            }
        })
    }

    /// Parse and check that the document id equals the requested DID.
    pub fn parse_validated(&self) -> Result<DidDocument> {
        let doc = self.parse()?;
        if doc.id != self.requested {
            return Err(ResolutionError::DocIdMismatch {
                expected: self.requested.clone(),
                doc: Box::new(doc),
            });
        }
        Ok(doc)
    }
}

/// Resolver configuration.
///
/// - `plc_source`: where to fetch did:plc documents.
/// - `validate_doc_id`: if true (default), the document `id` must equal the
///   requested DID, otherwise `DocIdMismatch` is returned with the fetched document.
/// - `cache_ttl`: how long a resolved endpoint is reused. `None` disables caching.
/// - `timeout`: bound on each directory request.
#[derive(Debug, Clone, Builder)]
#[builder(start_fn = new)]
pub struct ResolverOptions {
    /// PLC data source
    #[builder(default)]
    pub plc_source: PlcSource,
    /// Validate that fetched DID document id matches the requested DID
    #[builder(default = true)]
    pub validate_doc_id: bool,
    /// Endpoint cache lifetime, see [`ResolverOptions::with_cache_ttl`]
    #[builder(skip = Some(DEFAULT_CACHE_TTL))]
    pub cache_ttl: Option<Duration>,
    /// Per-request timeout
    #[builder(default = skein_common::DEFAULT_TIMEOUT)]
    pub timeout: Duration,
}

/// Default lifetime of a cached endpoint
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

impl ResolverOptions {
    /// Set the endpoint cache lifetime; `None` disables caching
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Derive the endpoint of a `did:web` DID from its host segment.
///
/// `did:web:example.com` → `https://example.com`, and `did:web:localhost%3A2583`
/// → `https://localhost:2583`. Any path segments after the host are ignored.
pub fn did_web_endpoint(did: &Did) -> Result<Url> {
    if did.method() != DidMethod::Web {
        return Err(ResolutionError::unsupported(did));
    }
    let host = did.identifier().split(':').next().unwrap_or_default();
    let host = percent_decode_str(host).decode_utf8_lossy();
    Ok(Url::parse(&format!("https://{host}"))?)
}

/// Well-known document URL for a `did:web` DID.
///
/// - `did:web:example.com` → `https://example.com/.well-known/did.json`
/// - `did:web:example.com:user:alice` → `https://example.com/user/alice/did.json`
pub fn did_web_doc_url(did: &Did) -> Result<Url> {
    let mut url = did_web_endpoint(did)?;
    let path: Vec<&str> = did.identifier().split(':').skip(1).collect();
    if path.is_empty() {
        url.set_path(".well-known/did.json");
    } else if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear();
        for seg in path {
            let decoded = percent_decode_str(seg).decode_utf8_lossy();
            segments.push(&decoded);
        }
        segments.push("did.json");
    }
    Ok(url)
}

/// Trait for identity resolution, for pluggable implementations.
pub trait IdentityResolver {
    /// Access options for validation decisions in default methods
    fn options(&self) -> &ResolverOptions;

    /// Resolve handle
    fn resolve_handle(
        &self,
        handle: &Handle,
    ) -> impl Future<Output = Result<Did>> + Send
    where
        Self: Sync;

    /// Fetch the DID document
    fn resolve_did_doc(
        &self,
        did: &Did,
    ) -> impl Future<Output = Result<DidDocResponse>> + Send
    where
        Self: Sync;

    /// Fetch and parse the DID document, applying the doc id check when enabled
    fn resolve_did_doc_owned(
        &self,
        did: &Did,
    ) -> impl Future<Output = Result<DidDocument>> + Send
    where
        Self: Sync,
    {
        async move {
            let resp = self.resolve_did_doc(did).await?;
            if self.options().validate_doc_id {
                resp.parse_validated()
            } else {
                resp.parse()
            }
        }
    }

    /// Return the PDS url for a DID
    fn pds_for_did(&self, did: &Did) -> impl Future<Output = Result<Url>> + Send
    where
        Self: Sync,
    {
        resolve_pds(self, did)
    }

    /// Return the DID and PDS url for a handle
    fn pds_for_handle(
        &self,
        handle: &Handle,
    ) -> impl Future<Output = Result<(Did, Url)>> + Send
    where
        Self: Sync,
    {
        async move {
            let did = self.resolve_handle(handle).await?;
            let pds = self.pds_for_did(&did).await?;
            Ok((did, pds))
        }
    }

    /// Forget anything remembered about `did`. No-op for uncached resolvers.
    fn invalidate(&self, _did: &Did) {}
}

/// Uncached DID → PDS resolution shared by implementations.
///
/// `did:web` makes no network call; `did:plc` fetches the document; anything
/// else is `UnsupportedDidMethod`.
pub async fn resolve_pds<R>(resolver: &R, did: &Did) -> Result<Url>
where
    R: IdentityResolver + Sync + ?Sized,
{
    match did.method() {
        DidMethod::Web => did_web_endpoint(did),
        DidMethod::Plc => {
            let doc = resolver.resolve_did_doc_owned(did).await?;
            doc.pds_endpoint()
                .ok_or_else(|| ResolutionError::NoServiceEndpoint {
                    did: SmolStr::new(did.as_str()),
                })
        }
        DidMethod::Other(_) => Err(ResolutionError::unsupported(did)),
    }
}

impl<T: IdentityResolver + Sync + Send> IdentityResolver for std::sync::Arc<T> {
    fn options(&self) -> &ResolverOptions {
        self.as_ref().options()
    }

    async fn resolve_handle(&self, handle: &Handle) -> Result<Did> {
        self.as_ref().resolve_handle(handle).await
    }

    async fn resolve_did_doc(&self, did: &Did) -> Result<DidDocResponse> {
        self.as_ref().resolve_did_doc(did).await
    }

    async fn pds_for_did(&self, did: &Did) -> Result<Url> {
        self.as_ref().pds_for_did(did).await
    }

    fn invalidate(&self, did: &Did) {
        self.as_ref().invalidate(did)
    }
}
