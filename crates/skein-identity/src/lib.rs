//! DID and endpoint resolution for the AT Protocol
//!
//! Maps an account DID to the base URL of its Personal Data Server.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use skein_identity::{SkeinResolver, resolver::IdentityResolver};
//! use skein_common::types::Did;
//!
//! let resolver = SkeinResolver::default();
//! let pds = resolver.pds_for_did(&Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz")?).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resolution rules
//!
//! - `did:plc`: fetched from the PLC directory, PDS taken from the
//!   `AtprotoPersonalDataServer` service entry.
//! - `did:web:{host}`: `https://{host}`, no network call.
//! - Anything else: [`ResolutionError::UnsupportedDidMethod`](resolver::ResolutionError).
//!
//! Successful `did:plc` resolutions are cached for
//! [`ResolverOptions::cache_ttl`](resolver::ResolverOptions) (five minutes by default).

#![warn(missing_docs)]
pub mod resolver;

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::StatusCode;
use skein_common::error::TransportError;
use skein_common::http_client::{HttpClient, send_with_timeout};
use skein_common::types::did::{Did, DidMethod};
use skein_common::types::Handle;
use smol_str::SmolStr;
use tokio::time::Instant;
use url::Url;

pub use crate::resolver::{
    DidDocResponse, IdentityResolver, PlcSource, ResolutionError, ResolverOptions,
};

#[derive(Debug, Clone)]
struct CachedEndpoint {
    url: Url,
    fetched_at: Instant,
}

/// Default resolver implementation over any [`HttpClient`].
#[derive(Clone)]
pub struct SkeinResolver<C = reqwest::Client> {
    http: C,
    opts: ResolverOptions,
    cache: Arc<DashMap<Did, CachedEndpoint>>,
}

impl<C> SkeinResolver<C> {
    /// Create a resolver with the given HTTP client and options
    pub fn new(http: C, opts: ResolverOptions) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            validate_doc_id = opts.validate_doc_id,
            plc_source = %opts.plc_source.base,
            cache_ttl_secs = opts.cache_ttl.map(|d| d.as_secs()),
            "skein resolver created"
        );

        Self {
            http,
            opts,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Set PLC source
    pub fn with_plc_source(mut self, source: PlcSource) -> Self {
        self.opts.plc_source = source;
        self
    }

    /// Enable/disable doc id validation
    pub fn with_validate_doc_id(mut self, enable: bool) -> Self {
        self.opts.validate_doc_id = enable;
        self
    }

    /// Access the underlying HTTP client
    pub fn http(&self) -> &C {
        &self.http
    }

    /// Number of live cache entries (expired ones included until next lookup)
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, did: &Did) -> Option<Url> {
        let ttl = self.opts.cache_ttl?;
        let entry = self.cache.get(did)?;
        if entry.fetched_at.elapsed() < ttl {
            Some(entry.url.clone())
        } else {
            drop(entry);
            self.cache.remove(did);
            None
        }
    }

    fn remember(&self, did: &Did, url: &Url) {
        if self.opts.cache_ttl.is_some() {
            self.cache.insert(
                did.clone(),
                CachedEndpoint {
                    url: url.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
    }
}

impl<C: HttpClient + Sync> SkeinResolver<C> {
    async fn get_bytes(&self, url: &Url) -> Result<(Bytes, StatusCode), TransportError> {
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(url.as_str())
            .header(http::header::ACCEPT, "application/json")
            .body(Vec::new())?;
        let response = send_with_timeout(&self.http, request, self.opts.timeout).await?;
        let status = response.status();
        Ok((Bytes::from(response.into_body()), status))
    }

    fn parse_atproto_did_body(body: &[u8]) -> Option<Did> {
        let text = std::str::from_utf8(body).ok()?;
        let line = text.lines().find(|l| !l.trim().is_empty())?;
        Did::new(line.trim()).ok()
    }
}

impl Default for SkeinResolver<reqwest::Client> {
    /// Resolver backed by a reqwest client with default timeouts and options
    fn default() -> Self {
        let http = skein_common::http_client::default_reqwest_client()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new(http, ResolverOptions::default())
    }
}

impl<C: HttpClient + Sync + Send> IdentityResolver for SkeinResolver<C> {
    fn options(&self) -> &ResolverOptions {
        &self.opts
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(handle = %handle)))]
    async fn resolve_handle(&self, handle: &Handle) -> resolver::Result<Did> {
        let url = Url::parse(&format!("https://{handle}/.well-known/atproto-did"))?;
        let not_resolved = |source| ResolutionError::HandleNotResolved {
            handle: SmolStr::new(handle.as_str()),
            source,
        };
        let (body, status) = self.get_bytes(&url).await.map_err(|e| not_resolved(Some(e)))?;
        if !status.is_success() {
            return Err(not_resolved(None));
        }
        Self::parse_atproto_did_body(&body).ok_or_else(|| not_resolved(None))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(did = %did)))]
    async fn resolve_did_doc(&self, did: &Did) -> resolver::Result<DidDocResponse> {
        let url = match did.method() {
            DidMethod::Plc => self.opts.plc_source.doc_url(did)?,
            DidMethod::Web => resolver::did_web_doc_url(did)?,
            DidMethod::Other(_) => return Err(ResolutionError::unsupported(did)),
        };
        let (buffer, status) = self
            .get_bytes(&url)
            .await
            .map_err(|e| ResolutionError::directory_transport(did, e))?;
        Ok(DidDocResponse {
            buffer,
            status,
            requested: did.clone(),
        })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(did = %did)))]
    async fn pds_for_did(&self, did: &Did) -> resolver::Result<Url> {
        if let Some(url) = self.cached(did) {
            #[cfg(feature = "tracing")]
            tracing::debug!(pds = %url, "endpoint cache hit");
            return Ok(url);
        }
        let url = resolver::resolve_pds(self, did).await?;
        if did.method() == DidMethod::Plc {
            self.remember(did, &url);
        }
        Ok(url)
    }

    fn invalidate(&self, did: &Did) {
        self.cache.remove(did);
    }
}

impl<C: HttpClient + Sync> HttpClient for SkeinResolver<C> {
    type Error = C::Error;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
        self.http.send_http(request).await
    }
}
