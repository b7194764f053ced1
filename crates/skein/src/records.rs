//! Record operations against the account's PDS.
//!
//! [`RecordClient`] wraps the `com.atproto.repo.*` XRPC procedures. Each call
//! takes the live [`Session`], resolves the PDS for the session's DID, and
//! sends the access token with a DPoP proof bound to the exact method and URL.
//! Nonces handed out by a PDS are remembered per origin and reused on the next
//! call to that origin.

use std::fmt;
use std::time::Duration;

use bon::Builder;
use chrono::Utc;
use dashmap::DashMap;
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skein_common::error::XrpcErrorBody;
use skein_common::http_client::{DEFAULT_TIMEOUT, HttpClient};
use skein_common::types::{AtUri, Nsid};
use skein_identity::SkeinResolver;
use skein_identity::resolver::IdentityResolver;
use skein_oauth::dpop::{DpopDataSource, DpopKey, NonceScope, wrap_request_with_dpop};
use skein_oauth::session::Session;
use smol_str::SmolStr;

use crate::error::{Error, Result};

const CREATE_RECORD: &str = "com.atproto.repo.createRecord";
const GET_RECORD: &str = "com.atproto.repo.getRecord";
const LIST_RECORDS: &str = "com.atproto.repo.listRecords";
const PUT_RECORD: &str = "com.atproto.repo.putRecord";
const DELETE_RECORD: &str = "com.atproto.repo.deleteRecord";

/// Largest page `listRecords` accepts.
pub const MAX_LIST_LIMIT: u16 = 100;

const RKEY_MAX_LEN: usize = 512;

/// Content identifier of a record version, as returned by the PDS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(SmolStr);

impl Cid {
    pub fn new(cid: impl Into<SmolStr>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address and version of a record the server just wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub uri: AtUri,
    pub cid: Cid,
}

/// A record as stored in a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Record<T> {
    pub uri: AtUri,
    /// Absent only when the server could not report the version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    pub value: T,
}

/// One page of `listRecords`. Pass `cursor` back unchanged to continue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ListPage<T> {
    pub records: Vec<Record<T>>,
    #[serde(default)]
    pub cursor: Option<SmolStr>,
}

/// Per-client call settings.
#[derive(Debug, Clone, Builder)]
pub struct CallOptions {
    /// Bound on each HTTP exchange, the nonce retry included
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
    /// Ask the PDS to validate writes against the lexicon (`None` leaves it to the server)
    pub validate: Option<bool>,
    /// `atproto-proxy` header value
    #[builder(into)]
    pub atproto_proxy: Option<SmolStr>,
    /// Extra headers sent with every call
    #[builder(default)]
    pub extra_headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecordInput<'a, T> {
    repo: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rkey: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validate: Option<bool>,
    record: &'a T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutRecordInput<'a, T> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    validate: Option<bool>,
    record: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    swap_record: Option<&'a str>,
}

#[derive(Serialize)]
struct RecordParams<'a> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
}

#[derive(Serialize)]
struct ListRecordsParams<'a> {
    repo: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

/// Nonces for one PDS origin, seeded from the session.
struct HostNonces<'a> {
    key: &'a DpopKey,
    origin: String,
    seen: &'a DashMap<String, SmolStr>,
    fallback: Option<SmolStr>,
}

impl DpopDataSource for HostNonces<'_> {
    fn key(&self) -> &DpopKey {
        self.key
    }

    fn authserver_nonce(&self) -> Option<SmolStr> {
        None
    }

    fn set_authserver_nonce(&mut self, _nonce: SmolStr) {}

    fn host_nonce(&self) -> Option<SmolStr> {
        self.seen
            .get(&self.origin)
            .map(|n| n.value().clone())
            .or_else(|| self.fallback.clone())
    }

    fn set_host_nonce(&mut self, nonce: SmolStr) {
        self.seen.insert(self.origin.clone(), nonce);
    }
}

enum Body {
    Query(String),
    Json(Vec<u8>),
}

/// Record CRUD over XRPC with DPoP-bound access tokens.
pub struct RecordClient<R = SkeinResolver<reqwest::Client>> {
    resolver: R,
    options: CallOptions,
    nonces: DashMap<String, SmolStr>,
}

impl<R> RecordClient<R> {
    pub fn new(resolver: R) -> Self {
        Self::with_options(resolver, CallOptions::default())
    }

    pub fn with_options(resolver: R, options: CallOptions) -> Self {
        Self {
            resolver,
            options,
            nonces: DashMap::new(),
        }
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Last DPoP nonce seen from `origin` (e.g. `https://pds.example`).
    pub fn nonce_for_origin(&self, origin: &str) -> Option<SmolStr> {
        self.nonces.get(origin).map(|n| n.value().clone())
    }
}

impl<R> RecordClient<R>
where
    R: IdentityResolver + HttpClient + Send + Sync,
{
    /// Write a new record. The server picks the record key when `rkey` is `None`.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %session.account_did, collection = %collection)))]
    pub async fn create<T: Serialize + Sync>(
        &self,
        session: &Session,
        collection: &str,
        rkey: Option<&str>,
        value: &T,
    ) -> Result<RecordRef> {
        validate_collection(collection)?;
        if let Some(rkey) = rkey {
            validate_rkey(rkey)?;
        }
        let body = encode(&CreateRecordInput {
            repo: session.account_did.as_str(),
            collection,
            rkey,
            validate: self.options.validate,
            record: value,
        })?;
        let response = self
            .send(session, Method::POST, CREATE_RECORD, Body::Json(body))
            .await?;
        decode(&response)
    }

    /// Fetch one record. Missing records are [`Error::RecordNotFound`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(uri = %uri)))]
    pub async fn get<T: DeserializeOwned>(
        &self,
        session: &Session,
        uri: &AtUri,
    ) -> Result<Record<T>> {
        validate_record_uri(uri)?;
        let query = encode_query(&RecordParams {
            repo: &uri.did,
            collection: &uri.collection,
            rkey: &uri.rkey,
        })?;
        let response = self
            .send(session, Method::GET, GET_RECORD, Body::Query(query))
            .await
            .map_err(|e| match e {
                Error::Xrpc { status, error, .. }
                    if status == StatusCode::NOT_FOUND || error == "RecordNotFound" =>
                {
                    Error::RecordNotFound {
                        uri: SmolStr::new(uri.to_string()),
                    }
                }
                e => e,
            })?;
        decode(&response)
    }

    /// One page of a collection in the session's repository.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(collection = %collection, limit = ?limit)))]
    pub async fn list<T: DeserializeOwned>(
        &self,
        session: &Session,
        collection: &str,
        limit: Option<u16>,
        cursor: Option<&str>,
    ) -> Result<ListPage<T>> {
        validate_collection(collection)?;
        if let Some(limit) = limit {
            if limit == 0 || limit > MAX_LIST_LIMIT {
                return Err(Error::invalid(
                    "limit",
                    format!("must be between 1 and {MAX_LIST_LIMIT}"),
                ));
            }
        }
        let query = encode_query(&ListRecordsParams {
            repo: session.account_did.as_str(),
            collection,
            limit,
            cursor,
        })?;
        let response = self
            .send(session, Method::GET, LIST_RECORDS, Body::Query(query))
            .await?;
        decode(&response)
    }

    /// Replace a record, returning the CID of the new version.
    pub async fn update<T: Serialize + Sync>(
        &self,
        session: &Session,
        uri: &AtUri,
        value: &T,
    ) -> Result<Cid> {
        self.put(session, uri, value, None).await
    }

    /// Replace a record only if its current version is `expected`.
    ///
    /// A concurrent change shows up as [`Error::SwapConflict`].
    pub async fn update_if<T: Serialize + Sync>(
        &self,
        session: &Session,
        uri: &AtUri,
        value: &T,
        expected: &Cid,
    ) -> Result<Cid> {
        self.put(session, uri, value, Some(expected)).await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(uri = %uri, swap = expected.is_some())))]
    async fn put<T: Serialize + Sync>(
        &self,
        session: &Session,
        uri: &AtUri,
        value: &T,
        expected: Option<&Cid>,
    ) -> Result<Cid> {
        validate_own_record(session, uri)?;
        let body = encode(&PutRecordInput {
            repo: &uri.did,
            collection: &uri.collection,
            rkey: &uri.rkey,
            validate: self.options.validate,
            record: value,
            swap_record: expected.map(Cid::as_str),
        })?;
        let response = self
            .send(session, Method::POST, PUT_RECORD, Body::Json(body))
            .await
            .map_err(|e| match e {
                Error::Xrpc { error, message, .. } if error == "InvalidSwap" => {
                    Error::SwapConflict {
                        uri: SmolStr::new(uri.to_string()),
                        message,
                    }
                }
                e => e,
            })?;
        let written: RecordRef = decode(&response)?;
        Ok(written.cid)
    }

    /// Delete a record. Deleting a record that does not exist succeeds.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(uri = %uri)))]
    pub async fn delete(&self, session: &Session, uri: &AtUri) -> Result<()> {
        validate_own_record(session, uri)?;
        let body = encode(&RecordParams {
            repo: &uri.did,
            collection: &uri.collection,
            rkey: &uri.rkey,
        })?;
        self.send(session, Method::POST, DELETE_RECORD, Body::Json(body))
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        session: &Session,
        method: Method,
        nsid: &'static str,
        body: Body,
    ) -> Result<Response<Vec<u8>>> {
        if session.token_set.is_expired(Utc::now()) {
            return Err(Error::TokenExpired);
        }

        let pds = self
            .resolver
            .pds_for_did(&session.account_did)
            .await
            .map_err(|e| Error::from(e).with_context(nsid))?;
        let mut uri = format!("{}/xrpc/{}", pds.as_str().trim_end_matches('/'), nsid);

        let mut builder = Request::builder()
            .method(method)
            .header(AUTHORIZATION, format!("DPoP {}", session.access_token()));
        if let Some(proxy) = &self.options.atproto_proxy {
            builder = builder.header("atproto-proxy", proxy.as_str());
        }
        for (name, value) in &self.options.extra_headers {
            builder = builder.header(name, value);
        }
        let payload = match body {
            Body::Query(qs) => {
                if !qs.is_empty() {
                    uri.push('?');
                    uri.push_str(&qs);
                }
                Vec::new()
            }
            Body::Json(bytes) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                bytes
            }
        };
        let request = builder.uri(&uri).body(payload)?;

        let mut nonces = HostNonces {
            key: &session.dpop_key,
            origin: pds.origin().ascii_serialization(),
            seen: &self.nonces,
            fallback: session.host_nonce.clone(),
        };
        let response = wrap_request_with_dpop(
            &self.resolver,
            &mut nonces,
            NonceScope::Resource,
            request,
            self.options.timeout,
        )
        .await
        .map_err(|e| Error::from(e).with_context(nsid))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::UNAUTHORIZED {
            Err(classify_unauthorized(&response))
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%status, nsid, "XRPC call failed");
            Err(Error::xrpc(status, response.body()))
        }
    }
}

fn classify_unauthorized(response: &Response<Vec<u8>>) -> Error {
    let body = XrpcErrorBody::parse(response.body());
    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(challenge_error);

    let expired = challenge.as_deref() == Some("invalid_token")
        || body.as_ref().is_some_and(|b| b.error == "ExpiredToken");
    if expired {
        return Error::TokenExpired;
    }
    let (error, message) = match body {
        Some(XrpcErrorBody { error, message }) => (Some(error), message),
        None => (challenge, None),
    };
    Error::AuthRejected {
        status: response.status(),
        error,
        message,
    }
}

/// The `error="..."` parameter of a `WWW-Authenticate: DPoP ...` challenge.
fn challenge_error(header: &str) -> Option<SmolStr> {
    let params = header
        .strip_prefix("DPoP")
        .or_else(|| header.strip_prefix("Bearer"))?;
    params.split(',').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        (name.trim() == "error").then(|| SmolStr::new(value.trim().trim_matches('"')))
    })
}

fn encode<T: Serialize>(input: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(input).map_err(|e| Error::invalid("value", e.to_string()))
}

fn encode_query<T: Serialize>(params: &T) -> Result<String> {
    serde_html_form::to_string(params).map_err(|e| Error::invalid("parameters", e.to_string()))
}

fn decode<T: DeserializeOwned>(response: &Response<Vec<u8>>) -> Result<T> {
    serde_json::from_slice(response.body()).map_err(Error::Decode)
}

fn validate_collection(collection: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(Error::invalid("collection", "must not be empty"));
    }
    Nsid::new(collection).map_err(|e| Error::invalid("collection", e.to_string()))?;
    Ok(())
}

fn validate_rkey(rkey: &str) -> Result<()> {
    if rkey.is_empty() {
        return Err(Error::invalid("rkey", "must not be empty"));
    }
    if rkey.len() > RKEY_MAX_LEN {
        return Err(Error::invalid("rkey", format!("longer than {RKEY_MAX_LEN} bytes")));
    }
    if rkey == "." || rkey == ".." {
        return Err(Error::invalid("rkey", "`.` and `..` are reserved"));
    }
    if !rkey
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'~'))
    {
        return Err(Error::invalid("rkey", "contains characters outside [A-Za-z0-9._:~-]"));
    }
    Ok(())
}

fn validate_record_uri(uri: &AtUri) -> Result<()> {
    uri.repo_did()
        .map_err(|e| Error::invalid("uri", e.to_string()))?;
    if !uri.is_record() {
        return Err(Error::invalid("uri", "collection and record key are required"));
    }
    validate_collection(&uri.collection)?;
    validate_rkey(&uri.rkey)
}

/// Writes only target the session's own repository.
fn validate_own_record(session: &Session, uri: &AtUri) -> Result<()> {
    validate_record_uri(uri)?;
    if uri.did != session.account_did.as_str() {
        return Err(Error::invalid(
            "uri",
            format!("record belongs to {}, not {}", uri.did, session.account_did),
        ));
    }
    Ok(())
}
