//! DPoP proof-of-possession keys and proofs (RFC 9449).
//!
//! A [`DpopKey`] is generated once per authorization attempt and travels with
//! the resulting session, so every proof for that session is signed by the same
//! key and the server-side token binding (`cnf.jkt`) holds across refreshes.

use std::fmt;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use http::{Request, Response, header::InvalidHeaderValue};
use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, Key, crypto};
use p256::ecdsa::SigningKey;
use elliptic_curve::sec1::ToEncodedPoint;
use rand::{RngCore, rngs::ThreadRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest;
use skein_common::error::TransportError;
use skein_common::http_client::{HttpClient, send_with_timeout};
use smol_str::SmolStr;

use crate::jose::{
    create_signed_jwt,
    jws::RegisteredHeader,
    jwt::{Claims, PublicClaims, RegisteredClaims, decode_unverified},
};
use crate::utils::compare_algos;

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";

/// How many times a request is re-sent after a `use_dpop_nonce` challenge.
pub const MAX_NONCE_RETRIES: usize = 1;

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum ProofError {
    #[error("failed to sign DPoP proof: {0}")]
    #[diagnostic(code(skein_oauth::dpop::signing))]
    Signing(#[from] serde_json::Error),

    #[error("access token is bound to key {actual}, but this session holds {expected}")]
    #[diagnostic(
        code(skein_oauth::dpop::thumbprint_mismatch),
        help("the token was issued for a different DPoP key; start a new authorization")
    )]
    ThumbprintMismatch { expected: SmolStr, actual: SmolStr },

    #[error("invalid DPoP key: {0}")]
    #[diagnostic(code(skein_oauth::dpop::invalid_key))]
    InvalidKey(SmolStr),

    #[error("no supported DPoP signing algorithm among {offered:?}")]
    #[diagnostic(
        code(skein_oauth::dpop::unsupported_algorithm),
        help("only ES256 DPoP keys are implemented")
    )]
    UnsupportedAlgorithm { offered: Vec<SmolStr> },

    #[error(transparent)]
    #[diagnostic(code(skein_oauth::dpop::invalid_header))]
    InvalidHeader(#[from] InvalidHeaderValue),
}

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum DpopError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Proof(#[from] ProofError),

    /// `retried` is false when the challenge carried no nonce to retry with.
    #[error("server kept demanding a fresh DPoP nonce (HTTP {status})")]
    #[diagnostic(
        code(skein_oauth::dpop::nonce_rejected),
        help("the retry with the server-provided nonce was also rejected")
    )]
    NonceRejected {
        status: http::StatusCode,
        retried: bool,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// A P-256 DPoP signing key.
///
/// `Debug` prints only the public thumbprint. Serializes as a private JWK, so
/// only hand the serialized form to trusted storage.
#[derive(Clone)]
pub struct DpopKey {
    secret: p256::SecretKey,
    thumbprint: SmolStr,
}

impl DpopKey {
    /// Fresh random ES256 key
    pub fn generate() -> Self {
        Self::from_secret(p256::SecretKey::random(&mut ThreadRng::default()))
    }

    /// Fresh key for the strongest of `allowed` that we implement.
    pub fn generate_for(allowed: &[SmolStr]) -> Result<Self, ProofError> {
        let mut algs = allowed.to_vec();
        algs.sort_by(compare_algos);
        for alg in &algs {
            #[allow(clippy::single_match)]
            match alg.as_str() {
                "ES256" => return Ok(Self::generate()),
                _ => {}
            }
        }
        Err(ProofError::UnsupportedAlgorithm { offered: algs })
    }

    pub fn from_secret(secret: p256::SecretKey) -> Self {
        let thumbprint = public_thumbprint(&secret.public_key());
        Self { secret, thumbprint }
    }

    /// Load from a private JWK
    pub fn from_jwk(key: &Key) -> Result<Self, ProofError> {
        match crypto::Key::try_from(key)
            .map_err(|e| ProofError::InvalidKey(format!("{e:?}").into()))?
        {
            crypto::Key::P256(crypto::Kind::Secret(sk)) => Ok(Self::from_secret(sk)),
            _ => Err(ProofError::InvalidKey("expected a P-256 private key".into())),
        }
    }

    /// Private JWK form
    pub fn to_jwk(&self) -> Key {
        Key::from(&crypto::Key::from(self.secret.clone()))
    }

    /// Public JWK, as embedded in proof headers
    pub fn public_jwk(&self) -> Jwk {
        Jwk {
            key: Key::from(&crypto::Key::from(self.secret.public_key())),
            prm: Default::default(),
        }
    }

    /// RFC 7638 SHA-256 thumbprint of the public key, base64url
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Build a compact ES256 DPoP proof for one request.
    ///
    /// `url` may carry a query or fragment; both are dropped from `htu`.
    pub fn build_proof(
        &self,
        method: &str,
        url: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<SmolStr, ProofError> {
        let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
        header.typ = Some(JWT_HEADER_TYP_DPOP.into());
        header.jwk = Some(self.public_jwk());

        let claims = Claims {
            registered: RegisteredClaims {
                jti: Some(generate_jti()),
                iat: Some(Utc::now().timestamp()),
                ..Default::default()
            },
            public: PublicClaims {
                htm: Some(method.into()),
                htu: Some(htu(url).into()),
                ath: access_token.map(access_token_hash),
                nonce: nonce.map(SmolStr::new),
            },
        };
        Ok(create_signed_jwt(
            SigningKey::from(self.secret.clone()),
            header.into(),
            claims,
        )?)
    }
}

impl fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopKey")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

impl PartialEq for DpopKey {
    fn eq(&self, other: &Self) -> bool {
        self.thumbprint == other.thumbprint
    }
}

impl Eq for DpopKey {}

impl Serialize for DpopKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_jwk().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DpopKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = Key::deserialize(deserializer)?;
        Self::from_jwk(&key).map_err(serde::de::Error::custom)
    }
}

/// RFC 7638 thumbprint of a P-256 public key given its base64url coordinates.
///
/// Members are serialized in lexicographic order with no whitespace.
pub fn jwk_thumbprint(x: &str, y: &str) -> SmolStr {
    let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
    URL_SAFE_NO_PAD
        .encode(sha2::Sha256::digest(canonical.as_bytes()))
        .into()
}

fn public_thumbprint(public: &p256::PublicKey) -> SmolStr {
    let point = public.to_encoded_point(false);
    // uncompressed points of a valid public key always carry both coordinates
    let x = point.x().map(|x| URL_SAFE_NO_PAD.encode(x)).unwrap_or_default();
    let y = point.y().map(|y| URL_SAFE_NO_PAD.encode(y)).unwrap_or_default();
    jwk_thumbprint(&x, &y)
}

/// `ath` claim: base64url(sha256(access_token))
pub fn access_token_hash(access_token: &str) -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(sha2::Sha256::digest(access_token.as_bytes()))
        .into()
}

fn htu(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

#[inline]
pub(crate) fn generate_jti() -> SmolStr {
    let mut bytes = [0u8; 12];
    ThreadRng::default().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes).into()
}

#[derive(Deserialize)]
struct Confirmation {
    jkt: Option<SmolStr>,
}

#[derive(Deserialize)]
struct BoundTokenClaims {
    cnf: Option<Confirmation>,
}

/// Check that a JWT access token's `cnf.jkt` names `key`.
///
/// Opaque tokens, and JWTs without a confirmation claim, pass: the binding is
/// then only enforced by the server.
pub fn verify_token_binding(key: &DpopKey, access_token: &str) -> Result<(), ProofError> {
    let bound = decode_unverified::<BoundTokenClaims>(access_token)
        .and_then(|c| c.cnf)
        .and_then(|c| c.jkt);
    match bound {
        Some(jkt) if jkt != key.thumbprint() => Err(ProofError::ThumbprintMismatch {
            expected: key.thumbprint.clone(),
            actual: jkt,
        }),
        _ => Ok(()),
    }
}

/// Which kind of server a DPoP request targets; they signal nonces differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceScope {
    /// Authorization server: PAR, token, revocation
    AuthServer,
    /// Resource server: the PDS
    Resource,
}

/// Key and nonce storage for a DPoP exchange.
pub trait DpopDataSource {
    fn key(&self) -> &DpopKey;
    fn authserver_nonce(&self) -> Option<SmolStr>;
    fn set_authserver_nonce(&mut self, nonce: SmolStr);
    fn host_nonce(&self) -> Option<SmolStr>;
    fn set_host_nonce(&mut self, nonce: SmolStr);

    fn nonce_for(&self, scope: NonceScope) -> Option<SmolStr> {
        match scope {
            NonceScope::AuthServer => self.authserver_nonce(),
            NonceScope::Resource => self.host_nonce(),
        }
    }

    fn store_nonce(&mut self, scope: NonceScope, nonce: SmolStr) {
        match scope {
            NonceScope::AuthServer => self.set_authserver_nonce(nonce),
            NonceScope::Resource => self.set_host_nonce(nonce),
        }
    }
}

/// Send `request` with a DPoP proof, answering one nonce challenge.
///
/// If the request carries `Authorization: DPoP <token>`, the proof binds that
/// token through `ath`. When the server asks for a nonce, the value from its
/// `DPoP-Nonce` header is stored in `data_source` and the request is sent once
/// more. A second challenge, or a challenge without a new nonce, is
/// [`DpopError::NonceRejected`].
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(method = %request.method(), scope = ?scope)))]
pub async fn wrap_request_with_dpop<T, N>(
    client: &T,
    data_source: &mut N,
    scope: NonceScope,
    request: Request<Vec<u8>>,
    timeout: Duration,
) -> Result<Response<Vec<u8>>, DpopError>
where
    T: HttpClient + ?Sized,
    N: DpopDataSource + ?Sized,
{
    let method = request.method().as_str().to_owned();
    let uri = request.uri().to_string();
    // https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
    let access_token = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("DPoP "))
        .map(str::to_owned);

    let mut nonce = data_source.nonce_for(scope);
    let mut attempt = 0;
    loop {
        let proof = data_source.key().build_proof(
            &method,
            &uri,
            nonce.as_deref(),
            access_token.as_deref(),
        )?;
        let mut req = request.clone();
        req.headers_mut()
            .insert("DPoP", proof.parse().map_err(ProofError::from)?);
        let response = send_with_timeout(client, req, timeout).await?;

        let fresh = response
            .headers()
            .get("DPoP-Nonce")
            .and_then(|v| v.to_str().ok())
            .map(SmolStr::new)
            .filter(|n| Some(n) != nonce.as_ref());
        if let Some(fresh) = &fresh {
            data_source.store_nonce(scope, fresh.clone());
        }

        if !is_use_dpop_nonce_error(scope, &response) {
            return Ok(response);
        }
        match fresh {
            Some(fresh) if attempt < MAX_NONCE_RETRIES => {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, "server requested DPoP nonce, retrying");
                nonce = Some(fresh);
                attempt += 1;
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, "DPoP nonce challenge repeated, giving up");
                return Err(DpopError::NonceRejected {
                    status: response.status(),
                    retried: attempt > 0,
                });
            }
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

#[inline]
pub(crate) fn is_use_dpop_nonce_error(scope: NonceScope, response: &Response<Vec<u8>>) -> bool {
    match scope {
        // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
        NonceScope::AuthServer => {
            response.status() == 400
                && serde_json::from_slice::<ErrorResponse>(response.body())
                    .is_ok_and(|res| res.error == "use_dpop_nonce")
        }
        // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
        NonceScope::Resource => {
            response.status() == 401
                && response
                    .headers()
                    .get(http::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|www| {
                        www.starts_with("DPoP") && www.contains(r#"error="use_dpop_nonce""#)
                    })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn decode_segment(token: &str, idx: usize) -> Vec<u8> {
        let part = token.split('.').nth(idx).unwrap();
        URL_SAFE_NO_PAD.decode(part).unwrap()
    }

    #[test]
    fn rfc9449_thumbprint_vector() {
        // public key and jkt from the RFC 9449 examples
        assert_eq!(
            jwk_thumbprint(
                "l8tFrhx-34tV3hRICRDY9zCkDlpBhF42UQUfWVAWBFs",
                "9VE4jf_Ok_o64zbTTlcuNJajHmt6v9TDVrU0CdvGRDA"
            ),
            "0ZcOCORZNYy-DWpqq30jZyJGHTN0d2HglBV3uiguA4I"
        );
    }

    #[test]
    fn thumbprint_stable_and_distinct() {
        let a = DpopKey::generate();
        let b = DpopKey::generate();
        assert_eq!(a.thumbprint(), a.clone().thumbprint());
        assert_ne!(a.thumbprint(), b.thumbprint());
        assert_eq!(a.thumbprint().len(), 43);
    }

    #[test]
    fn proof_shape_and_signature() {
        let key = DpopKey::generate();
        let proof = key
            .build_proof(
                "POST",
                "https://pds.example/xrpc/com.atproto.repo.createRecord?x=1#frag",
                Some("server-nonce"),
                Some("access-token"),
            )
            .unwrap();

        let header: serde_json::Value = serde_json::from_slice(&decode_segment(&proof, 0)).unwrap();
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["jwk"]["crv"], "P-256");
        assert!(header["jwk"].get("d").is_none(), "private part leaked");

        let claims: serde_json::Value = serde_json::from_slice(&decode_segment(&proof, 1)).unwrap();
        assert_eq!(claims["htm"], "POST");
        assert_eq!(
            claims["htu"],
            "https://pds.example/xrpc/com.atproto.repo.createRecord"
        );
        assert_eq!(claims["nonce"], "server-nonce");
        assert_eq!(claims["ath"], access_token_hash("access-token").as_str());
        assert!(claims["iat"].is_i64());
        assert_eq!(
            URL_SAFE_NO_PAD
                .decode(claims["jti"].as_str().unwrap())
                .unwrap()
                .len(),
            12
        );

        let sig = decode_segment(&proof, 2);
        assert_eq!(sig.len(), 64);
        let signature = Signature::from_slice(&sig).unwrap();
        let verifying = VerifyingKey::from(key.secret.public_key());
        let signed = proof.rsplit_once('.').unwrap().0;
        verifying.verify(signed.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn proof_omits_absent_nonce_and_ath() {
        let key = DpopKey::generate();
        let proof = key.build_proof("GET", "https://as.example/token", None, None).unwrap();
        let claims: serde_json::Value = serde_json::from_slice(&decode_segment(&proof, 1)).unwrap();
        assert!(claims.get("nonce").is_none());
        assert!(claims.get("ath").is_none());
    }

    #[test]
    fn jwk_roundtrip_keeps_thumbprint() {
        let key = DpopKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        let back: DpopKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back.thumbprint(), key.thumbprint());
        assert!(!format!("{key:?}").contains(&json));
    }

    #[test]
    fn generate_for_needs_es256() {
        assert!(DpopKey::generate_for(&["RS256".into(), "ES256".into()]).is_ok());
        assert!(matches!(
            DpopKey::generate_for(&["RS256".into()]),
            Err(ProofError::UnsupportedAlgorithm { .. })
        ));
    }

    fn fake_jwt(payload: serde_json::Value) -> String {
        format!(
            "e30.{}.sig",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        )
    }

    #[test]
    fn token_binding_checks_jkt() {
        let key = DpopKey::generate();
        let bound = fake_jwt(serde_json::json!({"cnf": {"jkt": key.thumbprint()}}));
        assert!(verify_token_binding(&key, &bound).is_ok());

        let other = fake_jwt(serde_json::json!({"cnf": {"jkt": "someone-else"}}));
        match verify_token_binding(&key, &other) {
            Err(ProofError::ThumbprintMismatch { expected, actual }) => {
                assert_eq!(expected, key.thumbprint());
                assert_eq!(actual, "someone-else");
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(verify_token_binding(&key, "opaque-token").is_ok());
    }

    #[derive(Clone, Default)]
    struct Queue {
        responses: Arc<Mutex<VecDeque<Response<Vec<u8>>>>>,
        seen: Arc<Mutex<Vec<Request<Vec<u8>>>>>,
    }

    impl HttpClient for Queue {
        type Error = std::convert::Infallible;

        async fn send_http(
            &self,
            request: Request<Vec<u8>>,
        ) -> Result<Response<Vec<u8>>, Self::Error> {
            self.seen.lock().await.push(request);
            Ok(self.responses.lock().await.pop_front().unwrap())
        }
    }

    struct Source {
        key: DpopKey,
        as_nonce: Option<SmolStr>,
        host_nonce: Option<SmolStr>,
    }

    impl DpopDataSource for Source {
        fn key(&self) -> &DpopKey {
            &self.key
        }
        fn authserver_nonce(&self) -> Option<SmolStr> {
            self.as_nonce.clone()
        }
        fn set_authserver_nonce(&mut self, nonce: SmolStr) {
            self.as_nonce = Some(nonce);
        }
        fn host_nonce(&self) -> Option<SmolStr> {
            self.host_nonce.clone()
        }
        fn set_host_nonce(&mut self, nonce: SmolStr) {
            self.host_nonce = Some(nonce);
        }
    }

    fn nonce_challenge_as(nonce: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(400)
            .header("DPoP-Nonce", nonce)
            .body(br#"{"error":"use_dpop_nonce"}"#.to_vec())
            .unwrap()
    }

    fn nonce_challenge_rs(nonce: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(401)
            .header("DPoP-Nonce", nonce)
            .header(
                "WWW-Authenticate",
                r#"DPoP error="use_dpop_nonce", error_description="Resource server requires nonce in DPoP proof""#,
            )
            .body(Vec::new())
            .unwrap()
    }

    fn source() -> Source {
        Source {
            key: DpopKey::generate(),
            as_nonce: None,
            host_nonce: None,
        }
    }

    fn proof_nonce(req: &Request<Vec<u8>>) -> Option<String> {
        let proof = req.headers().get("DPoP").unwrap().to_str().unwrap();
        let claims: serde_json::Value = serde_json::from_slice(&decode_segment(proof, 1)).unwrap();
        claims.get("nonce").and_then(|v| v.as_str()).map(str::to_owned)
    }

    #[tokio::test]
    async fn auth_server_nonce_retry_once() {
        let client = Queue::default();
        {
            let mut q = client.responses.lock().await;
            q.push_back(nonce_challenge_as("n1"));
            q.push_back(Response::builder().status(200).body(b"{}".to_vec()).unwrap());
        }
        let mut src = source();
        let req = Request::post("https://as.example/token").body(Vec::new()).unwrap();
        let resp = wrap_request_with_dpop(
            &client,
            &mut src,
            NonceScope::AuthServer,
            req,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(src.as_nonce.as_deref(), Some("n1"));

        let seen = client.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(proof_nonce(&seen[0]), None);
        assert_eq!(proof_nonce(&seen[1]).as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn resource_nonce_rejected_after_one_retry() {
        let client = Queue::default();
        {
            let mut q = client.responses.lock().await;
            q.push_back(nonce_challenge_rs("n1"));
            q.push_back(nonce_challenge_rs("n2"));
        }
        let mut src = source();
        let req = Request::get("https://pds.example/xrpc/com.atproto.repo.getRecord?repo=x")
            .header("Authorization", "DPoP tok")
            .body(Vec::new())
            .unwrap();
        let err = wrap_request_with_dpop(
            &client,
            &mut src,
            NonceScope::Resource,
            req,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DpopError::NonceRejected { status, retried: true } if status == 401));
        assert_eq!(client.seen.lock().await.len(), 2);
        assert_eq!(src.host_nonce.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn challenge_without_new_nonce_is_not_retried() {
        let client = Queue::default();
        client.responses.lock().await.push_back(
            Response::builder()
                .status(400)
                .body(br#"{"error":"use_dpop_nonce"}"#.to_vec())
                .unwrap(),
        );
        let mut src = source();
        let req = Request::post("https://as.example/par").body(Vec::new()).unwrap();
        let err = wrap_request_with_dpop(
            &client,
            &mut src,
            NonceScope::AuthServer,
            req,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DpopError::NonceRejected { retried: false, .. }));
        assert_eq!(client.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn known_nonce_sent_up_front() {
        let client = Queue::default();
        client
            .responses
            .lock()
            .await
            .push_back(Response::builder().status(200).body(Vec::new()).unwrap());
        let mut src = source();
        src.host_nonce = Some("remembered".into());
        let req = Request::get("https://pds.example/xrpc/x").body(Vec::new()).unwrap();
        wrap_request_with_dpop(
            &client,
            &mut src,
            NonceScope::Resource,
            req,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let seen = client.seen.lock().await;
        assert_eq!(proof_nonce(&seen[0]).as_deref(), Some("remembered"));
    }
}
