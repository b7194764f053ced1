use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use skein_common::http_client::HttpClient;
use skein_identity::SkeinResolver;
use skein_identity::resolver::ResolverOptions;
use skein_oauth::atproto::AtprotoClientMetadata;
use skein_oauth::authstore::{ClientAuthStore, MemoryAuthStore};
use skein_oauth::flow::{ClientData, FlowState, ParMode};
use skein_oauth::types::{AuthorizeOptions, CallbackParams};
use skein_oauth::{FlowError, OAuthClient};
use tokio::sync::Mutex;
use url::Url;

#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<Mutex<VecDeque<http::Response<Vec<u8>>>>>,
    log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
}

impl MockClient {
    async fn push(&self, status: u16, body: serde_json::Value) {
        self.push_with_nonce(status, body, None).await;
    }

    async fn push_with_nonce(&self, status: u16, body: serde_json::Value, nonce: Option<&str>) {
        let mut builder = http::Response::builder().status(status);
        if let Some(nonce) = nonce {
            builder = builder.header("DPoP-Nonce", nonce);
        }
        let resp = builder.body(serde_json::to_vec(&body).unwrap()).unwrap();
        self.queue.lock().await.push_back(resp);
    }

    async fn calls(&self) -> usize {
        self.log.lock().await.len()
    }
}

impl HttpClient for MockClient {
    type Error = std::convert::Infallible;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, Self::Error> {
        self.log.lock().await.push(request);
        Ok(self
            .queue
            .lock()
            .await
            .pop_front()
            .expect("no queued response"))
    }
}

const ACCOUNT: &str = "did:web:alice.example";

fn protected_resource() -> serde_json::Value {
    serde_json::json!({
        "resource": "https://alice.example",
        "authorization_servers": ["https://auth.example"]
    })
}

fn auth_server(require_par: bool) -> serde_json::Value {
    serde_json::json!({
        "issuer": "https://auth.example",
        "authorization_endpoint": "https://auth.example/oauth/authorize",
        "token_endpoint": "https://auth.example/oauth/token",
        "revocation_endpoint": "https://auth.example/oauth/revoke",
        "pushed_authorization_request_endpoint": "https://auth.example/oauth/par",
        "require_pushed_authorization_requests": require_par,
        "authorization_response_iss_parameter_supported": true,
        "dpop_signing_alg_values_supported": ["ES256"],
        "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
        "scopes_supported": ["atproto", "transition:generic"],
        "protected_resources": ["https://alice.example"]
    })
}

fn client_data(par_mode: ParMode) -> ClientData {
    ClientData::builder()
        .config(
            AtprotoClientMetadata::builder()
                .client_id(Url::parse("https://app.example/client-metadata.json").unwrap())
                .redirect_uris(vec![Url::parse("https://app.example/callback").unwrap()])
                .build(),
        )
        .par_mode(par_mode)
        .build()
}

fn oauth_client(http: &MockClient, par_mode: ParMode) -> OAuthClient<MemoryAuthStore> {
    let resolver = SkeinResolver::new(http.clone(), ResolverOptions::default());
    OAuthClient::atproto(MemoryAuthStore::new(), resolver, client_data(par_mode)).unwrap()
}

fn proof_claims(request: &http::Request<Vec<u8>>) -> serde_json::Value {
    let proof = request.headers()["DPoP"].to_str().unwrap();
    let payload = proof.split('.').nth(1).unwrap();
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
}

fn form_field(request: &http::Request<Vec<u8>>, name: &str) -> Option<String> {
    let form: Vec<(String, String)> = serde_html_form::from_bytes(request.body()).unwrap();
    form.into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

/// Queue discovery plus a PAR that first demands a nonce. Returns the state sent.
async fn start(http: &MockClient, client: &OAuthClient<MemoryAuthStore>) -> (Url, String) {
    http.push(200, protected_resource()).await;
    http.push(200, auth_server(true)).await;
    http.push_with_nonce(
        400,
        serde_json::json!({"error": "use_dpop_nonce"}),
        Some("as-nonce-1"),
    )
    .await;
    http.push(
        201,
        serde_json::json!({"request_uri": "urn:ietf:params:oauth:request_uri:req-1", "expires_in": 90}),
    )
    .await;

    let url = client
        .start_auth(ACCOUNT, AuthorizeOptions::default())
        .await
        .unwrap();
    let log = http.log.lock().await;
    let state = form_field(&log[3], "state").unwrap();
    (url, state)
}

#[tokio::test]
async fn login_produces_session_bound_to_request_key() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Auto);

    let (url, state) = start(&http, &client).await;
    assert_eq!(http.calls().await, 4);
    assert!(url.as_str().starts_with("https://auth.example/oauth/authorize?"));
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(query.contains(&(
        "request_uri".into(),
        "urn:ietf:params:oauth:request_uri:req-1".into()
    )));
    assert!(query.contains(&(
        "client_id".into(),
        "https://app.example/client-metadata.json".into()
    )));

    {
        let log = http.log.lock().await;
        // first PAR attempt had no nonce, the retry carried the one handed out
        assert!(proof_claims(&log[2]).get("nonce").is_none());
        assert_eq!(proof_claims(&log[3])["nonce"], "as-nonce-1");
        assert_eq!(form_field(&log[3], "code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(form_field(&log[3], "login_hint").as_deref(), Some(ACCOUNT));
    }

    let pending = client
        .sessions()
        .store()
        .get_auth_req_info(&state)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.flow_state, FlowState::CallbackPending);
    let request_thumbprint = pending.dpop_key.thumbprint().to_owned();

    http.push(200, auth_server(true)).await;
    http.push(
        200,
        serde_json::json!({
            "access_token": "opaque-access",
            "token_type": "DPoP",
            "expires_in": 3600,
            "refresh_token": "opaque-refresh",
            "scope": "atproto",
            "sub": ACCOUNT
        }),
    )
    .await;
    http.push(200, protected_resource()).await;
    http.push(200, auth_server(true)).await;

    let session = client
        .callback(CallbackParams {
            code: Some("auth-code".into()),
            state: Some(state.clone().into()),
            iss: Some("https://auth.example".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(session.dpop_key.thumbprint(), request_thumbprint);
    assert_eq!(session.account_did.as_str(), ACCOUNT);
    assert_eq!(session.host_url.as_str(), "https://alice.example/");
    assert_eq!(session.endpoints.issuer, "https://auth.example/");
    assert_eq!(session.authserver_nonce.as_deref(), Some("as-nonce-1"));
    assert_eq!(http.calls().await, 8);

    {
        let log = http.log.lock().await;
        let token_request = &log[5];
        assert_eq!(token_request.uri().to_string(), "https://auth.example/oauth/token");
        assert_eq!(proof_claims(token_request)["nonce"], "as-nonce-1");
        assert_eq!(proof_claims(token_request)["htm"], "POST");
        assert_eq!(
            form_field(token_request, "code_verifier").as_deref(),
            Some(pending.verifier.as_str())
        );
        assert_eq!(
            form_field(token_request, "redirect_uri").as_deref(),
            Some("https://app.example/callback")
        );
    }

    // the request is single use; the session is stored
    assert!(
        client
            .sessions()
            .store()
            .get_auth_req_info(&state)
            .await
            .unwrap()
            .is_none()
    );
    let restored = client.restore(&session.account_did, &session.session_id).await.unwrap();
    assert_eq!(restored.dpop_key.thumbprint(), request_thumbprint);
}

#[tokio::test]
async fn par_required_but_disabled() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Never);
    http.push(200, protected_resource()).await;
    http.push(200, auth_server(true)).await;

    let err = client
        .start_auth(ACCOUNT, AuthorizeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::ParRequired));
    assert_eq!(http.calls().await, 2);
    assert_eq!(client.sessions().store().pending_count().await, 0);
}

#[tokio::test]
async fn plain_redirect_without_par() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Never);
    http.push(200, protected_resource()).await;
    http.push(200, auth_server(false)).await;

    let url = client
        .start_auth(ACCOUNT, AuthorizeOptions::default())
        .await
        .unwrap();
    assert_eq!(http.calls().await, 2);
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let get = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(get("response_type").as_deref(), Some("code"));
    assert_eq!(get("code_challenge_method").as_deref(), Some("S256"));
    assert_eq!(get("redirect_uri").as_deref(), Some("https://app.example/callback"));
    assert_eq!(get("scope").as_deref(), Some("atproto"));
    let state = get("state").unwrap();
    assert!(
        client
            .sessions()
            .store()
            .get_auth_req_info(&state)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn callback_rejections() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Auto);

    let err = client.callback(CallbackParams::default()).await.unwrap_err();
    assert!(matches!(err, FlowError::MissingState));

    let err = client
        .callback(CallbackParams {
            code: Some("c".into()),
            state: Some("never-issued".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::UnknownState(_)));

    let (_, state) = start(&http, &client).await;
    let err = client
        .callback(CallbackParams {
            code: Some("c".into()),
            state: Some(state.clone().into()),
            iss: Some("https://evil.example".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::IssuerMismatch { actual: Some(_), .. }));

    // consumed by the failed attempt
    let err = client
        .callback(CallbackParams {
            code: Some("c".into()),
            state: Some(state.into()),
            iss: Some("https://auth.example".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::UnknownState(_)));
    assert_eq!(http.calls().await, 4);
}

#[tokio::test]
async fn missing_iss_and_expiry() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Auto);

    let (_, state) = start(&http, &client).await;
    let err = client
        .callback(CallbackParams {
            code: Some("c".into()),
            state: Some(state.into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::IssuerMismatch { actual: None, .. }));

    http.log.lock().await.clear();
    let (_, state) = start(&http, &client).await;
    let store = client.sessions().store();
    let mut pending = store.get_auth_req_info(&state).await.unwrap().unwrap();
    pending.expires_at = chrono::Utc::now() - chrono::TimeDelta::seconds(1);
    store.save_auth_req_info(&pending).await.unwrap();

    let err = client
        .callback(CallbackParams {
            code: Some("c".into()),
            state: Some(state.into()),
            iss: Some("https://auth.example".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::RequestExpired));
}

#[tokio::test]
async fn rejected_code_is_classified() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Auto);
    let (_, state) = start(&http, &client).await;

    http.push(200, auth_server(true)).await;
    http.push(
        400,
        serde_json::json!({"error": "invalid_grant", "error_description": "Invalid code"}),
    )
    .await;

    let err = client
        .callback(CallbackParams {
            code: Some("stale".into()),
            state: Some(state.into()),
            iss: Some("https://auth.example".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::CodeExchangeRejected { ref error, .. } if error == "invalid_grant"));
    assert_eq!(client.sessions().store().session_count().await, 0);
}

#[tokio::test]
async fn denied_by_user() {
    let http = MockClient::default();
    let client = oauth_client(&http, ParMode::Auto);
    let (_, state) = start(&http, &client).await;

    let err = client
        .callback(CallbackParams {
            state: Some(state.into()),
            error: Some("access_denied".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Denied { ref error, .. } if error == "access_denied"));
}
