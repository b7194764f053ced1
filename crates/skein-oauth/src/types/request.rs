use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationResponseType {
    Code,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub enum AuthorizationCodeChallengeMethod {
    S256,
}

/// Authorization request parameters, sent either as a PAR body or as the
/// authorize query string.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PushedAuthorizationRequestParameters {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.1
    pub response_type: AuthorizationResponseType,
    pub redirect_uri: SmolStr,
    pub state: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    pub code_challenge: SmolStr,
    pub code_challenge_method: AuthorizationCodeChallengeMethod,
    // https://openid.net/specs/openid-connect-core-1_0.html#AuthRequest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<SmolStr>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

#[derive(Serialize, Deserialize)]
pub struct TokenRequestParameters {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
    pub grant_type: TokenGrantType,
    pub code: SmolStr,
    pub redirect_uri: SmolStr,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.5
    pub code_verifier: SmolStr,
}

#[derive(Serialize, Deserialize)]
pub struct RefreshRequestParameters {
    // https://datatracker.ietf.org/doc/html/rfc6749#section-6
    pub grant_type: TokenGrantType,
    pub refresh_token: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
}

// https://datatracker.ietf.org/doc/html/rfc7009#section-2.1
#[derive(Serialize, Deserialize)]
pub struct RevocationRequestParameters {
    pub token: SmolStr,
}
