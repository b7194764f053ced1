use super::response::OAuthTokenType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use skein_common::types::Did;
use smol_str::SmolStr;

/// Tokens issued to one account, plus where they came from.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub iss: SmolStr,
    pub sub: Did,
    /// The PDS URL the access token is meant for
    pub aud: SmolStr,
    pub scope: Option<SmolStr>,

    pub refresh_token: Option<SmolStr>,
    pub access_token: SmolStr,
    pub token_type: OAuthTokenType,

    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// `expires_at <= now + within`. A token set without an expiry never expires;
    /// a window past the end of time covers every expiry.
    pub fn is_expiring(&self, now: DateTime<Utc>, within: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| now.checked_add_signed(within).is_none_or(|limit| at <= limit))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_expiring(now, Duration::zero())
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("iss", &self.iss)
            .field("sub", &self.sub)
            .field("aud", &self.aud)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
