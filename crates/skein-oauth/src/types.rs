mod client_metadata;
mod metadata;
mod request;
mod response;
mod token;

pub use self::client_metadata::*;
pub use self::metadata::*;
pub use self::request::*;
pub use self::response::*;
pub use self::token::*;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizeOptionPrompt {
    Login,
    None,
    Consent,
    SelectAccount,
}

impl From<AuthorizeOptionPrompt> for SmolStr {
    fn from(value: AuthorizeOptionPrompt) -> Self {
        SmolStr::new_static(match value {
            AuthorizeOptionPrompt::Login => "login",
            AuthorizeOptionPrompt::None => "none",
            AuthorizeOptionPrompt::Consent => "consent",
            AuthorizeOptionPrompt::SelectAccount => "select_account",
        })
    }
}

/// Per-attempt overrides for [`OAuthClient::start_auth`](crate::client::OAuthClient::start_auth).
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Defaults to the first configured redirect URI
    pub redirect_uri: Option<url::Url>,
    /// Defaults to the configured scopes
    pub scopes: Option<Vec<SmolStr>>,
    pub prompt: Option<AuthorizeOptionPrompt>,
}

/// Query parameters delivered to the redirect URI.
///
/// On failure the server sends `error` (and maybe `error_description`) instead
/// of `code`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<SmolStr>,
    pub state: Option<SmolStr>,
    pub iss: Option<SmolStr>,
    pub error: Option<SmolStr>,
    pub error_description: Option<SmolStr>,
}
