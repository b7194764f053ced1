use crate::types::AtStrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

/// A validated decentralized identifier, e.g. `did:plc:ewvi7nxzyoun6zhxrhs64oiz`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

/// Regex for DID validation per AT Protocol spec.
///
/// Allows `%` in the identifier but not at the end. Percent-encoding is not
/// checked for well-formedness.
pub static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

/// Maximum DID length in bytes.
pub const DID_MAX_LEN: usize = 2048;

/// The resolution method named by a DID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DidMethod {
    /// `did:plc`, resolved through a PLC directory
    Plc,
    /// `did:web`, derived from the host name
    Web,
    /// Anything else; carries the method name
    Other(SmolStr),
}

impl DidMethod {
    /// Method name as it appears in the DID
    pub fn as_str(&self) -> &str {
        match self {
            Self::Plc => "plc",
            Self::Web => "web",
            Self::Other(m) => m.as_str(),
        }
    }
}

impl fmt::Display for DidMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Did {
    /// Fallible constructor, validates. A leading `at://` is stripped.
    pub fn new(did: impl AsRef<str>) -> Result<Self, AtStrError> {
        let did = did.as_ref();
        let did = did.strip_prefix("at://").unwrap_or(did);
        if did.len() > DID_MAX_LEN {
            Err(AtStrError::too_long("did", did, DID_MAX_LEN, did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(AtStrError::regex(
                "did",
                did,
                SmolStr::new_static("invalid"),
            ))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// Fallible constructor for literals, doesn't allocate
    pub fn new_static(did: &'static str) -> Result<Self, AtStrError> {
        if did.len() > DID_MAX_LEN {
            Err(AtStrError::too_long("did", did, DID_MAX_LEN, did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(AtStrError::regex(
                "did",
                did,
                SmolStr::new_static("invalid"),
            ))
        } else {
            Ok(Self(SmolStr::new_static(did)))
        }
    }

    /// The method segment
    pub fn method(&self) -> DidMethod {
        match self.method_str() {
            "plc" => DidMethod::Plc,
            "web" => DidMethod::Web,
            other => DidMethod::Other(SmolStr::new(other)),
        }
    }

    fn method_str(&self) -> &str {
        // validated: always `did:<method>:<id>`
        self.0[4..].split(':').next().unwrap_or_default()
    }

    /// Everything after `did:<method>:`
    pub fn identifier(&self) -> &str {
        &self.0[4 + self.method_str().len() + 1..]
    }

    /// String representation
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Did {
    type Err = AtStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}", self.0)
    }
}

impl From<Did> for String {
    fn from(value: Did) -> Self {
        value.0.to_string()
    }
}

impl From<Did> for SmolStr {
    fn from(value: Did) -> Self {
        value.0
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_dids() {
        assert!(Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").is_ok());
        assert!(Did::new("did:web:example.com").is_ok());
        assert!(Did::new("did:web:localhost%3A8080").is_ok());
        assert!(Did::new("did:key:zQ3shZc2QzApp2oymGvQbzP8eKheVshBHbU4ZYjeXqwSKEn6N").is_ok());
    }

    #[test]
    fn prefix_stripping() {
        let did = Did::new("at://did:plc:foo").unwrap();
        assert_eq!(did.as_str(), "did:plc:foo");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Did::new("").is_err());
        assert!(Did::new("plc:foo").is_err());
        assert!(Did::new("did:PLC:foo").is_err());
        assert!(Did::new("did:plc:foo:").is_err());
        assert!(Did::new("did:plc:foo%").is_err());
        assert!(Did::new("did:plc:foo bar").is_err());
    }

    #[test]
    fn max_length() {
        let id = "a".repeat(DID_MAX_LEN - "did:plc:".len());
        assert!(Did::new(format!("did:plc:{id}")).is_ok());
        assert!(Did::new(format!("did:plc:{id}a")).is_err());
    }

    #[test]
    fn method_and_identifier() {
        let plc = Did::new("did:plc:abc123").unwrap();
        assert_eq!(plc.method(), DidMethod::Plc);
        assert_eq!(plc.identifier(), "abc123");

        let web = Did::new("did:web:example.com").unwrap();
        assert_eq!(web.method(), DidMethod::Web);
        assert_eq!(web.identifier(), "example.com");

        let key = Did::new("did:key:zabc").unwrap();
        assert_eq!(key.method(), DidMethod::Other("key".into()));
    }

    #[test]
    fn serde_validates() {
        let ok: Did = serde_json::from_str("\"did:plc:abc\"").unwrap();
        assert_eq!(ok.as_str(), "did:plc:abc");
        assert!(serde_json::from_str::<Did>("\"nope\"").is_err());
    }
}
