use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};
use smol_str::SmolStr;

use crate::types::{AtStrError, Did};

/// Scheme prefix for repository URIs
pub const AT_SCHEME: &str = "at://";

/// Maximum AT-URI length in bytes.
pub const AT_URI_MAX_LEN: usize = 8 * 1024;

/// A repository record address, `at://{did}/{collection}/{rkey}`.
///
/// Parsing is lenient about the trailing parts: `at://did:plc:abc` and
/// `at://did:plc:abc/app.example.topic` are accepted with the missing fields
/// left empty. The scheme and the authority are required.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    /// Repository authority, normally a DID
    pub did: SmolStr,
    /// Collection NSID, empty when absent
    pub collection: SmolStr,
    /// Record key, empty when absent
    pub rkey: SmolStr,
}

impl AtUri {
    /// Assemble a URI from its parts without validation.
    pub fn new(
        did: impl Into<SmolStr>,
        collection: impl Into<SmolStr>,
        rkey: impl Into<SmolStr>,
    ) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse `at://{did}[/{collection}[/{rkey}]]`.
    pub fn parse(uri: &str) -> Result<Self, AtStrError> {
        if uri.len() > AT_URI_MAX_LEN {
            return Err(AtStrError::too_long("at-uri", uri, AT_URI_MAX_LEN, uri.len()));
        }
        let Some(rest) = uri.strip_prefix(AT_SCHEME) else {
            return Err(AtStrError::missing("at-uri", uri, "at:// scheme", Some(0)));
        };
        let rest = rest.split(['?', '#']).next().unwrap_or_default();

        let mut parts = rest.splitn(4, '/');
        let did = parts.next().unwrap_or_default();
        if did.is_empty() {
            return Err(AtStrError::missing(
                "at-uri",
                uri,
                "repository authority",
                Some(AT_SCHEME.len()),
            ));
        }
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();
        if parts.next().is_some_and(|extra| !extra.is_empty()) {
            return Err(AtStrError::regex(
                "at-uri",
                uri,
                SmolStr::new_static("too many path segments"),
            ));
        }
        if collection.is_empty() && !rkey.is_empty() {
            return Err(AtStrError::missing(
                "at-uri",
                uri,
                "collection before record key",
                Some(AT_SCHEME.len() + did.len() + 1),
            ));
        }

        Ok(Self::new(did, collection, rkey))
    }

    /// The authority as a validated DID, when it is one.
    pub fn repo_did(&self) -> Result<Did, AtStrError> {
        Did::new(&self.did)
    }

    /// True when both collection and record key are present.
    pub fn is_record(&self) -> bool {
        !self.collection.is_empty() && !self.rkey.is_empty()
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{AT_SCHEME}{}", self.did)?;
        if !self.collection.is_empty() {
            write!(f, "/{}", self.collection)?;
            if !self.rkey.is_empty() {
                write!(f, "/{}", self.rkey)?;
            }
        }
        Ok(())
    }
}

impl FromStr for AtUri {
    type Err = AtStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AtUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AtUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}
