use crate::types::AtStrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Namespaced identifier naming a record collection, e.g. `app.example.topic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Nsid(SmolStr);

/// Regex for NSID validation per AT Protocol spec
pub static NSID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+(\.[a-zA-Z][a-zA-Z0-9]{0,62})$").unwrap()
});

impl Nsid {
    /// Fallible constructor, validates
    pub fn new(nsid: impl AsRef<str>) -> Result<Self, AtStrError> {
        let nsid = nsid.as_ref();
        if nsid.len() > 317 {
            Err(AtStrError::too_long("nsid", nsid, 317, nsid.len()))
        } else if !NSID_REGEX.is_match(nsid) {
            Err(AtStrError::regex(
                "nsid",
                nsid,
                SmolStr::new_static("invalid"),
            ))
        } else {
            Ok(Self(SmolStr::new(nsid)))
        }
    }

    /// Final segment, e.g. `topic` for `app.example.topic`
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }

    /// String representation
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Nsid {
    type Err = AtStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Nsid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Nsid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
