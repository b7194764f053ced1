use jose_jwa::Algorithm;
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(flatten)]
    pub registered: RegisteredHeader,
}

impl From<Header> for super::Header {
    fn from(header: Header) -> Self {
        super::Header::Jws(header)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredHeader {
    pub alg: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<SmolStr>,
}

impl From<Algorithm> for RegisteredHeader {
    fn from(alg: Algorithm) -> Self {
        Self {
            alg,
            jwk: None,
            kid: None,
            typ: None,
        }
    }
}

impl From<RegisteredHeader> for super::Header {
    fn from(registered: RegisteredHeader) -> Self {
        super::Header::Jws(Header { registered })
    }
}
