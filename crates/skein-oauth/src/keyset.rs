//! Client signing keys for `private_key_jwt` authentication.

use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, JwkSet, Key, Parameters, crypto};
use p256::ecdsa::SigningKey;
use smol_str::SmolStr;
use thiserror::Error;

use crate::jose::{create_signed_jwt, jws::RegisteredHeader, jwt::Claims};
use crate::utils::compare_algos;

#[derive(Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error("keyset must contain at least one key")]
    #[diagnostic(code(skein_oauth::keyset::empty))]
    EmptyKeyset,
    #[error("every key in the keyset needs a `kid`")]
    #[diagnostic(code(skein_oauth::keyset::missing_kid))]
    MissingKid,
    #[error("duplicate key id `{0}`")]
    #[diagnostic(code(skein_oauth::keyset::duplicate_kid))]
    DuplicateKid(SmolStr),
    #[error("key `{kid}` is not a P-256 private key")]
    #[diagnostic(
        code(skein_oauth::keyset::unsupported_key),
        help("client assertions are signed with ES256; supply EC P-256 keys including `d`")
    )]
    UnsupportedKey { kid: SmolStr },
    #[error("no key can sign with any of {0:?}")]
    #[diagnostic(code(skein_oauth::keyset::no_compatible_key))]
    NoCompatibleKey(Vec<SmolStr>),
    #[error(transparent)]
    #[diagnostic(code(skein_oauth::keyset::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone)]
struct SigningEntry {
    kid: SmolStr,
    secret: p256::SecretKey,
}

/// The client's private keys, each identified by `kid`.
#[derive(Clone)]
pub struct Keyset(Vec<SigningEntry>);

impl Keyset {
    /// A keyset holding one freshly generated ES256 key.
    pub fn generate(kid: impl Into<SmolStr>) -> Self {
        Self(vec![SigningEntry {
            kid: kid.into(),
            secret: p256::SecretKey::random(&mut rand::rngs::ThreadRng::default()),
        }])
    }

    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.kid.as_str())
    }

    /// Public halves of every key, for the client metadata `jwks` member.
    pub fn public_jwks(&self) -> JwkSet {
        JwkSet {
            keys: self
                .0
                .iter()
                .map(|entry| Jwk {
                    key: Key::from(&crypto::Key::from(entry.secret.public_key())),
                    prm: Parameters {
                        kid: Some(entry.kid.to_string()),
                        alg: Some(Algorithm::Signing(Signing::Es256)),
                        ..Default::default()
                    },
                })
                .collect(),
        }
    }

    /// Sign `claims` with the first key supporting the most preferred of `algs`.
    pub fn create_jwt(&self, algs: &[SmolStr], claims: Claims) -> Result<SmolStr> {
        let mut algs = algs.to_vec();
        algs.sort_by(compare_algos);
        if !algs.iter().any(|a| a == "ES256") {
            return Err(Error::NoCompatibleKey(algs));
        }
        let entry = self.0.first().ok_or(Error::EmptyKeyset)?;
        let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
        header.kid = Some(entry.kid.clone());
        Ok(create_signed_jwt(
            SigningKey::from(entry.secret.clone()),
            header.into(),
            claims,
        )?)
    }
}

impl TryFrom<Vec<Jwk>> for Keyset {
    type Error = Error;

    fn try_from(keys: Vec<Jwk>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::EmptyKeyset);
        }
        let mut entries: Vec<SigningEntry> = Vec::with_capacity(keys.len());
        for jwk in keys {
            let kid = SmolStr::new(jwk.prm.kid.as_deref().ok_or(Error::MissingKid)?);
            if entries.iter().any(|e| e.kid == kid) {
                return Err(Error::DuplicateKid(kid));
            }
            let secret = match crypto::Key::try_from(&jwk.key) {
                Ok(crypto::Key::P256(crypto::Kind::Secret(sk))) => sk,
                _ => return Err(Error::UnsupportedKey { kid }),
            };
            entries.push(SigningEntry { kid, secret });
        }
        Ok(Self(entries))
    }
}

impl std::fmt::Debug for Keyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::jwt::RegisteredClaims;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn private_jwk(kid: Option<&str>) -> Jwk {
        let sk = p256::SecretKey::random(&mut rand::rngs::ThreadRng::default());
        Jwk {
            key: Key::from(&crypto::Key::from(sk)),
            prm: Parameters {
                kid: kid.map(String::from),
                ..Default::default()
            },
        }
    }

    #[test]
    fn rejects_bad_keysets() {
        assert!(matches!(Keyset::try_from(vec![]), Err(Error::EmptyKeyset)));
        assert!(matches!(
            Keyset::try_from(vec![private_jwk(None)]),
            Err(Error::MissingKid)
        ));
        assert!(matches!(
            Keyset::try_from(vec![private_jwk(Some("a")), private_jwk(Some("a"))]),
            Err(Error::DuplicateKid(_))
        ));
    }

    #[test]
    fn public_jwks_have_no_private_part() {
        let keyset = Keyset::try_from(vec![private_jwk(Some("k1"))]).unwrap();
        let json = serde_json::to_value(keyset.public_jwks()).unwrap();
        let key = &json["keys"][0];
        assert_eq!(key["kid"], "k1");
        assert_eq!(key["crv"], "P-256");
        assert!(key.get("d").is_none());
    }

    #[test]
    fn jwt_carries_kid() {
        let keyset = Keyset::generate("client-key");
        let jwt = keyset
            .create_jwt(
                &["RS256".into(), "ES256".into()],
                RegisteredClaims {
                    iss: Some("https://client.example/metadata.json".into()),
                    ..Default::default()
                }
                .into(),
            )
            .unwrap();
        let header: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(jwt.split('.').next().unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(header["kid"], "client-key");
        assert_eq!(header["alg"], "ES256");
    }

    #[test]
    fn no_es256_no_jwt() {
        let keyset = Keyset::generate("k");
        assert!(matches!(
            keyset.create_jwt(&["RS256".into()], Claims::default()),
            Err(Error::NoCompatibleKey(_))
        ));
    }
}
