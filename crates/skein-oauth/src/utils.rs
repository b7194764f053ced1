use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use std::cmp::Ordering;

/// Random `state` value: 16 bytes, base64url.
pub fn generate_nonce() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
        .into()
}

/// PKCE code verifier: 43 random bytes, base64url (58 characters).
pub fn generate_verifier() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 43>(&mut ThreadRng::default()))
        .into()
}

pub fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// S256 challenge for a verifier.
pub fn pkce_challenge(verifier: &str) -> SmolStr {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier)).into()
}

/// Returns `(challenge, verifier)`.
pub fn generate_pkce() -> (SmolStr, SmolStr) {
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.1
    let verifier = generate_verifier();
    (pkce_challenge(&verifier), verifier)
}

// 256K > ES (256 > 384 > 512) > PS (256 > 384 > 512) > RS (256 > 384 > 512) > other (in original order)
pub fn compare_algos(a: &SmolStr, b: &SmolStr) -> Ordering {
    if a == "ES256K" {
        return Ordering::Less;
    }
    if b == "ES256K" {
        return Ordering::Greater;
    }
    for prefix in ["ES", "PS", "RS"] {
        if let Some(stripped_a) = a.strip_prefix(prefix) {
            if let Some(stripped_b) = b.strip_prefix(prefix) {
                if let (Ok(len_a), Ok(len_b)) =
                    (stripped_a.parse::<u32>(), stripped_b.parse::<u32>())
                {
                    return len_a.cmp(&len_b);
                }
            } else {
                return Ordering::Less;
            }
        } else if b.starts_with(prefix) {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// Compare secrets without an early exit on the first differing byte.
///
/// Length is not hidden.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_is_43_bytes_encoded() {
        let v = generate_verifier();
        assert_eq!(v.len(), 58);
        assert_eq!(URL_SAFE_NO_PAD.decode(v.as_str()).unwrap().len(), 43);
    }

    #[test]
    fn challenge_is_sha256_of_verifier() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let (challenge, verifier) = generate_pkce();
            let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            assert_eq!(challenge, expected);
            assert_eq!(challenge.len(), 43);
            assert!((43..=128).contains(&verifier.len()));
            assert!(seen.insert(verifier));
        }
    }

    #[test]
    fn rfc7636_appendix_b_vector() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn state_values_are_unique() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE_NO_PAD.decode(a.as_str()).unwrap().len(), 16);
    }

    #[test]
    fn algos_sort_preferred_first() {
        let mut algs: Vec<SmolStr> = ["RS256", "ES384", "PS256", "ES256", "EdDSA"]
            .into_iter()
            .map(SmolStr::new_static)
            .collect();
        algs.sort_by(compare_algos);
        assert_eq!(algs[0], "ES256");
        assert_eq!(algs[1], "ES384");
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
