//! Crypto primitives shared by the OAuth server and auth middleware.
//!
//! Nothing here is novel: SHA-256 hashing for stored secrets, random hex
//! material for codes and tokens, constant-time comparison for anything an
//! attacker could probe by timing, PKCE S256 per RFC 7636, and bcrypt
//! verification for password digests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefixes that mark a stored password as a bcrypt digest.
const BCRYPT_PREFIXES: [&str; 3] = ["$2a$", "$2b$", "$2y$"];

/// SHA-256 of `input`, hex-encoded. Used for stored secrets and token hashes.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// 32 bytes of OS randomness, hex-encoded (64 chars). Token and code material.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time string equality.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// `BASE64URL(SHA-256(verifier))`, the S256 challenge derivation.
pub fn pkce_challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Check a PKCE verifier against its stored S256 challenge.
pub fn verify_pkce_s256(verifier: &str, challenge: &str) -> bool {
    pkce_challenge_s256(verifier)
        .as_bytes()
        .ct_eq(challenge.as_bytes())
        .into()
}

/// Whether a stored password looks like a bcrypt digest
/// (`$2a$`/`$2b$`/`$2y$` followed by a two-digit cost and `$`).
pub fn is_bcrypt_digest(stored: &str) -> bool {
    BCRYPT_PREFIXES.iter().any(|p| {
        stored
            .strip_prefix(p)
            .is_some_and(|rest| rest.len() > 3 && rest.as_bytes()[..2].iter().all(u8::is_ascii_digit) && rest.as_bytes()[2] == b'$')
    })
}

/// Verify a candidate password against a stored value: bcrypt when the value
/// is a digest, constant-time plaintext comparison otherwise.
pub fn verify_password(candidate: &str, stored: &str) -> bool {
    if is_bcrypt_digest(stored) {
        bcrypt::verify(candidate, stored).unwrap_or(false)
    } else {
        constant_time_eq(candidate, stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // Known vector for the empty string.
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_random_token_shape() {
        let token = random_token();
        assert_eq!(token.len(), 64);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(token, random_token());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "different"));
        assert!(!constant_time_eq("same", "samex"));
    }

    #[test]
    fn test_pkce_verify() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = pkce_challenge_s256(verifier);
        // RFC 7636 appendix B vector.
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert!(verify_pkce_s256(verifier, &challenge));
        assert!(!verify_pkce_s256("wrong", &challenge));
    }

    #[test]
    fn test_pkce_single_byte_perturbation() {
        let verifier = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQ";
        let challenge = pkce_challenge_s256(verifier);
        let mut perturbed = verifier.to_string().into_bytes();
        perturbed[0] ^= 1;
        let perturbed = String::from_utf8(perturbed).unwrap();
        assert!(!verify_pkce_s256(&perturbed, &challenge));
    }

    #[test]
    fn test_bcrypt_detection() {
        assert!(is_bcrypt_digest(
            "$2b$12$abcdefghijklmnopqrstuvABCDEFGHIJKLMNOPQRSTUVWXYZ012345"
        ));
        assert!(is_bcrypt_digest("$2a$04$x$"));
        assert!(is_bcrypt_digest("$2y$10$whatever"));
        assert!(!is_bcrypt_digest("plaintext"));
        assert!(!is_bcrypt_digest("$2c$10$x"));
        assert!(!is_bcrypt_digest("$2b$1$x"));
    }

    #[test]
    fn test_verify_password_plaintext() {
        assert!(verify_password("testpass", "testpass"));
        assert!(!verify_password("wrong", "testpass"));
    }

    #[test]
    fn test_verify_password_bcrypt() {
        // Low cost keeps the test fast.
        let digest = bcrypt::hash("testpass", 4).unwrap();
        assert!(verify_password("testpass", &digest));
        assert!(!verify_password("wrong", &digest));
    }
}
