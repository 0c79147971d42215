//! PKCE (RFC 7636) verifier/challenge generation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

pub const VERIFIER_LENGTH: usize = 128;

/// Verifier kept locally plus the challenge sent with the authorize request.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let verifier = generate_verifier(VERIFIER_LENGTH);
        let challenge = derive_challenge(&verifier);
        Self { verifier, challenge }
    }

    pub fn method(&self) -> &'static str {
        "S256"
    }
}

/// Draw `length` characters uniformly from the unreserved URI alphabet.
pub fn generate_verifier(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| VERIFIER_CHARSET[rng.gen_range(0..VERIFIER_CHARSET.len())] as char)
        .collect()
}

/// BASE64URL(SHA256(verifier)) without padding.
pub fn derive_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Random opaque value for the `state` parameter.
pub fn generate_state() -> String {
    let bytes: [u8; 24] = rand::thread_rng().r#gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_length_and_alphabet() {
        let v = generate_verifier(VERIFIER_LENGTH);
        assert_eq!(v.len(), 128);
        assert!(v.bytes().all(|b| VERIFIER_CHARSET.contains(&b)));

        let short = generate_verifier(43);
        assert_eq!(short.len(), 43);
    }

    #[test]
    fn test_verifiers_are_unique() {
        assert_ne!(generate_verifier(128), generate_verifier(128));
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn test_challenge_known_vector() {
        // RFC 7636 appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            derive_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_challenge_is_deterministic_and_url_safe() {
        for _ in 0..32 {
            let pair = PkceChallenge::generate();
            assert_eq!(pair.challenge, derive_challenge(&pair.verifier));
            assert_eq!(pair.challenge.len(), 43);
            assert!(!pair.challenge.contains('='));
            assert!(!pair.challenge.contains('+'));
            assert!(!pair.challenge.contains('/'));
        }
        assert_eq!(PkceChallenge::generate().method(), "S256");
    }
}
