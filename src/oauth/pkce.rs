//! PKCE (RFC 7636) and OAuth state generation.
//!
//! Verifiers and states are random bytes encoded as unpadded base64url.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// PKCE challenge method (RFC 7636)
pub const CHALLENGE_METHOD: &str = "S256";

/// PKCE code verifier and challenge pair.
#[derive(Clone)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Create a new random verifier/challenge pair following RFC 7636 recommendations.
    pub fn generate() -> Self {
        // 48 bytes encode to 64 characters, inside the 43..=128 range
        let verifier = random_urlsafe(48);
        let challenge = code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// CSRF state token: 32 random bytes, URL-safe (43 characters).
pub fn generate_state() -> String {
    random_urlsafe(32)
}

fn random_urlsafe(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_urlsafe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn verifier_meets_length_requirement() {
        let pair = PkcePair::generate();
        assert!(pair.verifier().len() >= 43);
        assert!(pair.verifier().len() <= 128);
        assert!(is_urlsafe(pair.verifier()));
        assert_eq!(pair.challenge(), code_challenge(pair.verifier()));
    }

    #[test]
    fn challenge_matches_rfc7636_example() {
        // Appendix B of RFC 7636
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn state_has_enough_entropy() {
        let state = generate_state();
        assert_eq!(state.len(), 43);
        assert!(is_urlsafe(&state));
        assert_ne!(state, generate_state());
    }
}
