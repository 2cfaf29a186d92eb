//! PKCE (Proof Key for Code Exchange)
//!
//! Implements RFC 7636 for the authorization code flow, plus the state
//! parameter that defends the callback against CSRF and replay.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE code verifier and challenge pair
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// The code verifier (kept secret, sent in token exchange)
    pub verifier: String,
    /// The code challenge (sent in authorization request)
    pub challenge: String,
}

/// Challenge method; always S256.
pub const CHALLENGE_METHOD: &str = "S256";

impl PkcePair {
    /// Generate a new verifier/challenge pair.
    ///
    /// The verifier is 32 random bytes base64url-encoded without padding,
    /// landing inside the 43-128 character range RFC 7636 requires.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 32] = rng.gen();
        let verifier = URL_SAFE_NO_PAD.encode(random_bytes);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }

    /// Verify that a verifier matches a challenge.
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize()) == challenge
    }
}

/// Generate the state parameter: 16 random bytes, hex-encoded.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// A callback state is valid only in the exact 32-hex-char shape we issue.
pub fn is_valid_state(state: &str) -> bool {
    state.len() == 32 && state.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_length_in_rfc_range() {
        let pkce = PkcePair::generate();
        assert!(pkce.verifier.len() >= 43);
        assert!(pkce.verifier.len() <= 128);
        // 32 bytes base64url without padding is exactly 43 characters
        assert_eq!(pkce.verifier.len(), 43);
        assert_eq!(pkce.challenge.len(), 43);
    }

    #[test]
    fn test_challenge_matches_verifier() {
        let pkce = PkcePair::generate();
        assert!(PkcePair::verify(&pkce.verifier, &pkce.challenge));
        assert!(!PkcePair::verify("wrong_verifier", &pkce.challenge));
    }

    #[test]
    fn test_generation_is_unique() {
        let a = PkcePair::generate();
        let b = PkcePair::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn test_state_shape() {
        let state = generate_state();
        assert_eq!(state.len(), 32);
        assert!(is_valid_state(&state));
    }

    #[test]
    fn test_state_validation_boundaries() {
        assert!(is_valid_state("0123456789abcdef0123456789abcdef"));
        // Wrong lengths
        assert!(!is_valid_state("0123456789abcdef0123456789abcde"));
        assert!(!is_valid_state("0123456789abcdef0123456789abcdef0"));
        assert!(!is_valid_state(""));
        // Non-hex characters
        assert!(!is_valid_state("0123456789abcdef0123456789abcdeg"));
    }
}
