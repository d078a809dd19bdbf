//! PKCE login material
//!
//! One `LoginAttempt` is generated per hit on the login endpoint. The
//! verifier/challenge pair follows RFC 7636 `S256`; the state token is an
//! independent CSRF guard round-tripped through the provider.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use sha2::{Digest, Sha256};

/// PKCE material for a single login attempt
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    /// One-time CSRF state token
    pub state: String,
    /// PKCE code verifier, kept server-side until the callback
    pub code_verifier: String,
    /// `base64url(sha256(code_verifier))`, sent to the provider
    pub code_challenge: String,
}

/// Generate verifier, challenge, and state for one login attempt
pub fn generate_login_attempt() -> LoginAttempt {
    // 32 random bytes -> 43 base64url chars, the RFC 7636 minimum
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let code_challenge = derive_challenge(&code_verifier);

    let state_bytes: [u8; 24] = rand::rng().random();
    let state = URL_SAFE_NO_PAD.encode(state_bytes);

    LoginAttempt {
        state,
        code_verifier,
        code_challenge,
    }
}

/// Derive the S256 code challenge from a verifier
pub fn derive_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate an opaque session id with 256 bits of entropy.
/// The id is the sole session credential, so it must be unguessable.
pub fn generate_session_id() -> String {
    let id_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(id_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_meets_pkce_minimum_length() {
        let attempt = generate_login_attempt();
        assert!(attempt.code_verifier.len() >= 43);
    }

    #[test]
    fn challenge_is_sha256_of_verifier() {
        let attempt = generate_login_attempt();
        assert_eq!(
            attempt.code_challenge,
            derive_challenge(&attempt.code_verifier)
        );
    }

    #[test]
    fn rederived_challenge_always_matches() {
        for _ in 0..20 {
            let attempt = generate_login_attempt();
            let mut hasher = Sha256::new();
            hasher.update(attempt.code_verifier.as_bytes());
            let expected = URL_SAFE_NO_PAD.encode(hasher.finalize());
            assert_eq!(attempt.code_challenge, expected);
        }
    }

    #[test]
    fn material_is_base64url_safe() {
        let attempt = generate_login_attempt();
        for value in [
            &attempt.state,
            &attempt.code_verifier,
            &attempt.code_challenge,
        ] {
            assert!(!value.contains('+'));
            assert!(!value.contains('/'));
            assert!(!value.contains('='));
        }
    }

    #[test]
    fn attempts_are_unique() {
        let a = generate_login_attempt();
        let b = generate_login_attempt();
        assert_ne!(a.state, b.state);
        assert_ne!(a.code_verifier, b.code_verifier);
        assert_ne!(a.code_challenge, b.code_challenge);
    }

    #[test]
    fn state_is_independent_of_verifier() {
        let attempt = generate_login_attempt();
        assert_ne!(attempt.state, attempt.code_verifier);
        assert_ne!(attempt.state, attempt.code_challenge);
    }

    #[test]
    fn session_ids_carry_enough_entropy() {
        let id = generate_session_id();
        // 32 bytes -> 43 base64url chars
        assert_eq!(id.len(), 43);
        assert_ne!(id, generate_session_id());
    }
}
