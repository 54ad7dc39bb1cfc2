//! Challenge-response login.
//!
//! The service never sees the password: it hands out a salt and a one-time
//! challenge, and the client answers with
//! `SHA-256(challenge ‖ SHA-256(salt ‖ utf8(password)))`.

use base64::Engine;
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};

/// Header carrying the session token on every authenticated request.
pub const TOKEN_HEADER: &str = "X-Zenfolio-Token";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthChallenge {
    #[serde(deserialize_with = "de_bytes")]
    pub password_salt: Vec<u8>,
    #[serde(deserialize_with = "de_bytes")]
    pub challenge: Vec<u8>,
}

/// Byte arrays arrive either base64-encoded or as JSON integer arrays.
fn de_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Base64(String),
        Array(Vec<u8>),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Array(bytes) => Ok(bytes),
        Raw::Base64(s) => base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom),
    }
}

fn salted_hash(salt: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the proof sent back to `Authenticate`.
pub fn compute_proof(challenge: &AuthChallenge, password: &str) -> [u8; 32] {
    let password_hash = salted_hash(&challenge.password_salt, password.as_bytes());
    salted_hash(&challenge.challenge, &password_hash)
}

/// Tokens are opaque strings; only report whether one is present.
pub fn redact_token(token: Option<&str>) -> &'static str {
    match token {
        Some(_) => "<redacted>",
        None => "<none>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_proof_known_vector() {
        let challenge = AuthChallenge {
            password_salt: vec![1, 2, 3],
            challenge: vec![4, 5, 6],
        };
        assert_eq!(
            hex(&compute_proof(&challenge, "secret")),
            "72af22acde957e361655f8d1dfa51d0b107b3f3bb2b46e7fce7c09d3897c2bff"
        );
    }

    #[test]
    fn test_proof_changes_with_challenge() {
        let a = AuthChallenge {
            password_salt: vec![1, 2, 3],
            challenge: vec![4, 5, 6],
        };
        let b = AuthChallenge {
            challenge: vec![4, 5, 7],
            ..a.clone()
        };
        assert_ne!(compute_proof(&a, "secret"), compute_proof(&b, "secret"));
    }

    #[test]
    fn test_challenge_accepts_base64_and_arrays() {
        let from_b64: AuthChallenge =
            serde_json::from_value(json!({"PasswordSalt": "AQID", "Challenge": [4, 5, 6]})).unwrap();
        assert_eq!(from_b64.password_salt, vec![1, 2, 3]);
        assert_eq!(from_b64.challenge, vec![4, 5, 6]);
    }

    #[test]
    fn test_challenge_rejects_bad_base64() {
        let r: Result<AuthChallenge, _> =
            serde_json::from_value(json!({"PasswordSalt": "!!!", "Challenge": []}));
        assert!(r.is_err());
    }

    #[test]
    fn test_redact_token() {
        assert_eq!(redact_token(Some("abc")), "<redacted>");
        assert_eq!(redact_token(None), "<none>");
    }
}
