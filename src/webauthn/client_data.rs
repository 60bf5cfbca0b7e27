//! Parses the `clientDataJSON` blob produced by the browser's WebAuthn API.

use crate::codec;
use crate::error::AuthorityError;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ClientData {
    #[serde(rename = "type")]
    pub type_: String,
    pub challenge: String,
    pub origin: String,
}

/// Parse and validate `clientDataJSON` against the expected ceremony type,
/// the stored challenge nonce, and the set of permitted origins (§4.4.1
/// step 2, §4.4.2 step 2).
pub fn parse_and_verify(
    client_data_json: &[u8],
    expected_type: &str,
    expected_nonce: &[u8],
    allowed_origins: &[String],
) -> Result<ClientData, AuthorityError> {
    let client_data: ClientData = serde_json::from_slice(client_data_json)
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("malformed client data".into()))?;

    if client_data.type_ != expected_type {
        return Err(AuthorityError::CeremonyVerificationFailed(format!(
            "unexpected ceremony type: {}",
            client_data.type_
        )));
    }

    let decoded_challenge = codec::decode(&client_data.challenge)
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("malformed challenge encoding".into()))?;
    if decoded_challenge != expected_nonce {
        return Err(AuthorityError::CeremonyVerificationFailed("challenge mismatch".into()));
    }

    if !allowed_origins.iter().any(|o| o == &client_data.origin) {
        return Err(AuthorityError::CeremonyVerificationFailed(format!(
            "origin not permitted: {}",
            client_data.origin
        )));
    }

    Ok(client_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cd_json(type_: &str, challenge: &str, origin: &str) -> Vec<u8> {
        serde_json::json!({ "type": type_, "challenge": challenge, "origin": origin })
            .to_string()
            .into_bytes()
    }

    #[test]
    fn accepts_matching_client_data() {
        let nonce = b"abc123nonce";
        let challenge_b64 = codec::encode(nonce);
        let json = cd_json("webauthn.create", &challenge_b64, "https://example.com");
        let origins = vec!["https://example.com".to_string()];
        assert!(parse_and_verify(&json, "webauthn.create", nonce, &origins).is_ok());
    }

    #[test]
    fn rejects_wrong_type() {
        let nonce = b"abc123nonce";
        let challenge_b64 = codec::encode(nonce);
        let json = cd_json("webauthn.get", &challenge_b64, "https://example.com");
        let origins = vec!["https://example.com".to_string()];
        assert!(parse_and_verify(&json, "webauthn.create", nonce, &origins).is_err());
    }

    #[test]
    fn rejects_mismatched_challenge() {
        let nonce = b"abc123nonce";
        let challenge_b64 = codec::encode(b"different-nonce");
        let json = cd_json("webauthn.create", &challenge_b64, "https://example.com");
        let origins = vec!["https://example.com".to_string()];
        assert!(parse_and_verify(&json, "webauthn.create", nonce, &origins).is_err());
    }

    #[test]
    fn rejects_unpermitted_origin() {
        let nonce = b"abc123nonce";
        let challenge_b64 = codec::encode(nonce);
        let json = cd_json("webauthn.create", &challenge_b64, "https://evil.example");
        let origins = vec!["https://example.com".to_string()];
        assert!(parse_and_verify(&json, "webauthn.create", nonce, &origins).is_err());
    }
}
