//! Passkey ceremony engine — builds registration/assertion options and
//! verifies attestations and assertions, producing or consuming
//! credentials and terminating into a minted session token.

pub mod authenticator_data;
pub mod client_data;
pub mod cose;

use crate::challenge::ChallengeStore;
use crate::codec;
use crate::db::{ChallengeKind, Credential, Db};
use crate::error::AuthorityError;
use crate::token::{Subject, TokenService};
use ciborium::value::Value;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Cursor;

/// Configures the relying party: its identifier and the full origins it
/// will accept in `clientDataJSON`.
#[derive(Debug, Clone)]
pub struct RelyingParty {
    pub server_domain: String,
    pub origins: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct CeremonyOptions {
    pub challenge_id: String,
    pub options_json: String,
}

pub struct RegisterCompleteRequest<'a> {
    pub challenge_id: &'a str,
    pub credential_id: &'a str,
    pub attestation_object: &'a str,
    pub client_data_json: &'a str,
    pub device_name: Option<&'a str>,
}

pub struct RegisterCompleteResult {
    pub user_id: String,
    pub credential_id: String,
    pub session: SessionInfo,
}

pub struct AuthenticateCompleteRequest<'a> {
    pub challenge_id: &'a str,
    pub credential_id: &'a str,
    pub authenticator_data: &'a str,
    pub client_data_json: &'a str,
    pub signature: &'a str,
    pub user_handle: Option<&'a str>,
}

pub struct AuthenticateCompleteResult {
    pub user_id: String,
    pub display_name: String,
    pub session: SessionInfo,
}

fn fail(msg: impl Into<String>) -> AuthorityError {
    AuthorityError::CeremonyVerificationFailed(msg.into())
}

/// Extract the `authData` byte string from a CBOR attestation object. Only
/// the `none` attestation format is accepted — the object must still be
/// structurally valid (§4.4.1 step 3).
fn parse_attestation_object(bytes: &[u8]) -> Result<Vec<u8>, AuthorityError> {
    let value: Value =
        ciborium::de::from_reader(Cursor::new(bytes)).map_err(|_| fail("malformed attestation object"))?;
    let Value::Map(map) = value else {
        return Err(fail("attestation object is not a map"));
    };
    let get = |key: &str| -> Option<&Value> {
        map.iter()
            .find(|(k, _)| matches!(k, Value::Text(t) if t == key))
            .map(|(_, v)| v)
    };
    let fmt = match get("fmt") {
        Some(Value::Text(t)) => t.as_str(),
        _ => return Err(fail("attestation object missing fmt")),
    };
    if fmt != "none" {
        return Err(fail(format!("unsupported attestation format: {fmt}")));
    }
    match get("authData") {
        Some(Value::Bytes(b)) => Ok(b.clone()),
        _ => Err(fail("attestation object missing authData")),
    }
}

/// §4.4.1 Begin. Upserts a user by email, issues a registration challenge,
/// and returns client options advertising resident-key + user-verification
/// requirements.
pub fn begin_registration(
    db: &Db,
    rp: &RelyingParty,
    challenge_ttl: chrono::Duration,
    email: &str,
    display_name: &str,
) -> Result<CeremonyOptions, AuthorityError> {
    let user = match db.get_user_by_email(email)? {
        Some(user) => user,
        None => db.create_user(&uuid::Uuid::new_v4().to_string(), display_name, Some(email))?,
    };

    let store = ChallengeStore::new(db, challenge_ttl);
    let challenge = store.begin(Some(&user.id), ChallengeKind::Registration)?;

    let options = serde_json::json!({
        "challenge": codec::encode(&challenge.nonce),
        "rp": { "id": rp.server_domain, "name": rp.server_domain },
        "user": {
            "id": codec::encode(user.id.as_bytes()),
            "name": email,
            "displayName": display_name,
        },
        "pubKeyCredParams": [{ "type": "public-key", "alg": -7 }],
        "timeout": 60_000,
        "attestation": "none",
        "authenticatorSelection": {
            "residentKey": "required",
            "requireResidentKey": true,
            "userVerification": "required",
        },
    });

    Ok(CeremonyOptions {
        challenge_id: challenge.id,
        options_json: options.to_string(),
    })
}

/// §4.4.1 Complete.
pub fn complete_registration(
    db: &Db,
    rp: &RelyingParty,
    tokens: &TokenService,
    session_lifetime: chrono::Duration,
    challenge_ttl: chrono::Duration,
    req: &RegisterCompleteRequest,
) -> Result<RegisterCompleteResult, AuthorityError> {
    let store = ChallengeStore::new(db, challenge_ttl);
    let challenge = store.take(req.challenge_id)?.ok_or(AuthorityError::ChallengeNotFound)?;
    let user_id = challenge.user_id.ok_or_else(|| fail("challenge missing user binding"))?;

    let client_data_bytes = codec::decode(req.client_data_json).map_err(|_| fail("malformed client data"))?;
    client_data::parse_and_verify(&client_data_bytes, "webauthn.create", &challenge.nonce, &rp.origins)?;

    let attestation_object = codec::decode(req.attestation_object).map_err(|_| fail("malformed attestation object"))?;
    let auth_data_bytes = parse_attestation_object(&attestation_object)?;
    let auth_data = authenticator_data::parse(&auth_data_bytes)?;

    if !authenticator_data::verify_rp_id_hash(&auth_data, &rp.server_domain) {
        return Err(fail("relying party id mismatch"));
    }
    if !auth_data.user_verified {
        return Err(fail("user verification not performed"));
    }
    let attested = auth_data
        .attested_credential
        .ok_or_else(|| fail("attestation object missing attested credential data"))?;

    let credential_id = codec::encode(&attested.credential_id);
    let credential = Credential {
        id: credential_id.clone(),
        user_id: user_id.clone(),
        public_key: attested.credential_public_key,
        sign_count: auth_data.sign_count as i64,
        aaguid: Some(hex::encode(attested.aaguid)),
        transports: None,
        attestation_format: Some("none".to_string()),
        created_at: chrono::Utc::now(),
        last_used_at: None,
        device_name: req.device_name.map(String::from),
        backup_eligible: false,
        backed_up: false,
    };
    db.insert_credential(&credential)?;
    db.touch_user_login(&user_id)?;

    let user = db.get_user(&user_id)?.ok_or_else(|| fail("user vanished mid-ceremony"))?;
    let subject = Subject {
        user_id: user.id.clone(),
        display_name: user.display_name.clone(),
        email: user.email.clone(),
        roles: db.get_user_roles(&user.id)?.into_iter().map(|r| r.name).collect(),
    };
    let (token, jti) = tokens.mint(&subject, session_lifetime);
    let session = db.insert_session(&jti, &user.id, Some(&credential_id), session_lifetime, None, None)?;

    Ok(RegisterCompleteResult {
        user_id: user.id,
        credential_id,
        session: SessionInfo { token, expires_at: session.expires_at },
    })
}

/// §4.4.2 Begin. Always issues a discoverable challenge: `email` is
/// accepted but ignored, matching the source's "ignored in the
/// discoverable flow" framing rather than the alternative 400 path (§9
/// open question, decided here and recorded in DESIGN.md).
pub fn begin_authentication(
    db: &Db,
    rp: &RelyingParty,
    challenge_ttl: chrono::Duration,
) -> Result<CeremonyOptions, AuthorityError> {
    let store = ChallengeStore::new(db, challenge_ttl);
    let challenge = store.begin(None, ChallengeKind::Authentication)?;

    let options = serde_json::json!({
        "challenge": codec::encode(&challenge.nonce),
        "rpId": rp.server_domain,
        "allowCredentials": [],
        "timeout": 60_000,
        "userVerification": "required",
    });

    Ok(CeremonyOptions {
        challenge_id: challenge.id,
        options_json: options.to_string(),
    })
}

/// §4.4.2 Complete.
pub fn complete_authentication(
    db: &Db,
    rp: &RelyingParty,
    tokens: &TokenService,
    session_lifetime: chrono::Duration,
    challenge_ttl: chrono::Duration,
    req: &AuthenticateCompleteRequest,
) -> Result<AuthenticateCompleteResult, AuthorityError> {
    let store = ChallengeStore::new(db, challenge_ttl);
    let challenge = store.take(req.challenge_id)?.ok_or(AuthorityError::ChallengeNotFound)?;

    let client_data_bytes = codec::decode(req.client_data_json).map_err(|_| fail("malformed client data"))?;
    client_data::parse_and_verify(&client_data_bytes, "webauthn.get", &challenge.nonce, &rp.origins)?;

    let credential = db
        .get_credential(req.credential_id)?
        .ok_or_else(|| fail("unknown credential"))?;

    if let Some(handle) = req.user_handle {
        let decoded = codec::decode(handle).map_err(|_| fail("malformed user handle"))?;
        if decoded != credential.user_id.as_bytes() {
            return Err(fail("user handle does not match credential owner"));
        }
    }

    let auth_data_bytes = codec::decode(req.authenticator_data).map_err(|_| fail("malformed authenticator data"))?;
    let signature = codec::decode(req.signature).map_err(|_| fail("malformed signature"))?;

    let mut signed_data = auth_data_bytes.clone();
    signed_data.extend_from_slice(&Sha256::digest(&client_data_bytes));
    cose::verify_signature(&credential.public_key, &signed_data, &signature)?;

    let auth_data = authenticator_data::parse(&auth_data_bytes)?;
    if !authenticator_data::verify_rp_id_hash(&auth_data, &rp.server_domain) {
        return Err(fail("relying party id mismatch"));
    }
    if !auth_data.user_verified {
        return Err(fail("user verification not performed"));
    }

    let received = auth_data.sign_count as i64;
    db.compare_and_swap_sign_count(&credential.id, |stored| {
        if stored != 0 && received != 0 && received <= stored {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        Ok(received.max(stored))
    })
    .map_err(|_| AuthorityError::CounterRegressed)?;

    let user = db.get_user(&credential.user_id)?.ok_or_else(|| fail("credential owner vanished"))?;
    db.touch_user_login(&user.id)?;

    let subject = Subject {
        user_id: user.id.clone(),
        display_name: user.display_name.clone(),
        email: user.email.clone(),
        roles: db.get_user_roles(&user.id)?.into_iter().map(|r| r.name).collect(),
    };
    let (token, jti) = tokens.mint(&subject, session_lifetime);
    let session = db.insert_session(&jti, &user.id, Some(&credential.id), session_lifetime, None, None)?;

    Ok(AuthenticateCompleteResult {
        user_id: user.id,
        display_name: user.display_name,
        session: SessionInfo { token, expires_at: session.expires_at },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::cose::encode_p256_cose_key;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
    use rand::rngs::OsRng;

    fn rp() -> RelyingParty {
        RelyingParty {
            server_domain: "example.com".to_string(),
            origins: vec!["https://example.com".to_string()],
        }
    }

    fn build_authenticator_data(rp_id: &str, uv: bool, sign_count: u32, attested: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&Sha256::digest(rp_id.as_bytes()));
        let mut flags = 0x01u8; // user present
        if uv {
            flags |= 0x04;
        }
        if attested.is_some() {
            flags |= 0x40;
        }
        out.push(flags);
        out.extend_from_slice(&sign_count.to_be_bytes());
        if let Some(block) = attested {
            out.extend_from_slice(block);
        }
        out
    }

    fn attested_block(credential_id: &[u8], cose_key: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0u8; 16]); // aaguid
        out.extend_from_slice(&(credential_id.len() as u16).to_be_bytes());
        out.extend_from_slice(credential_id);
        out.extend_from_slice(cose_key);
        out
    }

    fn attestation_object(auth_data: &[u8]) -> Vec<u8> {
        let map = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("none".into())),
            (Value::Text("attStmt".into()), Value::Map(vec![])),
            (Value::Text("authData".into()), Value::Bytes(auth_data.to_vec())),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&map, &mut out).unwrap();
        out
    }

    #[test]
    fn full_registration_then_authentication_round_trip() {
        let db = Db::open_memory().unwrap();
        let tokens = TokenService::new([3u8; 32]);
        let relying_party = rp();

        let begin = begin_registration(
            &db,
            &relying_party,
            chrono::Duration::minutes(5),
            "ada@example.com",
            "Ada",
        )
        .unwrap();
        let opts: serde_json::Value = serde_json::from_str(&begin.options_json).unwrap();
        let nonce = codec::decode(opts["challenge"].as_str().unwrap()).unwrap();

        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let cose_key = encode_p256_cose_key(&verifying_key);
        let credential_id_bytes = b"cred-1".to_vec();
        let attested = attested_block(&credential_id_bytes, &cose_key);
        let auth_data = build_authenticator_data("example.com", true, 0, Some(&attested));
        let attestation_obj = attestation_object(&auth_data);

        let client_data_json = serde_json::json!({
            "type": "webauthn.create",
            "challenge": codec::encode(&nonce),
            "origin": "https://example.com",
        })
        .to_string();

        let result = complete_registration(
            &db,
            &relying_party,
            &tokens,
            chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
            &RegisterCompleteRequest {
                challenge_id: &begin.challenge_id,
                credential_id: &codec::encode(&credential_id_bytes),
                attestation_object: &codec::encode(&attestation_obj),
                client_data_json: &codec::encode(client_data_json.as_bytes()),
                device_name: Some("Test device"),
            },
        )
        .unwrap();
        assert_eq!(result.credential_id, codec::encode(&credential_id_bytes));

        // Authentication ceremony against the just-registered credential.
        let login_begin = begin_authentication(&db, &relying_party, chrono::Duration::minutes(5)).unwrap();
        let login_opts: serde_json::Value = serde_json::from_str(&login_begin.options_json).unwrap();
        let login_nonce = codec::decode(login_opts["challenge"].as_str().unwrap()).unwrap();

        let assertion_auth_data = build_authenticator_data("example.com", true, 1, None);
        let login_client_data = serde_json::json!({
            "type": "webauthn.get",
            "challenge": codec::encode(&login_nonce),
            "origin": "https://example.com",
        })
        .to_string();

        let mut signed_data = assertion_auth_data.clone();
        signed_data.extend_from_slice(&Sha256::digest(login_client_data.as_bytes()));
        let signature: Signature = signing_key.sign(&signed_data);

        let login_result = complete_authentication(
            &db,
            &relying_party,
            &tokens,
            chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
            &AuthenticateCompleteRequest {
                challenge_id: &login_begin.challenge_id,
                credential_id: &result.credential_id,
                authenticator_data: &codec::encode(&assertion_auth_data),
                client_data_json: &codec::encode(login_client_data.as_bytes()),
                signature: &codec::encode(signature.to_der().as_bytes()),
                user_handle: None,
            },
        )
        .unwrap();
        assert_eq!(login_result.user_id, result.user_id);
    }

    #[test]
    fn user_handle_is_decoded_before_comparison() {
        let db = Db::open_memory().unwrap();
        let tokens = TokenService::new([3u8; 32]);
        let relying_party = rp();

        let begin = begin_registration(
            &db,
            &relying_party,
            chrono::Duration::minutes(5),
            "ada@example.com",
            "Ada",
        )
        .unwrap();
        let opts: serde_json::Value = serde_json::from_str(&begin.options_json).unwrap();
        let nonce = codec::decode(opts["challenge"].as_str().unwrap()).unwrap();

        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let cose_key = encode_p256_cose_key(&verifying_key);
        let credential_id_bytes = b"cred-handle".to_vec();
        let attested = attested_block(&credential_id_bytes, &cose_key);
        let auth_data = build_authenticator_data("example.com", true, 0, Some(&attested));
        let attestation_obj = attestation_object(&auth_data);
        let client_data_json = serde_json::json!({
            "type": "webauthn.create",
            "challenge": codec::encode(&nonce),
            "origin": "https://example.com",
        })
        .to_string();
        let registered = complete_registration(
            &db,
            &relying_party,
            &tokens,
            chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
            &RegisterCompleteRequest {
                challenge_id: &begin.challenge_id,
                credential_id: &codec::encode(&credential_id_bytes),
                attestation_object: &codec::encode(&attestation_obj),
                client_data_json: &codec::encode(client_data_json.as_bytes()),
                device_name: None,
            },
        )
        .unwrap();

        let login_attempt = |user_handle: Option<String>| {
            let begin = begin_authentication(&db, &relying_party, chrono::Duration::minutes(5)).unwrap();
            let opts: serde_json::Value = serde_json::from_str(&begin.options_json).unwrap();
            let nonce = codec::decode(opts["challenge"].as_str().unwrap()).unwrap();
            let assertion_auth_data = build_authenticator_data("example.com", true, 1, None);
            let client_data_json = serde_json::json!({
                "type": "webauthn.get",
                "challenge": codec::encode(&nonce),
                "origin": "https://example.com",
            })
            .to_string();
            let mut signed_data = assertion_auth_data.clone();
            signed_data.extend_from_slice(&Sha256::digest(client_data_json.as_bytes()));
            let signature: Signature = signing_key.sign(&signed_data);
            complete_authentication(
                &db,
                &relying_party,
                &tokens,
                chrono::Duration::hours(1),
                chrono::Duration::minutes(5),
                &AuthenticateCompleteRequest {
                    challenge_id: &begin.challenge_id,
                    credential_id: &registered.credential_id,
                    authenticator_data: &codec::encode(&assertion_auth_data),
                    client_data_json: &codec::encode(client_data_json.as_bytes()),
                    signature: &codec::encode(signature.to_der().as_bytes()),
                    user_handle: user_handle.as_deref(),
                },
            )
        };

        // The handle the relying party hands to the authenticator at
        // registration is the base64url encoding of the raw user id bytes
        // (§4.4.1's `"id": codec::encode(user.id.as_bytes())`), so a real
        // client echoes that same encoding back as `userHandle`.
        let correct_handle = codec::encode(registered.user_id.as_bytes());
        assert!(login_attempt(Some(correct_handle)).is_ok());

        let wrong_handle = codec::encode(b"not-the-right-user");
        assert!(login_attempt(Some(wrong_handle)).is_err());
    }

    #[test]
    fn unknown_challenge_id_is_terminal() {
        let db = Db::open_memory().unwrap();
        let tokens = TokenService::new([3u8; 32]);
        let relying_party = rp();
        let err = complete_authentication(
            &db,
            &relying_party,
            &tokens,
            chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
            &AuthenticateCompleteRequest {
                challenge_id: "nope",
                credential_id: "nope",
                authenticator_data: "",
                client_data_json: "",
                signature: "",
                user_handle: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AuthorityError::ChallengeNotFound));
    }
}
