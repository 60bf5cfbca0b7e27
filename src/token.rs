//! Signed token service — mint, parse, validate, and revoke compact
//! bearer tokens composed of three dot-separated URL-safe base64 segments.

use crate::codec;
use crate::db::Db;
use crate::error::AuthorityError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

impl Default for Header {
    fn default() -> Self {
        Header { alg: "HS256", typ: "AUTH" }
    }
}

/// The payload carried by a minted token. Roles are the names assigned at
/// mint time — never resolved permissions (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub display_name: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// A subject's attributes as supplied to `mint`.
pub struct Subject {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

pub struct TokenService {
    signing_key: [u8; 32],
}

impl TokenService {
    pub fn new(signing_key: [u8; 32]) -> Self {
        TokenService { signing_key }
    }

    /// Mint a token with the given lifetime; returns the compact token and
    /// the token identifier (jti), which doubles as the session's primary
    /// key (§9 open question: session row PK IS the token identifier).
    pub fn mint(&self, subject: &Subject, lifetime: chrono::Duration) -> (String, String) {
        let jti = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let claims = Claims {
            sub: subject.user_id.clone(),
            display_name: subject.display_name.clone(),
            email: subject.email.clone(),
            roles: subject.roles.clone(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: jti.clone(),
        };
        let header = Header::default();
        let header_b64 = codec::encode(&serde_json::to_vec(&header).expect("header always serializes"));
        let payload_b64 = codec::encode(&serde_json::to_vec(&claims).expect("claims always serialize"));
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = self.sign(signing_input.as_bytes());
        let sig_b64 = codec::encode(&signature);
        (format!("{header_b64}.{payload_b64}.{sig_b64}"), jti)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Validate a token: structural check, constant-time signature
    /// verification, expiry, then (unless `skip_revocation_check`) a
    /// revocation lookup against the session store by jti (§4.2).
    pub fn validate(
        &self,
        token: &str,
        db: &Db,
        skip_revocation_check: bool,
    ) -> Result<Claims, AuthorityError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthorityError::InvalidTokenFormat);
        }
        let [header_b64, payload_b64, sig_b64] = [parts[0], parts[1], parts[2]];
        let header_bytes = codec::decode(header_b64).map_err(|_| AuthorityError::InvalidTokenFormat)?;
        let payload_bytes = codec::decode(payload_b64).map_err(|_| AuthorityError::InvalidTokenFormat)?;
        let sig_bytes = codec::decode(sig_b64).map_err(|_| AuthorityError::InvalidTokenFormat)?;
        let _header: Header =
            serde_json::from_slice(&header_bytes).map_err(|_| AuthorityError::InvalidTokenFormat)?;
        let claims: Claims =
            serde_json::from_slice(&payload_bytes).map_err(|_| AuthorityError::InvalidTokenFormat)?;

        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("HMAC accepts any key length");
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&sig_bytes).map_err(|_| AuthorityError::InvalidSignature)?;

        if Utc::now().timestamp() >= claims.exp {
            return Err(AuthorityError::TokenExpired);
        }

        if !skip_revocation_check {
            if let Some(session) = db.get_session(&claims.jti)? {
                if session.revoked {
                    return Err(AuthorityError::TokenRevoked);
                }
            }
        }

        // G4: a session is valid only if its user is still active.
        match db.get_user(&claims.sub)? {
            Some(user) if user.is_active => {}
            _ => return Err(AuthorityError::AccountInactive),
        }

        Ok(claims)
    }

    /// Revoke the session row identified by a token's jti. Idempotent;
    /// no-op if no session row exists.
    pub fn revoke(&self, db: &Db, jti: &str) -> Result<(), AuthorityError> {
        db.revoke_session(jti)?;
        Ok(())
    }
}

/// Extract the bearer token from an `Authorization` header value. Returns
/// `None` unless the value matches `Bearer <nonempty>` exactly (ASCII
/// case-sensitive scheme, exactly one space) — §4.2, property P8/scenario 8.
pub fn extract_bearer(header_value: Option<&str>) -> Option<&str> {
    let value = header_value?;
    let rest = value.strip_prefix("Bearer ")?;
    if rest.is_empty() || rest.starts_with(' ') {
        return None;
    }
    Some(rest)
}

pub fn exp_to_datetime(exp_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(exp_secs, 0).unwrap_or_else(Utc::now)
}
