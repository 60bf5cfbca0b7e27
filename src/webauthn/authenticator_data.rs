//! Parses the `authenticatorData` byte string embedded in both attestation
//! objects (registration) and assertions (authentication).
//!
//! Layout (WebAuthn §6.1): rpIdHash(32) || flags(1) || signCount(4, BE) ||
//! [attestedCredentialData] || [extensions].

use crate::error::AuthorityError;

const FLAG_USER_PRESENT: u8 = 0x01;
const FLAG_USER_VERIFIED: u8 = 0x04;
const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;
const FLAG_EXTENSION_DATA: u8 = 0x80;

pub struct AttestedCredentialData {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    /// Raw COSE_Key CBOR bytes, exactly as transmitted — stored verbatim
    /// as the credential's opaque public key (§3 Credential.publicKey).
    pub credential_public_key: Vec<u8>,
}

pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub user_present: bool,
    pub user_verified: bool,
    pub sign_count: u32,
    pub attested_credential: Option<AttestedCredentialData>,
}

fn fail(msg: &str) -> AuthorityError {
    AuthorityError::CeremonyVerificationFailed(format!("malformed authenticator data: {msg}"))
}

/// Parse the fixed header plus, if the AT flag is set, the attested
/// credential data block. Extension data (if present) is not required by
/// any invariant in scope and is ignored.
pub fn parse(data: &[u8]) -> Result<AuthenticatorData, AuthorityError> {
    if data.len() < 37 {
        return Err(fail("too short for fixed header"));
    }
    let mut rp_id_hash = [0u8; 32];
    rp_id_hash.copy_from_slice(&data[0..32]);
    let flags = data[32];
    let sign_count = u32::from_be_bytes(data[33..37].try_into().unwrap());

    let user_present = flags & FLAG_USER_PRESENT != 0;
    let user_verified = flags & FLAG_USER_VERIFIED != 0;
    let has_attested = flags & FLAG_ATTESTED_CREDENTIAL_DATA != 0;

    let attested_credential = if has_attested {
        let rest = &data[37..];
        if rest.len() < 18 {
            return Err(fail("truncated attested credential data"));
        }
        let mut aaguid = [0u8; 16];
        aaguid.copy_from_slice(&rest[0..16]);
        let cred_id_len = u16::from_be_bytes([rest[16], rest[17]]) as usize;
        let cred_id_start = 18;
        let cred_id_end = cred_id_start + cred_id_len;
        if rest.len() < cred_id_end {
            return Err(fail("truncated credential id"));
        }
        let credential_id = rest[cred_id_start..cred_id_end].to_vec();

        let key_bytes = &rest[cred_id_end..];
        let consumed = super::cose::cbor_item_len(key_bytes)?;
        if key_bytes.len() < consumed {
            return Err(fail("truncated credential public key"));
        }
        let credential_public_key = key_bytes[..consumed].to_vec();

        Some(AttestedCredentialData { aaguid, credential_id, credential_public_key })
    } else {
        None
    };

    Ok(AuthenticatorData { rp_id_hash, user_present, user_verified, sign_count, attested_credential })
}

/// Verify the relying-party-id hash embeds the expected server domain
/// (§4.4.1 step 4).
pub fn verify_rp_id_hash(auth_data: &AuthenticatorData, server_domain: &str) -> bool {
    use sha2::{Digest, Sha256};
    let expected = Sha256::digest(server_domain.as_bytes());
    auth_data.rp_id_hash.as_slice() == expected.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_byte(up: bool, uv: bool, at: bool) -> u8 {
        let mut b = 0u8;
        if up {
            b |= FLAG_USER_PRESENT;
        }
        if uv {
            b |= FLAG_USER_VERIFIED;
        }
        if at {
            b |= FLAG_ATTESTED_CREDENTIAL_DATA;
        }
        b
    }

    #[test]
    fn parses_fixed_header_without_attested_data() {
        let mut data = vec![0u8; 37];
        data[32] = flags_byte(true, true, false);
        data[33..37].copy_from_slice(&42u32.to_be_bytes());
        let parsed = parse(&data).unwrap();
        assert!(parsed.user_present);
        assert!(parsed.user_verified);
        assert_eq!(parsed.sign_count, 42);
        assert!(parsed.attested_credential.is_none());
    }

    #[test]
    fn rejects_too_short_input() {
        assert!(parse(&[0u8; 10]).is_err());
    }
}
