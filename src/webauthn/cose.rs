//! Minimal COSE_Key parsing for the one algorithm this relying party
//! accepts: EC2 / P-256 (COSE alg ES256, -7).

use crate::error::AuthorityError;
use ciborium::value::{Integer, Value};
use p256::ecdsa::{Signature, VerifyingKey};
use p256::EncodedPoint;
use std::io::Cursor;

const COSE_KTY_EC2: i128 = 2;
const COSE_ALG_ES256: i128 = -7;
const COSE_CRV_P256: i128 = 1;

fn key_as_i128(v: &Value) -> Option<i128> {
    match v {
        Value::Integer(i) => Some((*i).into()),
        _ => None,
    }
}

fn map_get<'a>(map: &'a [(Value, Value)], key: i128) -> Option<&'a Value> {
    map.iter().find(|(k, _)| key_as_i128(k) == Some(key)).map(|(_, v)| v)
}

fn as_bytes(v: &Value) -> Option<&[u8]> {
    match v {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

/// Parse a COSE_Key CBOR map and produce the corresponding P-256 verifying
/// key. Rejects anything that isn't EC2/P-256/ES256 — the only algorithm
/// this relying party advertises in its `pubKeyCredParams` (§4.4.1).
pub fn parse_p256_verifying_key(cose_bytes: &[u8]) -> Result<VerifyingKey, AuthorityError> {
    let value: Value = ciborium::de::from_reader(Cursor::new(cose_bytes))
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("malformed COSE key".into()))?;
    let Value::Map(map) = value else {
        return Err(AuthorityError::CeremonyVerificationFailed("COSE key is not a map".into()));
    };

    let kty = map_get(&map, 1).and_then(key_as_i128);
    let alg = map_get(&map, 3).and_then(key_as_i128);
    let crv = map_get(&map, -1).and_then(key_as_i128);
    if kty != Some(COSE_KTY_EC2) || alg != Some(COSE_ALG_ES256) || crv != Some(COSE_CRV_P256) {
        return Err(AuthorityError::CeremonyVerificationFailed("unsupported COSE key algorithm".into()));
    }

    let x = map_get(&map, -2).and_then(as_bytes).ok_or_else(|| {
        AuthorityError::CeremonyVerificationFailed("COSE key missing x coordinate".into())
    })?;
    let y = map_get(&map, -3).and_then(as_bytes).ok_or_else(|| {
        AuthorityError::CeremonyVerificationFailed("COSE key missing y coordinate".into())
    })?;

    let point = EncodedPoint::from_affine_coordinates(x.into(), y.into(), false);
    VerifyingKey::from_encoded_point(&point)
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("invalid P-256 point".into()))
}

/// Build a COSE_Key CBOR encoding for a P-256 verifying key — used only by
/// test fixtures that stand in for a real authenticator.
#[cfg(test)]
pub fn encode_p256_cose_key(key: &VerifyingKey) -> Vec<u8> {
    let point = key.to_encoded_point(false);
    let x = point.x().unwrap().to_vec();
    let y = point.y().unwrap().to_vec();
    let map = Value::Map(vec![
        (Value::Integer(Integer::from(1i64)), Value::Integer(Integer::from(COSE_KTY_EC2 as i64))),
        (Value::Integer(Integer::from(3i64)), Value::Integer(Integer::from(COSE_ALG_ES256 as i64))),
        (Value::Integer(Integer::from(-1i64)), Value::Integer(Integer::from(COSE_CRV_P256 as i64))),
        (Value::Integer(Integer::from(-2i64)), Value::Bytes(x)),
        (Value::Integer(Integer::from(-3i64)), Value::Bytes(y)),
    ]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&map, &mut out).expect("COSE key always serializes");
    out
}

/// Verify an ECDSA/P-256 signature (DER-encoded, as WebAuthn authenticators
/// emit) over `signed_data` using the credential's stored COSE public key.
pub fn verify_signature(
    cose_bytes: &[u8],
    signed_data: &[u8],
    signature_der: &[u8],
) -> Result<(), AuthorityError> {
    use p256::ecdsa::signature::Verifier;

    let verifying_key = parse_p256_verifying_key(cose_bytes)?;
    let signature = Signature::from_der(signature_der)
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("malformed signature".into()))?;
    verifying_key
        .verify(signed_data, &signature)
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("signature verification failed".into()))
}

/// Determine how many leading bytes of `data` make up one complete CBOR
/// item, by decoding it and reporting the cursor's resting position. Used
/// to split the COSE key from any trailing extension block in
/// authenticator data, since CBOR items are self-delimiting but the
/// authenticator data format gives no explicit length prefix.
pub fn cbor_item_len(data: &[u8]) -> Result<usize, AuthorityError> {
    let mut cursor = Cursor::new(data);
    let _value: Value = ciborium::de::from_reader(&mut cursor)
        .map_err(|_| AuthorityError::CeremonyVerificationFailed("malformed CBOR".into()))?;
    Ok(cursor.position() as usize)
}
