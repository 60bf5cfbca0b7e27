//! URL-safe base-64 without padding — the one binary encoding every other
//! component speaks (tokens, challenge nonces, credential ids, COSE keys).

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

/// Encode bytes as URL-safe base64 with no padding. Never emits `=`.
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode URL-safe base64, tolerating both padded and unpadded input.
/// Rejects any character outside the URL-safe alphabet (and, for padded
/// input, a malformed padding tail).
pub fn decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if s.len() % 4 == 0 && (s.ends_with('=') || s.contains('=')) {
        return URL_SAFE.decode(s);
    }
    URL_SAFE_NO_PAD.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_arbitrary_bytes() {
        for len in [0usize, 1, 2, 3, 4, 5, 16, 32, 255] {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 37 % 256) as u8).collect();
            let encoded = encode(&bytes);
            assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            assert!(!encoded.contains('='));
            assert_eq!(decode(&encoded).unwrap(), bytes);
        }
    }

    #[test]
    fn decode_tolerates_padding() {
        let bytes = b"hello world!";
        let padded = base64::engine::general_purpose::URL_SAFE.encode(bytes);
        assert!(padded.ends_with('='));
        assert_eq!(decode(&padded).unwrap(), bytes.to_vec());
    }

    #[test]
    fn decode_rejects_invalid_alphabet() {
        assert!(decode("not valid base64!!").is_err());
    }

    #[test]
    fn empty_round_trips() {
        assert_eq!(encode(&[]), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }
}
