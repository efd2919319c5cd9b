//! HMAC-SHA-256 message tags.
//!
//! Both transports carry the tag as base64 text: HTTP in the `HashSHA256`
//! header, gRPC in the `hashsha256` metadata entry (metadata keys are
//! lowercase on the wire).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HTTP header carrying the body tag.
pub const HASH_HEADER: &str = "HashSHA256";

/// gRPC metadata key carrying the request-message tag.
pub const HASH_METADATA_KEY: &str = "hashsha256";

/// Raw HMAC-SHA-256 of `payload` under `key`.
pub fn sign(key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Base64 tag of `payload` under `key`.
pub fn tag(key: &[u8], payload: &[u8]) -> String {
    BASE64.encode(sign(key, payload))
}

/// Verify a base64 tag against `payload`. Constant-time on the MAC compare.
pub fn verify(key: &[u8], payload: &[u8], tag: &str) -> bool {
    let Ok(expected) = BASE64.decode(tag) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tag = tag(b"secret", b"payload");
        assert!(verify(b"secret", b"payload", &tag));
    }

    #[test]
    fn rejects_other_key() {
        let tag = tag(b"secret", b"payload");
        assert!(!verify(b"other", b"payload", &tag));
    }

    #[test]
    fn rejects_tampered_payload() {
        let tag = tag(b"secret", b"payload");
        assert!(!verify(b"secret", b"payload!", &tag));
    }

    #[test]
    fn rejects_garbage_tag() {
        assert!(!verify(b"secret", b"payload", "not base64 *** at all"));
    }
}
