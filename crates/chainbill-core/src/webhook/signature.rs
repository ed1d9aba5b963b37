//! Webhook payload signing.
//!
//! `signature = hex(HMAC-SHA-256(secret, payload))` over the exact body
//! bytes. Verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the lowercase hex signature for a payload.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex signature.
pub fn verify(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let secret = "whsec_6eac3b24709f46a3bbf099cf5b0a44e65fcb0b69bfe0f344d289c9d9e2a9a725";
        let payload = br#"{"type":"subscription.updated","created_at":1738368000}"#;

        let signature = sign(secret, payload);
        assert!(verify(secret, payload, &signature));
    }

    #[test]
    fn test_flipped_byte_invalidates() {
        let secret = "whsec_abc";
        let payload = b"payload bytes";
        let signature = sign(secret, payload);

        let mut tampered = payload.to_vec();
        tampered[0] ^= 0x01;
        assert!(!verify(secret, &tampered, &signature));
        assert!(!verify("whsec_abd", payload, &signature));
        assert!(!verify(secret, payload, "not-hex"));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA-256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            signature,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }
}
