//! HMAC token derivation and verification.
//!
//! Canonical string is `"{uid}:{path}:{expires}"` with `expires` as
//! decimal epoch seconds. Tokens are accepted as hex or unpadded
//! URL-safe base64; both comparisons are constant-time. Verification
//! fails closed on an unparseable or elapsed `expires`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

fn mac_bytes(uid: &str, path: &str, expires: &str, secret: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(format!("{}:{}:{}", uid, path, expires).as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

/// Derive the hex token for `(uid, path, expires)`.
pub fn generate(uid: &str, path: &str, expires: &str, secret: &[u8]) -> String {
    mac_bytes(uid, path, expires, secret).map(hex::encode).unwrap_or_default()
}

/// Verify a presented token against `(uid, path, expires)`.
pub fn verify(uid: &str, path: &str, expires: &str, token: &str, secret: &[u8]) -> bool {
    let Ok(expire_time) = expires.parse::<i64>() else {
        return false;
    };
    if chrono::Utc::now().timestamp() > expire_time {
        return false;
    }

    let Some(digest) = mac_bytes(uid, path, expires, secret) else {
        return false;
    };

    let expected_hex = hex::encode(&digest);
    if bool::from(expected_hex.as_bytes().ct_eq(token.as_bytes())) {
        return true;
    }

    let expected_b64 = URL_SAFE_NO_PAD.encode(&digest);
    bool::from(expected_b64.as_bytes().ct_eq(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"unit-test-secret";
    const FAR_FUTURE: &str = "9999999999";

    #[test]
    fn generated_hex_token_verifies() {
        let token = generate("315", "video/x/index.m3u8", FAR_FUTURE, SECRET);
        assert_eq!(token.len(), 64);
        assert!(verify("315", "video/x/index.m3u8", FAR_FUTURE, &token, SECRET));
    }

    #[test]
    fn urlsafe_base64_form_verifies() {
        let digest = mac_bytes("315", "p", FAR_FUTURE, SECRET).unwrap();
        let b64 = URL_SAFE_NO_PAD.encode(&digest);
        assert!(!b64.ends_with('='));
        assert!(verify("315", "p", FAR_FUTURE, &b64, SECRET));
    }

    #[test]
    fn single_bit_flip_fails() {
        let mut token = generate("315", "p", FAR_FUTURE, SECRET).into_bytes();
        // Flip one hex digit
        token[0] = if token[0] == b'0' { b'1' } else { b'0' };
        let token = String::from_utf8(token).unwrap();
        assert!(!verify("315", "p", FAR_FUTURE, &token, SECRET));
    }

    #[test]
    fn expired_timestamp_fails_closed() {
        let token = generate("315", "p", "1000000000", SECRET);
        assert!(!verify("315", "p", "1000000000", &token, SECRET));
    }

    #[test]
    fn garbage_expires_fails_closed() {
        let token = generate("315", "p", FAR_FUTURE, SECRET);
        assert!(!verify("315", "p", "soon", &token, SECRET));
        assert!(!verify("315", "p", "", &token, SECRET));
    }

    #[test]
    fn token_is_bound_to_uid_and_path() {
        let token = generate("315", "video/a/enc.key", FAR_FUTURE, SECRET);
        assert!(!verify("316", "video/a/enc.key", FAR_FUTURE, &token, SECRET));
        assert!(!verify("315", "video/b/enc.key", FAR_FUTURE, &token, SECRET));
    }

    #[test]
    fn different_secrets_do_not_cross_verify() {
        let token = generate("315", "p", FAR_FUTURE, b"playback-secret");
        assert!(!verify("315", "p", FAR_FUTURE, &token, b"js-secret"));
    }
}
